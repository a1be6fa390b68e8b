//! The pool's control loop: a single-owner actor task holding every mutable
//! pool table (idle list, in-flight map, device-affinity map, waiter queue,
//! stats), mutated only by processing [`Command`]s (spec.md §5).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use super::conn::{Health, PooledSocket, classify_health};
use super::stats::{PoolStats, ResponseTimeWindow};
use super::{PoolConfig, PoolStrategy};
use crate::error::{Error, PoolErrorKind, Result};

/// A physical socket and its pool-tracked metadata, while it's either idle
/// or checked out.
pub(crate) struct Slot {
    id: u64,
    socket: Arc<PooledSocket>,
    device: Option<Box<str>>,
    last_used: Instant,
    op_count: u64,
    err_count: u64,
    health: Health,
}

impl Slot {
    pub(crate) fn new(id: u64, socket: Arc<PooledSocket>) -> Self {
        Self {
            id,
            socket,
            device: None,
            last_used: Instant::now(),
            op_count: 0,
            err_count: 0,
            health: Health::Healthy,
        }
    }
}

/// What a successful checkout hands back to the caller, via [`super::Pool::with_connection`].
pub(crate) struct CheckoutGrant {
    pub(crate) slot_id: u64,
    pub(crate) socket: Arc<PooledSocket>,
    pub(crate) is_overflow: bool,
}

struct Waiter {
    device: Option<Box<str>>,
    respond_to: oneshot::Sender<Result<CheckoutGrant>>,
}

/// Messages the pool actor processes, one at a time, in receipt order.
pub(crate) enum Command {
    Checkout {
        device: Option<Box<str>>,
        respond_to: oneshot::Sender<Result<CheckoutGrant>>,
    },
    Checkin {
        slot_id: u64,
        is_overflow: bool,
        device: Option<Box<str>>,
        had_error: bool,
        duration: Duration,
    },
    Stats {
        respond_to: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

struct Counters {
    total_checkouts: u64,
    total_checkins: u64,
    response_times: ResponseTimeWindow,
}

impl Counters {
    fn new() -> Self {
        Self {
            total_checkouts: 0,
            total_checkins: 0,
            response_times: ResponseTimeWindow::new(),
        }
    }
}

pub(crate) struct State {
    name: Arc<str>,
    config: PoolConfig,
    next_id: u64,
    idle: VecDeque<Slot>,
    in_flight: HashMap<u64, Slot>,
    overflow_ids: HashSet<u64>,
    device_map: HashMap<Box<str>, u64>,
    waiters: VecDeque<Waiter>,
    counters: Counters,
    shutting_down: bool,
}

impl State {
    pub(crate) fn new(name: Arc<str>, config: PoolConfig, idle: VecDeque<Slot>, next_id: u64) -> Self {
        Self {
            name,
            config,
            next_id,
            idle,
            in_flight: HashMap::new(),
            overflow_ids: HashSet::new(),
            device_map: HashMap::new(),
            waiters: VecDeque::new(),
            counters: Counters::new(),
            shutting_down: false,
        }
    }

    async fn spawn_slot(&mut self) -> Result<Slot> {
        let socket = PooledSocket::bind(
            self.config.bind_addr,
            self.config.max_message_size,
            self.config.warn_on_source_mismatch,
        )
        .await?;
        let id = self.next_id;
        self.next_id += 1;
        Ok(Slot::new(id, socket))
    }

    fn activate(&mut self, slot: Slot, is_overflow: bool) -> CheckoutGrant {
        let grant = CheckoutGrant {
            slot_id: slot.id,
            socket: Arc::clone(&slot.socket),
            is_overflow,
        };
        if is_overflow {
            self.overflow_ids.insert(slot.id);
        }
        self.in_flight.insert(slot.id, slot);
        self.counters.total_checkouts += 1;
        grant
    }

    /// Un-does [`State::activate`] for a grant nobody picked up (the waiter
    /// that would have received it already gave up on a checkout timeout).
    fn abandon(&mut self, grant: CheckoutGrant) {
        if grant.is_overflow {
            self.overflow_ids.remove(&grant.slot_id);
            grant.socket.close();
            return;
        }
        if let Some(slot) = self.in_flight.remove(&grant.slot_id) {
            self.idle.push_back(slot);
        }
    }

    /// Try to satisfy a checkout immediately: device-affinity hit, any idle
    /// slot (FIFO and round-robin both take the head and return to the
    /// tail; see spec.md §9's REDESIGN FLAG on the distinction), or a fresh
    /// overflow connection if there's room. Returns `None` if the pool (base
    /// + overflow) is fully checked out.
    async fn try_checkout(&mut self, device: Option<Box<str>>) -> Option<CheckoutGrant> {
        if self.config.strategy == PoolStrategy::DeviceAffinity
            && let Some(d) = device.as_deref()
            && let Some(&slot_id) = self.device_map.get(d)
            && let Some(pos) = self.idle.iter().position(|s| s.id == slot_id)
        {
            let slot = self.idle.remove(pos).unwrap();
            return Some(self.activate(slot, false));
        }

        if let Some(slot) = self.idle.pop_front() {
            return Some(self.activate(slot, false));
        }

        if self.overflow_ids.len() < self.config.max_overflow {
            match self.spawn_slot().await {
                Ok(slot) => return Some(self.activate(slot, true)),
                Err(e) => {
                    tracing::error!(pool.name = %self.name, error = %e, "failed to create overflow connection");
                    return None;
                }
            }
        }

        None
    }

    async fn handle_checkout(&mut self, device: Option<Box<str>>, respond_to: oneshot::Sender<Result<CheckoutGrant>>) {
        if self.shutting_down {
            let _ = respond_to.send(Err(Error::pool(self.name.clone(), PoolErrorKind::ShuttingDown)));
            return;
        }
        // A pool configured with no base and no overflow capacity can never
        // satisfy a checkout, no matter how long a waiter sits in the
        // queue -- fail fast with `Exhausted` (`no_connections`) rather
        // than making the caller wait out the full checkout timeout.
        if self.config.size == 0 && self.config.max_overflow == 0 {
            let _ = respond_to.send(Err(Error::pool(self.name.clone(), PoolErrorKind::Exhausted)));
            return;
        }
        match self.try_checkout(device.clone()).await {
            Some(grant) => {
                let _ = respond_to.send(Ok(grant));
            }
            None => self.waiters.push_back(Waiter { device, respond_to }),
        }
    }

    async fn handle_checkin(
        &mut self,
        slot_id: u64,
        is_overflow: bool,
        device: Option<Box<str>>,
        had_error: bool,
        duration: Duration,
    ) {
        let Some(mut slot) = self.in_flight.remove(&slot_id) else {
            tracing::debug!(pool.name = %self.name, slot_id, "checkin for unknown slot (already closed?)");
            return;
        };

        self.counters.total_checkins += 1;
        self.counters.response_times.push(duration.as_millis() as u64);
        slot.op_count += 1;
        if had_error {
            slot.err_count += 1;
        }
        slot.last_used = Instant::now();
        if let Some(d) = device {
            self.device_map.insert(d.clone(), slot.id);
            slot.device = Some(d);
        }

        if is_overflow {
            self.overflow_ids.remove(&slot_id);
            slot.socket.close();
        } else {
            slot.health = classify_health(slot.err_count, Duration::ZERO);
            if slot.health == Health::Unhealthy {
                tracing::warn!(pool.name = %self.name, slot_id, err_count = slot.err_count, "closing unhealthy connection on checkin");
                slot.socket.close();
                match self.spawn_slot().await {
                    Ok(fresh) => self.idle.push_back(fresh),
                    Err(e) => tracing::error!(pool.name = %self.name, error = %e, "failed to replace unhealthy connection"),
                }
            } else {
                self.idle.push_back(slot);
            }
        }

        self.dispatch_waiters().await;
    }

    /// After a checkin frees capacity, hand it to the longest-waiting
    /// checkout -- strict FIFO among waiters (spec.md §5).
    async fn dispatch_waiters(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            match self.try_checkout(waiter.device.clone()).await {
                Some(grant) => {
                    // `send` hands the value back on failure, so a waiter
                    // that already gave up on a checkout timeout doesn't
                    // lose us the slot: reclaim it and keep looking.
                    if let Err(Ok(grant)) = waiter.respond_to.send(Ok(grant)) {
                        self.abandon(grant);
                        continue;
                    }
                }
                None => {
                    self.waiters.push_front(waiter);
                    break;
                }
            }
        }
    }

    async fn health_scan(&mut self) {
        let now = Instant::now();
        let len = self.idle.len();
        let mut replaced = 0u32;
        for _ in 0..len {
            let mut slot = self.idle.pop_front().unwrap();
            let idle_for = now.saturating_duration_since(slot.last_used);
            slot.health = classify_health(slot.err_count, idle_for);
            if slot.health == Health::Unhealthy {
                slot.socket.close();
                match self.spawn_slot().await {
                    Ok(fresh) => {
                        self.idle.push_back(fresh);
                        replaced += 1;
                    }
                    Err(e) => {
                        tracing::error!(pool.name = %self.name, error = %e, "failed to replace unhealthy connection during health scan");
                        self.idle.push_back(slot);
                    }
                }
            } else {
                self.idle.push_back(slot);
            }
        }
        if replaced > 0 {
            tracing::warn!(pool.name = %self.name, replaced, "health scan replaced unhealthy idle connections");
        }
    }

    fn snapshot_stats(&self) -> PoolStats {
        let mut healthy = 0;
        let mut degraded = 0;
        let mut unhealthy = 0;
        for slot in &self.idle {
            match slot.health {
                Health::Healthy => healthy += 1,
                Health::Degraded => degraded += 1,
                Health::Unhealthy => unhealthy += 1,
            }
        }
        PoolStats {
            active: self.in_flight.len(),
            idle: self.idle.len(),
            overflow: self.overflow_ids.len(),
            total_checkouts: self.counters.total_checkouts,
            total_checkins: self.counters.total_checkins,
            healthy,
            degraded,
            unhealthy,
            response_times_ms: self.counters.response_times.snapshot(),
        }
    }

    async fn handle_shutdown(&mut self, respond_to: oneshot::Sender<()>) {
        self.shutting_down = true;
        for slot in self.idle.drain(..) {
            slot.socket.close();
        }
        for (_, slot) in self.in_flight.drain() {
            slot.socket.close();
        }
        while let Some(waiter) = self.waiters.pop_front() {
            let _ = waiter
                .respond_to
                .send(Err(Error::pool(self.name.clone(), PoolErrorKind::ShuttingDown)));
        }
        let _ = respond_to.send(());
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Checkout { device, respond_to } => self.handle_checkout(device, respond_to).await,
            Command::Checkin {
                slot_id,
                is_overflow,
                device,
                had_error,
                duration,
            } => self.handle_checkin(slot_id, is_overflow, device, had_error, duration).await,
            Command::Stats { respond_to } => {
                let _ = respond_to.send(self.snapshot_stats());
            }
            Command::Shutdown { respond_to } => self.handle_shutdown(respond_to).await,
        }
    }
}

/// The actor task body: owns `state` exclusively, processes commands from
/// `rx`, and runs the periodic health scan on its own timer.
pub(crate) async fn run(mut state: State, mut rx: mpsc::Receiver<Command>) {
    let name = state.name.clone();
    let mut health_tick = tokio::time::interval(state.config.health_check_interval.max(Duration::from_millis(1)));
    health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    health_tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            maybe_cmd = rx.recv() => {
                match maybe_cmd {
                    Some(Command::Shutdown { respond_to }) => {
                        state.handle_shutdown(respond_to).await;
                        break;
                    }
                    Some(cmd) => state.handle(cmd).await,
                    None => break,
                }
            }
            _ = health_tick.tick() => {
                state.health_scan().await;
            }
        }
    }

    tracing::debug!(pool.name = %name, "pool actor stopped");
}
