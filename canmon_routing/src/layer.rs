//! The routing layer.
//!
//! Three workers run once started. The event worker waits on the event
//! FIFO's condvar (the mesh radio sets it via `queue_mesh_event`) and
//! handles topology events under the table mutex. The send worker drains
//! resolved outbound messages into the mesh radio. The receive worker
//! owns each inbound heap message and notifies subscribers.
//!
//! A routing-table update completes, and its notice is delivered, before
//! `send_message` observes the new table: both paths serialise on the
//! table mutex.

use crate::error::RoutingError;
use crate::event::{MeshEvent, RoutingNotice, RoutingObserver};
use crate::table::{NeighbourEntry, NeighbourTable, NodeId, RouteEntry, RoutingTable};
use canmon_common::clock::Clock;
use canmon_common::config::{ConfigFile, RoutingKnobs};
use canmon_common::consts::MAX_SUBSCRIBERS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a message is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One destination, resolved through the routing table.
    Unicast,
    /// Substring group: every destination containing the group id.
    Multicast,
    /// Every known neighbour.
    Broadcast,
}

/// Interface to the mesh radio's data plane.
pub trait MeshRadio: Send + Sync {
    /// Hand one message to the radio for the given next hop.
    fn send(&self, next_hop: &str, data: &[u8]) -> Result<(), RoutingError>;
}

/// In-process mesh radio recording every send (simulation and tests).
#[derive(Default)]
pub struct SimMeshRadio {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail_sends: AtomicBool,
}

impl SimMeshRadio {
    /// Create a radio that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (test hook).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Every `(next_hop, payload)` handed to the radio so far.
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MeshRadio for SimMeshRadio {
    fn send(&self, next_hop: &str, data: &[u8]) -> Result<(), RoutingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RoutingError::Radio("simulated radio failure".to_string()));
        }
        let mut sent = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push((next_hop.to_string(), data.to_vec()));
        Ok(())
    }
}

// ─── Worker FIFOs ──────────────────────────────────────────────────

struct Fifo<T> {
    inner: Mutex<(VecDeque<T>, bool)>,
    ready: Condvar,
}

impl<T> Fifo<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new((VecDeque::new(), false)),
            ready: Condvar::new(),
        }
    }

    fn push(&self, item: T) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.1 {
            return;
        }
        inner.0.push_back(item);
        self.ready.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(item) = inner.0.pop_front() {
                return Some(item);
            }
            if inner.1 {
                return None;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _timeout_result) = match self.ready.wait_timeout(inner, remaining) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner = guard;
        }
    }

    fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.1 = true;
        self.ready.notify_all();
    }
}

struct Outbound {
    next_hop: NodeId,
    data: Vec<u8>,
}

struct Inbound {
    src: String,
    data: Vec<u8>,
}

struct Tables {
    routes: RoutingTable,
    neighbours: NeighbourTable,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The mesh routing layer.
pub struct RoutingLayer {
    tables: Mutex<Tables>,
    config: Mutex<RoutingKnobs>,
    config_file: Arc<ConfigFile>,
    radio: Arc<dyn MeshRadio>,
    clock: Arc<dyn Clock>,
    observers: Mutex<heapless::Vec<Arc<dyn RoutingObserver>, MAX_SUBSCRIBERS>>,
    event_fifo: Fifo<MeshEvent>,
    send_fifo: Fifo<Outbound>,
    recv_fifo: Fifo<Inbound>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingLayer {
    /// Create a layer over the given radio, clock and config file.
    pub fn new(radio: Arc<dyn MeshRadio>, clock: Arc<dyn Clock>, config_file: Arc<ConfigFile>) -> Self {
        Self {
            tables: Mutex::new(Tables {
                routes: RoutingTable::new(),
                neighbours: NeighbourTable::new(),
            }),
            config: Mutex::new(RoutingKnobs::default()),
            config_file,
            radio,
            clock,
            observers: Mutex::new(heapless::Vec::new()),
            event_fifo: Fifo::new(),
            send_fifo: Fifo::new(),
            recv_fifo: Fifo::new(),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Load the routing knobs from the config file.
    pub fn init(&self) -> Result<(), RoutingError> {
        match self.config_file.load_or_init() {
            Ok(config) => {
                *lock(&self.config) = config.routing;
                info!(
                    default_cost = config.routing.default_cost,
                    retry_count = config.routing.retry_count,
                    retry_delay_ms = config.routing.retry_delay_ms,
                    "routing layer initialised"
                );
                Ok(())
            }
            Err(e) => {
                warn!("routing config load failed, keeping defaults: {e}");
                Ok(())
            }
        }
    }

    /// Spawn the event, send and receive workers.
    ///
    /// Takes a clone of the layer's `Arc`; the caller keeps its own.
    pub fn start(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut workers = lock(&self.workers);

        let layer = Arc::clone(&self);
        workers.push(std::thread::spawn(move || {
            debug!("routing event worker started");
            while layer.running.load(Ordering::SeqCst) {
                if let Some(event) = layer.event_fifo.pop(Duration::from_millis(200)) {
                    layer.process_mesh_event(event);
                }
            }
            debug!("routing event worker stopped");
        }));

        let layer = Arc::clone(&self);
        workers.push(std::thread::spawn(move || {
            debug!("routing send worker started");
            while layer.running.load(Ordering::SeqCst) {
                if let Some(outbound) = layer.send_fifo.pop(Duration::from_millis(200)) {
                    if let Err(e) = layer.radio.send(&outbound.next_hop, &outbound.data) {
                        warn!(next_hop = %outbound.next_hop, "mesh send failed: {e}");
                    }
                }
            }
            debug!("routing send worker stopped");
        }));

        let layer = Arc::clone(&self);
        workers.push(std::thread::spawn(move || {
            debug!("routing receive worker started");
            while layer.running.load(Ordering::SeqCst) {
                if let Some(inbound) = layer.recv_fifo.pop(Duration::from_millis(200)) {
                    // This worker owns the heap message; subscribers borrow
                    // it for the duration of the dispatch loop.
                    layer.notify(&RoutingNotice::MessageReceived {
                        src: inbound.src,
                        data: inbound.data,
                    });
                }
            }
            debug!("routing receive worker stopped");
        }));
    }

    /// Stop the workers.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.event_fifo.close();
        self.send_fifo.close();
        self.recv_fifo.close();
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
        info!("routing layer stopped");
    }

    // ── Mesh events ────────────────────────────────────────────────

    /// Queue a mesh event for the event worker.
    pub fn queue_mesh_event(&self, event: MeshEvent) {
        self.event_fifo.push(event);
    }

    /// Handle one mesh event synchronously.
    pub fn process_mesh_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::NeighbourChange(neighbours) => self.update_topology(&neighbours),
            MeshEvent::ParentConnected | MeshEvent::RootSwitched => self.recalculate_routes(),
            MeshEvent::Other(id) => warn!(event = id, "unhandled mesh event"),
        }
    }

    /// Replace the neighbour table from a topology report.
    pub fn update_topology(&self, neighbours: &[NeighbourEntry]) {
        let retained = {
            let mut tables = lock(&self.tables);
            tables.neighbours.replace_all(neighbours)
        };
        if retained < neighbours.len() {
            warn!(
                reported = neighbours.len(),
                retained, "neighbour table truncated"
            );
        }
        self.notify(&RoutingNotice::NeighbourTableUpdated { neighbours: retained });
    }

    /// Rebuild the routing table: one single-hop entry per neighbour.
    pub fn recalculate_routes(&self) {
        let default_cost = lock(&self.config).default_cost;
        let tick = self.clock.now_ms();

        let routes = {
            let mut tables = lock(&self.tables);
            let mut fresh = RoutingTable::new();
            for neighbour in tables.neighbours.entries() {
                let entry = RouteEntry {
                    dest_id: neighbour.id.clone(),
                    next_hop: neighbour.id.clone(),
                    cost: default_cost,
                    last_update_tick: tick,
                };
                match fresh.insert(entry) {
                    Ok(()) => {}
                    Err(RoutingError::TableFull(_)) => {
                        warn!("routing table truncated during recompute");
                        break;
                    }
                    Err(RoutingError::DuplicateRoute(dest)) => {
                        debug!(dest, "duplicate neighbour skipped during recompute");
                    }
                    Err(e) => warn!("recompute insert failed: {e}"),
                }
            }
            let count = fresh.len();
            tables.routes = fresh;
            count
        };

        self.notify(&RoutingNotice::TableUpdated { routes });
    }

    // ── Table maintenance ──────────────────────────────────────────

    /// Insert a route. Duplicate destinations are rejected.
    pub fn insert_route(&self, entry: RouteEntry) -> Result<(), RoutingError> {
        lock(&self.tables).routes.insert(entry)
    }

    /// Update an existing route.
    pub fn update_route(&self, entry: &RouteEntry) -> Result<(), RoutingError> {
        lock(&self.tables).routes.update(entry)
    }

    /// Remove the route for a destination.
    pub fn remove_route(&self, dest: &str) -> Result<RouteEntry, RoutingError> {
        lock(&self.tables).routes.remove(dest)
    }

    /// Copy of the routing table, in destination order.
    pub fn routing_table(&self) -> Vec<RouteEntry> {
        lock(&self.tables).routes.entries().to_vec()
    }

    /// Copy of the neighbour table.
    pub fn neighbour_table(&self) -> Vec<NeighbourEntry> {
        lock(&self.tables).neighbours.entries().to_vec()
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Dispatch a message.
    ///
    /// Unicast misses trigger up to `retry_count` route recomputes with
    /// `retry_delay_ms` between attempts before the message is dropped
    /// with a `RouteFailure` notice.
    ///
    /// # Errors
    ///
    /// `NullInput` for an empty destination or payload; `RouteFailure`
    /// when no route, group member or neighbour could be found.
    pub fn send_message(
        &self,
        dest: &str,
        data: &[u8],
        mode: DispatchMode,
    ) -> Result<(), RoutingError> {
        if dest.is_empty() {
            return Err(RoutingError::NullInput("dest_id"));
        }
        if data.is_empty() {
            return Err(RoutingError::NullInput("data"));
        }

        match mode {
            DispatchMode::Unicast => self.send_unicast(dest, data),
            DispatchMode::Multicast => self.send_multicast(dest, data),
            DispatchMode::Broadcast => self.send_broadcast(dest, data),
        }
    }

    fn try_enqueue_unicast(&self, dest: &str, data: &[u8]) -> bool {
        let tables = lock(&self.tables);
        match tables.routes.lookup(dest) {
            Some(entry) => {
                self.send_fifo.push(Outbound {
                    next_hop: entry.next_hop.clone(),
                    data: data.to_vec(),
                });
                true
            }
            None => false,
        }
    }

    fn send_unicast(&self, dest: &str, data: &[u8]) -> Result<(), RoutingError> {
        if self.try_enqueue_unicast(dest, data) {
            return Ok(());
        }

        let (retry_count, retry_delay) = {
            let config = lock(&self.config);
            (config.retry_count, Duration::from_millis(config.retry_delay_ms))
        };

        for attempt in 1..=retry_count {
            debug!(dest, attempt, "route miss, recomputing");
            self.recalculate_routes();
            std::thread::sleep(retry_delay);
            if self.try_enqueue_unicast(dest, data) {
                return Ok(());
            }
        }

        self.notify(&RoutingNotice::RouteFailure { dest: dest.to_string() });
        Err(RoutingError::RouteFailure(dest.to_string()))
    }

    fn send_multicast(&self, group: &str, data: &[u8]) -> Result<(), RoutingError> {
        let hops: Vec<NodeId> = {
            let tables = lock(&self.tables);
            tables
                .routes
                .multicast_members(group)
                .into_iter()
                .map(|e| e.next_hop.clone())
                .collect()
        };

        if hops.is_empty() {
            self.notify(&RoutingNotice::RouteFailure { dest: group.to_string() });
            return Err(RoutingError::RouteFailure(group.to_string()));
        }
        for next_hop in hops {
            self.send_fifo.push(Outbound {
                next_hop,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    fn send_broadcast(&self, dest: &str, data: &[u8]) -> Result<(), RoutingError> {
        let hops: Vec<NodeId> = {
            let tables = lock(&self.tables);
            tables.neighbours.entries().iter().map(|n| n.id.clone()).collect()
        };

        if hops.is_empty() {
            self.notify(&RoutingNotice::RouteFailure { dest: dest.to_string() });
            return Err(RoutingError::RouteFailure(dest.to_string()));
        }
        for next_hop in hops {
            self.send_fifo.push(Outbound {
                next_hop,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    /// Hand an inbound message to the receive worker.
    pub fn receive_message(&self, src: &str, data: &[u8]) {
        self.recv_fifo.push(Inbound {
            src: src.to_string(),
            data: data.to_vec(),
        });
    }

    // ── Config ─────────────────────────────────────────────────────

    /// Update the routing knobs and persist them to the config file.
    ///
    /// Returns `false` when the file write fails; the in-memory state
    /// stays updated either way.
    pub fn set_config(&self, knobs: &RoutingKnobs) -> bool {
        *lock(&self.config) = *knobs;
        match self.config_file.update(|config| config.routing = *knobs) {
            Ok(_) => true,
            Err(e) => {
                warn!("routing config persistence failed: {e}");
                false
            }
        }
    }

    /// Current routing knobs.
    pub fn get_config(&self) -> RoutingKnobs {
        *lock(&self.config)
    }

    // ── Subscribers ────────────────────────────────────────────────

    /// Register a subscriber.
    ///
    /// # Errors
    ///
    /// `SubscriberLimit` when the bounded list is full.
    pub fn register_callback(&self, observer: Arc<dyn RoutingObserver>) -> Result<(), RoutingError> {
        lock(&self.observers)
            .push(observer)
            .map_err(|_| RoutingError::SubscriberLimit(MAX_SUBSCRIBERS))
    }

    /// Remove a previously registered subscriber.
    ///
    /// Returns `true` when the subscriber was found.
    pub fn unregister_callback(&self, observer: &Arc<dyn RoutingObserver>) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    fn notify(&self, notice: &RoutingNotice) {
        let observers = lock(&self.observers).clone();
        for observer in &observers {
            observer.on_event(notice);
        }
    }
}
