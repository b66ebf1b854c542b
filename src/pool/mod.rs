// ABOUTME: Warm pool of remote workers bound to users on demand over the message bus
// ABOUTME: Tracks readiness and bind broadcasts, retries acquisition, drains on dispose

//! Service pool.
//!
//! A `ServicePool` keeps a queue of ready workers (announced by
//! `serviceReady` broadcasts) and a map of users to the worker bound to
//! them (confirmed by `startServiceResponse` broadcasts). Callers
//! [`acquire`](ServicePool::acquire) and [`release`](ServicePool::release)
//! workers; growth is delegated to a [`ServiceProvisioner`].
//!
//! # Architecture
//!
//! ```text
//!  serviceReady ──▶ ready queue ──acquire──▶ pending bind ──startServiceResponse──▶ bindings
//!                      (FIFO)        │        (socket → user, token)                 (user → socket)
//!                                    └── startServiceRequest{callback_id: token}
//! ```
//!
//! A socket is in at most one of {ready queue, pending binds, bindings}.
//! A worker that does not confirm its bind within the round timeout is
//! shut down and never returned to the queue.
//!
//! # Usage
//!
//! ```ignore
//! let pool = ServicePool::new(bus, provisioner, PoolConfig::for_service("jdt", 2))?;
//! pool.start();
//! let socket = pool.acquire("alice").await?;
//! pool.release("alice");
//! pool.dispose().await;
//! ```

/// Pool counters
pub mod metrics;
/// Growth backends
pub mod provisioner;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{BusError, HandlerRegistration, Message, MessageBus};
use crate::config::{ConfigError, PoolConfig};
use crate::protocol::{
    self, CallbackId, ProtocolError, ServiceReady, ShutdownService, StartServiceRequest,
    StartServiceResponse, SERVICE, SERVICE_READY, SHUTDOWN_SERVICE, START_SERVICE_REQUEST,
    START_SERVICE_RESPONSE,
};

pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use provisioner::{InstanceCountProvisioner, ProvisionError, ServiceProvisioner};

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// No worker could be bound within the trial bound
    #[error("No worker bound to '{user}' after {trials} attempts")]
    Provisioning {
        /// User the worker was requested for
        user: String,
        /// Rounds attempted
        trials: u32,
    },

    /// Pool is not running when operation requires it
    #[error("Pool is not running")]
    NotRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// A message could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Pool Stats ===

/// Snapshot of pool occupancy and counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pool identifier
    pub service_id: String,
    /// Whether the pool is running
    pub active: bool,
    /// Ready, unbound workers
    pub ready: usize,
    /// Users holding a worker
    pub bound: usize,
    /// Binds awaiting confirmation
    pub pending: usize,
    /// Lifetime counters
    pub metrics: MetricsSnapshot,
}

// === Service Pool ===

#[derive(Debug, Clone)]
struct PendingBind {
    user: String,
    token: CallbackId,
}

struct PoolInner {
    config: PoolConfig,
    bus: Arc<dyn MessageBus>,
    provisioner: Arc<dyn ServiceProvisioner>,

    /// Ready, unbound workers in announcement order
    ready: Mutex<VecDeque<String>>,

    /// user → socket
    bindings: DashMap<String, String>,

    /// socket → bind in flight
    pending_binds: DashMap<String, PendingBind>,

    /// Held for the whole of an acquisition, one per user
    user_locks: DashMap<String, Arc<AsyncMutex<()>>>,

    active: AtomicBool,

    /// Run generation, bumped by every `start`. Held across lifecycle
    /// transitions so a dispose only tears down its own run.
    lifecycle: Mutex<u64>,

    /// Woken on every ready/bind change
    changed: Notify,

    handlers: Mutex<Vec<HandlerRegistration>>,
    metrics: PoolMetrics,
}

/// Pool of warm workers for one service.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ServicePool {
    inner: Arc<PoolInner>,
}

impl ServicePool {
    /// Create a pool; fails fast on an invalid config
    pub fn new(
        bus: Arc<dyn MessageBus>,
        provisioner: Arc<dyn ServiceProvisioner>,
        config: PoolConfig,
    ) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                bus,
                provisioner,
                ready: Mutex::new(VecDeque::new()),
                bindings: DashMap::new(),
                pending_binds: DashMap::new(),
                user_locks: DashMap::new(),
                active: AtomicBool::new(false),
                lifecycle: Mutex::new(0),
                changed: Notify::new(),
                handlers: Mutex::new(Vec::new()),
                metrics: PoolMetrics::new(),
            }),
        })
    }

    /// Pool identifier
    pub fn service_id(&self) -> &str {
        &self.inner.config.service_id
    }

    /// Pool settings
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether the pool is running
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Install the broadcast listeners and request the initial workers.
    ///
    /// Returns false if the pool was already running.
    pub fn start(&self) -> bool {
        let inner = &self.inner;
        let mut generation = inner.lock_lifecycle();
        if inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(service = %inner.config.service_id, "Pool already running");
            return false;
        }
        *generation += 1;

        let service = inner.config.service_id.clone();
        let weak = Arc::downgrade(inner);
        let ready_listener = HandlerRegistration::register(
            Arc::clone(&inner.bus),
            SERVICE_READY,
            for_service(service.clone()),
            with_pool(weak.clone(), PoolInner::on_service_ready),
        );
        let bind_listener = HandlerRegistration::register(
            Arc::clone(&inner.bus),
            START_SERVICE_RESPONSE,
            for_service(service),
            with_pool(weak, PoolInner::on_service_started),
        );
        inner
            .lock_handlers()
            .extend([ready_listener, bind_listener]);

        let pool_size = inner.config.pool_size;
        match inner.provisioner.provision_initial(pool_size) {
            Ok(()) => {
                inner
                    .metrics
                    .workers_provisioned
                    .fetch_add(pool_size as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(service = %inner.config.service_id, error = %e, "Initial provisioning failed");
            }
        }

        info!(service = %inner.config.service_id, pool_size, "Service pool started");
        true
    }

    /// Bind a ready worker to `user` and return its socket id.
    ///
    /// A user that already holds a worker gets the same one back, and
    /// concurrent acquisitions for one user are serialized. Each round
    /// signals growth when the queue is at or below the pool size, waits
    /// for a ready worker, asks it to bind, and waits for the
    /// confirmation; both waits are bounded by the acquisition timeout.
    ///
    /// The pool being stopped is only checked between rounds, so a bind
    /// already in flight when [`dispose`](Self::dispose) begins can still
    /// complete during the drain window.
    pub async fn acquire(&self, user: &str) -> PoolResult<String> {
        let inner = &self.inner;
        if !inner.is_active() {
            return Err(PoolError::NotRunning);
        }

        let user_lock = Arc::clone(
            inner
                .user_locks
                .entry(user.to_string())
                .or_default()
                .value(),
        );
        let _serialized = user_lock.lock().await;

        if let Some(socket) = inner.bindings.get(user) {
            debug!(user = %user, socket = %socket.value(), "User already bound");
            return Ok(socket.value().clone());
        }

        inner.metrics.acquisition_started();
        let timeout = inner.config.acquire_timeout;
        let trials = inner.config.max_trials;

        for trial in 1..=trials {
            if !inner.is_active() {
                return Err(PoolError::NotRunning);
            }
            if inner.ready_count() <= inner.config.pool_size {
                inner.request_growth();
            }

            let Some(socket) = inner.wait_until(timeout, PoolInner::pop_ready).await else {
                warn!(user = %user, trial, "No ready worker within timeout");
                continue;
            };

            let token = CallbackId::next();
            inner.pending_binds.insert(
                socket.clone(),
                PendingBind {
                    user: user.to_string(),
                    token,
                },
            );

            if let Err(e) = inner.request_bind(user, &socket, token) {
                inner.pending_binds.remove(&socket);
                inner.lock_ready().push_front(socket);
                inner.metrics.acquisition_failed();
                return Err(e);
            }

            inner
                .wait_until(timeout, |pool| pool.is_bound_to(user, &socket).then_some(()))
                .await;

            if inner.settle_bind(user, &socket) {
                inner.metrics.acquisition_bound();
                info!(user = %user, socket = %socket, trial, "Worker bound");
                return Ok(socket);
            }

            warn!(user = %user, socket = %socket, trial, "Worker did not confirm bind, discarding");
            inner.metrics.bind_timed_out();
            inner.remove_service(&socket);
        }

        inner.metrics.acquisition_failed();
        Err(PoolError::Provisioning {
            user: user.to_string(),
            trials,
        })
    }

    /// Unbind `user` and shut its worker down.
    ///
    /// Returns whether a binding existed.
    pub fn release(&self, user: &str) -> bool {
        let Some((_, socket)) = self.inner.bindings.remove(user) else {
            return false;
        };
        self.inner.metrics.released();
        info!(user = %user, socket = %socket, "Worker released");
        self.inner.remove_service(&socket);
        self.inner.changed.notify_waiters();
        true
    }

    /// Socket bound to `user`, if any
    pub fn binding(&self, user: &str) -> Option<String> {
        self.inner.bindings.get(user).map(|entry| entry.value().clone())
    }

    /// Number of ready, unbound workers
    pub fn ready_count(&self) -> usize {
        self.inner.ready_count()
    }

    /// Whether the ready queue has reached the pool size
    pub fn is_warmed_up(&self) -> bool {
        self.inner.ready_count() >= self.inner.config.pool_size
    }

    /// Stop the pool.
    ///
    /// New acquisitions are refused at once. Binds already in flight keep
    /// their listeners for the drain window; after it the listeners are
    /// removed and every ready and bound worker is shut down. If the pool
    /// was restarted during the drain, the new run is left untouched.
    /// Returns false if it was not running.
    pub async fn dispose(&self) -> bool {
        let inner = &self.inner;
        let generation = {
            let lifecycle = inner.lock_lifecycle();
            if inner
                .active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            *lifecycle
        };

        let handlers = std::mem::take(&mut *inner.lock_handlers());
        info!(
            service = %inner.config.service_id,
            drain_ms = inner.config.drain_window.as_millis() as u64,
            "Draining service pool"
        );
        tokio::time::sleep(inner.config.drain_window).await;

        for handler in &handlers {
            handler.remove();
        }
        drop(handlers);

        let current = inner.lock_lifecycle();
        if *current != generation {
            info!(service = %inner.config.service_id, "Pool restarted during drain, keeping its workers");
            return true;
        }

        let ready: Vec<String> = inner.lock_ready().drain(..).collect();
        let bound: Vec<String> = inner
            .bindings
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        inner.bindings.clear();
        inner.pending_binds.clear();
        inner.user_locks.clear();

        for socket in ready.iter().chain(bound.iter()) {
            inner.remove_service(socket);
        }
        inner.provisioner.on_dispose();

        info!(
            service = %inner.config.service_id,
            ready = ready.len(),
            bound = bound.len(),
            "Service pool disposed"
        );
        true
    }

    /// Occupancy and counters
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            service_id: inner.config.service_id.clone(),
            active: inner.is_active(),
            ready: inner.ready_count(),
            bound: inner.bindings.len(),
            pending: inner.pending_binds.len(),
            metrics: inner.metrics.snapshot(),
        }
    }
}

impl std::fmt::Debug for ServicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("service_id", &self.inner.config.service_id)
            .field("active", &self.inner.is_active())
            .field("ready", &self.inner.ready_count())
            .field("bound", &self.inner.bindings.len())
            .finish_non_exhaustive()
    }
}

fn for_service(service: String) -> impl Fn(&Message) -> bool + Send + Sync + 'static {
    move |message| message.field_equals(SERVICE, &service)
}

fn with_pool(
    pool: Weak<PoolInner>,
    on_message: fn(&PoolInner, &Message),
) -> impl Fn(&Message) + Send + Sync + 'static {
    move |message| {
        if let Some(pool) = pool.upgrade() {
            on_message(&pool, message);
        }
    }
}

impl PoolInner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn lock_ready(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, u64> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Vec<HandlerRegistration>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_count(&self) -> usize {
        self.lock_ready().len()
    }

    fn pop_ready(&self) -> Option<String> {
        self.lock_ready().pop_front()
    }

    fn is_bound_to(&self, user: &str, socket: &str) -> bool {
        self.bindings
            .get(user)
            .is_some_and(|entry| entry.value() == socket)
    }

    fn is_bound(&self, socket: &str) -> bool {
        self.bindings.iter().any(|entry| entry.value() == socket)
    }

    /// Close the bind window for `socket` and report whether it was confirmed.
    ///
    /// A confirmation is applied while its pending entry is held, so once
    /// the entry is gone no confirmation for it can land afterwards.
    fn settle_bind(&self, user: &str, socket: &str) -> bool {
        self.pending_binds.remove(socket);
        self.is_bound_to(user, socket)
    }

    /// Poll `check` until it yields or `timeout` passes.
    ///
    /// Every change notification wakes the waiter; otherwise it re-checks
    /// once per poll step.
    async fn wait_until<T>(&self, timeout: Duration, mut check: impl FnMut(&Self) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = check(self) {
                return Some(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let step = self.config.poll_step.min(deadline - now);
            let _ = tokio::time::timeout(step, notified).await;
        }
    }

    fn request_growth(&self) {
        match self.provisioner.provision() {
            Ok(()) => {
                self.metrics.worker_provisioned();
                debug!(service = %self.config.service_id, "Requested one more worker");
            }
            Err(e) => {
                warn!(service = %self.config.service_id, error = %e, "Provisioning failed");
            }
        }
    }

    fn request_bind(&self, user: &str, socket: &str, token: CallbackId) -> PoolResult<()> {
        let request = StartServiceRequest {
            service: self.config.service_id.clone(),
            username: user.to_string(),
            socket_id: socket.to_string(),
            callback_id: Some(token),
        };
        debug!(user = %user, socket = %socket, callback_id = %token, "Requesting bind");
        self.bus
            .publish(START_SERVICE_REQUEST, protocol::to_payload(&request)?)?;
        Ok(())
    }

    /// Shut a worker down and tell the provisioner
    fn remove_service(&self, socket: &str) {
        let shutdown = ShutdownService {
            service: self.config.service_id.clone(),
            socket_id: socket.to_string(),
        };
        let published = protocol::to_payload(&shutdown)
            .map_err(PoolError::from)
            .and_then(|payload| {
                self.bus
                    .publish(SHUTDOWN_SERVICE, payload)
                    .map_err(PoolError::from)
            });
        if let Err(e) = published {
            warn!(socket = %socket, error = %e, "Failed to send shutdown");
        }
        self.metrics.worker_shut_down();
        self.provisioner.on_removed(socket);
    }

    fn on_service_ready(&self, message: &Message) {
        let ready: ServiceReady = match protocol::from_payload(&message.payload) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "Malformed serviceReady broadcast");
                return;
            }
        };
        let socket = ready.socket_id;

        if self.pending_binds.contains_key(&socket) || self.is_bound(&socket) {
            debug!(socket = %socket, "Ignoring serviceReady for a bound worker");
            return;
        }
        {
            let mut queue = self.lock_ready();
            if queue.contains(&socket) {
                debug!(socket = %socket, "Ignoring duplicate serviceReady");
                return;
            }
            queue.push_back(socket.clone());
        }

        self.metrics.worker_announced();
        debug!(service = %self.config.service_id, socket = %socket, "Worker ready");
        self.changed.notify_waiters();
    }

    fn on_service_started(&self, message: &Message) {
        let started: StartServiceResponse = match protocol::from_payload(&message.payload) {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "Malformed startServiceResponse broadcast");
                return;
            }
        };

        // The pending entry stays locked until the binding is recorded
        let Entry::Occupied(pending) = self.pending_binds.entry(started.socket_id.clone()) else {
            debug!(
                user = %started.username,
                socket = %started.socket_id,
                "Ignoring bind confirmation with no matching request"
            );
            return;
        };
        let matches = pending.get().user == started.username
            && started.callback_id.map_or(true, |id| id == pending.get().token);
        if !matches {
            debug!(
                user = %started.username,
                socket = %started.socket_id,
                "Ignoring bind confirmation for another request"
            );
            return;
        }

        match self.bindings.entry(started.username.clone()) {
            Entry::Occupied(existing) if existing.get() != &started.socket_id => {
                warn!(
                    user = %started.username,
                    bound = %existing.get(),
                    socket = %started.socket_id,
                    "Refusing second binding for user"
                );
                return;
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(started.socket_id.clone());
            }
        }
        pending.remove();
        self.lock_ready().retain(|socket| socket != &started.socket_id);

        debug!(user = %started.username, socket = %started.socket_id, "Bind confirmed");
        self.changed.notify_waiters();
    }
}
