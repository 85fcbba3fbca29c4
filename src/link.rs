//! The shared Interface/Router object.
//!
//! Both tasks of an instance hold an `Arc<Link>`. State transitions and
//! endpoint swaps happen only while holding the shutdown mutex; endpoint I/O
//! runs on a cloned `Arc<dyn Endpoint>` outside it, except for `connect` and
//! `disconnect` which must not interleave with a swap.

use crate::bus::MessageBus;
use crate::config::{LinkConfig, MicroserviceName};
use crate::dictionary::PacketDictionary;
use crate::endpoint::{Endpoint, EndpointConfig, EndpointFactory};
use crate::error::{LinkError, Result};
use crate::exception::{classify, ExceptionLog, FailureClass, FailureKind, FailureTracker};
use crate::sleeper::Sleeper;
use crate::status::{LinkStatus, StatusSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkKind {
    Interface,
    Router,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Interface => write!(f, "INTERFACE"),
            LinkKind::Router => write!(f, "ROUTER"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Disconnected,
    Attempting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Attempting => write!(f, "ATTEMPTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub connect_on_startup: bool,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl From<&LinkConfig> for ReconnectPolicy {
    fn from(config: &LinkConfig) -> Self {
        Self {
            connect_on_startup: config.connect_on_startup,
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Traffic counters. Relaxed: they only feed status records.
#[derive(Debug, Default)]
pub struct LinkCounters {
    count: AtomicU64,
    read_count: AtomicU64,
    write_count: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl LinkCounters {
    pub fn record_read(&self, bytes: usize) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packets handled by the microservice, in either direction.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// External collaborators of a link, injected at construction.
#[derive(Clone)]
pub struct Services {
    pub bus: Arc<dyn MessageBus>,
    pub dictionary: Arc<dyn PacketDictionary>,
    pub status: Arc<dyn StatusSink>,
    pub endpoints: Arc<dyn EndpointFactory>,
}

struct EndpointSlot {
    endpoint: Arc<dyn Endpoint>,
    config: EndpointConfig,
    generation: u64,
}

type ShutdownGuard<'a> = MutexGuard<'a, ()>;

pub struct Link {
    name: String,
    scope: String,
    kind: LinkKind,
    plugin: Option<String>,
    cmd_target_names: Vec<String>,
    tlm_target_names: Vec<String>,
    services: Services,
    shutdown_lock: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    slot: parking_lot::RwLock<EndpointSlot>,
    policy: ReconnectPolicy,
    counters: LinkCounters,
    failures: parking_lot::Mutex<FailureTracker>,
    exceptions: ExceptionLog,
    cancel: CancellationToken,
    sleeper: Sleeper,
}

impl Link {
    pub fn new(
        name: &MicroserviceName,
        config: &LinkConfig,
        endpoint: Arc<dyn Endpoint>,
        services: Services,
    ) -> Self {
        let policy = ReconnectPolicy::from(config);
        let initial = if policy.connect_on_startup {
            ConnectionState::Attempting
        } else {
            ConnectionState::Disconnected
        };
        let (state, _) = watch::channel(initial);
        let cancel = CancellationToken::new();
        Self {
            name: name.name.clone(),
            scope: name.scope.clone(),
            kind: name.kind,
            plugin: config.plugin.clone(),
            cmd_target_names: config.cmd_target_names(),
            tlm_target_names: config.tlm_target_names(),
            services,
            shutdown_lock: Mutex::new(()),
            state,
            slot: parking_lot::RwLock::new(EndpointSlot {
                endpoint,
                config: config.endpoint.clone(),
                generation: 0,
            }),
            policy,
            counters: LinkCounters::default(),
            failures: parking_lot::Mutex::new(FailureTracker::default()),
            exceptions: ExceptionLog::new(config.exception_dir.clone()),
            sleeper: Sleeper::with_token(cancel.clone()),
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn plugin(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    pub fn cmd_target_names(&self) -> &[String] {
        &self.cmd_target_names
    }

    pub fn tlm_target_names(&self) -> &[String] {
        &self.tlm_target_names
    }

    pub fn bus(&self) -> &dyn MessageBus {
        self.services.bus.as_ref()
    }

    pub fn dictionary(&self) -> &dyn PacketDictionary {
        self.services.dictionary.as_ref()
    }

    pub fn status_sink(&self) -> &dyn StatusSink {
        self.services.status.as_ref()
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    pub fn exceptions(&self) -> &ExceptionLog {
        &self.exceptions
    }

    pub fn sleeper(&self) -> &Sleeper {
        &self.sleeper
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, _guard: &ShutdownGuard<'_>, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.slot.read().endpoint.clone()
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        self.slot.read().config.clone()
    }

    /// Bumped on every endpoint swap; lets a reader tell a reconfiguration
    /// apart from a lost connection.
    pub fn endpoint_generation(&self) -> u64 {
        self.slot.read().generation
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Commands may only be written in this state.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.endpoint().connected()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn last_error(&self) -> Option<String> {
        self.failures.lock().last_error.clone()
    }

    pub fn note_error(&self, message: impl Into<String>) {
        self.failures.lock().last_error = Some(message.into());
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            name: self.name.clone(),
            state: self.state(),
            count: self.counters.count(),
            error: self.last_error(),
            plugin: self.plugin.clone(),
            read_count: self.counters.read_count(),
            write_count: self.counters.write_count(),
            bytes_read: self.counters.bytes_read(),
            bytes_written: self.counters.bytes_written(),
        }
    }

    pub async fn publish_status(&self) {
        if let Err(e) = self.services.status.set_link(&self.scope, self.kind, &self.status()).await {
            warn!("{}: Failed to write status: {}", self.name, e);
        }
    }

    /// Moves to `ATTEMPTING`, first rebuilding the endpoint when `params` is
    /// non-empty. A failed rebuild keeps the previous endpoint and state.
    pub async fn attempting(&self, params: &[Value]) -> Result<()> {
        let guard = self.shutdown_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        if params.is_empty() {
            if self.state() == ConnectionState::Connected && self.endpoint().connected() {
                info!("{}: Connect requested while already connected", self.name);
                return Ok(());
            }
        } else if let Err(e) = self.reconfigure(params).await {
            error!("{}: Attempting connection failed with params {:?}: {}", self.name, params, e);
            return Err(e);
        }
        self.set_state(&guard, ConnectionState::Attempting);
        drop(guard);
        self.publish_status().await;
        Ok(())
    }

    // Caller holds the shutdown mutex.
    async fn reconfigure(&self, params: &[Value]) -> Result<()> {
        let (current, config) = {
            let slot = self.slot.read();
            (slot.endpoint.clone(), slot.config.clone())
        };
        let config = config.from_params(params)?;
        let replacement = self.services.endpoints.build(&self.name, &config)?;
        if current.raw_logger().is_enabled() {
            replacement.start_raw_logging();
        }
        {
            let mut slot = self.slot.write();
            slot.endpoint = replacement;
            slot.config = config;
            slot.generation += 1;
        }
        // Swapped first so a reader woken by this disconnect sees the new generation
        if current.connected() {
            if let Err(e) = current.disconnect().await {
                warn!("{}: Disconnect of replaced endpoint failed: {}", self.name, e);
            }
        }
        info!("{}: Endpoint reconfigured", self.name);
        Ok(())
    }

    /// Connects the current endpoint unless the link is being stopped.
    pub async fn connect(&self) -> Result<()> {
        let guard = self.shutdown_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        info!("{}: Connecting ...", self.name);
        let endpoint = self.endpoint();
        tokio::select! {
            () = self.cancel.cancelled() => return Err(LinkError::Cancelled),
            result = endpoint.connect() => result?,
        }
        self.set_state(&guard, ConnectionState::Connected);
        drop(guard);
        info!("{}: Connection Success", self.name);
        self.publish_status().await;
        Ok(())
    }

    /// Disconnects the endpoint and settles the state. With `allow_reconnect`
    /// and an auto-reconnect policy the state becomes `ATTEMPTING` and this
    /// call sleeps `reconnect_delay` before returning.
    pub async fn disconnect(&self, allow_reconnect: bool) {
        if self.state() == ConnectionState::Disconnected && !self.endpoint().connected() {
            return;
        }
        let guard = self.shutdown_lock.lock().await;
        // Another task may have finished the disconnect while we waited.
        let endpoint = self.endpoint();
        if self.state() == ConnectionState::Disconnected && !endpoint.connected() {
            return;
        }
        if endpoint.connected() {
            if let Err(e) = endpoint.disconnect().await {
                error!("{}: Disconnect failed: {}", self.name, e);
            }
        }
        let policy = self.policy();
        let reconnect = allow_reconnect
            && policy.auto_reconnect
            && self.state() != ConnectionState::Disconnected
            && !self.cancel.is_cancelled();
        if reconnect {
            self.set_state(&guard, ConnectionState::Attempting);
        } else {
            self.set_state(&guard, ConnectionState::Disconnected);
        }
        drop(guard);
        self.publish_status().await;
        if reconnect {
            self.sleeper.sleep(policy.reconnect_delay).await;
        }
    }

    pub async fn handle_connection_failed(&self, err: LinkError) {
        self.handle_failure(FailureKind::ConnectFailed, "Connection Failed", err).await;
    }

    /// `None` is a clean close or a locally requested disconnect.
    pub async fn handle_connection_lost(&self, err: Option<LinkError>) {
        match err {
            Some(err) => self.handle_failure(FailureKind::ConnectionLost, "Connection Lost", err).await,
            None => {
                info!("{}: Connection Lost", self.name);
                self.disconnect(true).await;
            }
        }
    }

    async fn handle_failure(&self, kind: FailureKind, context: &str, err: LinkError) {
        let message = err.to_string();
        let first = self.failures.lock().note(kind, &message);
        match classify(&err) {
            FailureClass::Transient => info!("{}: {}: {}", self.name, context, message),
            FailureClass::Cancelled => {
                info!("{}: Closing from signal", self.name);
                self.cancel.cancel();
            }
            FailureClass::Novel => {
                error!("{}: {}: {}", self.name, context, message);
                if first {
                    match self.exceptions.write(&self.name, &err) {
                        Ok(Some(path)) => info!("{}: Exception recorded to {}", self.name, path.display()),
                        Ok(None) => {}
                        Err(e) => warn!("{}: Failed to record exception: {}", self.name, e),
                    }
                }
            }
        }
        self.disconnect(true).await;
    }

    /// Cancels every wait, disconnects the endpoint if connected and removes
    /// the status record. Repeating it only repeats the status removal.
    pub async fn shut_down(&self) {
        self.cancel.cancel();
        let guard = self.shutdown_lock.lock().await;
        let endpoint = self.endpoint();
        if endpoint.connected() {
            if let Err(e) = endpoint.disconnect().await {
                error!("{}: Disconnect failed: {}", self.name, e);
            }
        }
        self.set_state(&guard, ConnectionState::Disconnected);
        drop(guard);
        if let Err(e) = self.services.status.remove_link(&self.scope, self.kind, &self.name).await {
            warn!("{}: Failed to remove status: {}", self.name, e);
        }
    }
}
