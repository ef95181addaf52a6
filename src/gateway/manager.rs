//! Connection manager.
//!
//! Orchestrates connect and disconnect requests, owns every connection
//! record, and supervises one radio session lifecycle per connected
//! device. Each record in `connecting`/`retrying`/`connected` has exactly
//! one background supervisor task driving the retry state machine:
//!
//! ```text
//! absent -> connecting -> connected
//!              ^  |           |        (link lost)
//!              |  v           v
//!             retrying <------+
//!              |
//!              v  (disconnect request, any state)
//!          disconnecting -> absent
//! ```
//!
//! A connect request answers its caller within a bounded window; the
//! supervisor keeps retrying in the background until a disconnect request
//! or process shutdown cancels it.

use crate::domain::models::{ConnectionState, DeviceAddress, DeviceStatus, GatewayEvent};
use crate::domain::settings::Settings;
use crate::gateway::registry::DeviceRegistry;
use crate::gateway::session::RadioSession;
use crate::infrastructure::radio::{RadioError, RadioHandle};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period for a cancelled supervisor to wind down before it is
/// aborted outright.
const SUPERVISOR_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceAddress),
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Result of a connect request as seen by its caller. `Failed` only means
/// the bounded wait expired; retrying continues in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a connect caller waits for `connected` before being
    /// answered with a failure.
    pub connect_window: Duration,
    /// Pause between background reconnect attempts.
    pub retry_backoff: Duration,
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect_window: Duration::from_secs(settings.connect_window_secs),
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_window: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    radio: RadioHandle,
    registry: DeviceRegistry,
    /// Per-address operation locks: at most one connect/disconnect in
    /// flight per address, later requests queue behind it.
    ops: StdMutex<HashMap<DeviceAddress, Arc<tokio::sync::Mutex<()>>>>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    config: ManagerConfig,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        radio: RadioHandle,
        events: mpsc::UnboundedSender<GatewayEvent>,
        config: ManagerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                registry: DeviceRegistry::new(),
                ops: StdMutex::new(HashMap::new()),
                events,
                config,
                shutdown,
            }),
        }
    }

    fn op_lock(&self, address: DeviceAddress) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .ops
            .lock()
            .expect("op lock table poisoned")
            .entry(address)
            .or_default()
            .clone()
    }

    /// Connect to a peripheral. Blocks the caller for at most the
    /// configured window; background retrying continues either way.
    pub async fn connect(&self, address: DeviceAddress) -> ConnectOutcome {
        let op = self.op_lock(address);
        let _serialized = op.lock().await;

        info!("Connecting to BLE device: {}", address);

        // Reconnecting to a known address tears the old record down first.
        if self.inner.registry.contains(&address) {
            debug!("{} already registered, disconnecting before reconnect", address);
            Inner::teardown(&self.inner, address).await;
        }

        let cancel = self.inner.shutdown.child_token();
        let mut state_rx = self
            .inner
            .registry
            .insert_connecting(address, cancel.clone());
        Inner::emit_state(&self.inner, address, None, Some(ConnectionState::Connecting));

        let inner = self.inner.clone();
        let supervisor = tokio::spawn(async move {
            Inner::supervise(inner, address, cancel).await;
        });
        self.inner.registry.attach_supervisor(&address, supervisor);

        let bounded_wait = timeout(
            self.inner.config.connect_window,
            state_rx.wait_for(|state| *state == ConnectionState::Connected),
        );
        let connected = tokio::select! {
            _ = self.inner.shutdown.cancelled() => false,
            outcome = bounded_wait => matches!(outcome, Ok(Ok(_))),
        };

        if connected {
            info!("Connecting to BLE device: {} successful", address);
            ConnectOutcome::Connected
        } else {
            warn!(
                "BLE device {} not connected within {:?}; retrying continues in background",
                address, self.inner.config.connect_window
            );
            ConnectOutcome::Failed
        }
    }

    /// Disconnect a peripheral and delete its record. Idempotent: unknown
    /// addresses are still a success.
    pub async fn disconnect(&self, address: DeviceAddress) {
        let op = self.op_lock(address);
        let _serialized = op.lock().await;

        info!("Disconnecting BLE device: {}", address);
        Inner::teardown(&self.inner, address).await;
    }

    /// Snapshot of all non-absent records.
    pub fn list(&self) -> BTreeMap<DeviceAddress, DeviceStatus> {
        self.inner.registry.snapshot()
    }

    /// Forward a payload to a connected peripheral.
    pub async fn write(&self, address: DeviceAddress, payload: &[u8]) -> Result<(), GatewayError> {
        let session = self
            .inner
            .registry
            .session(&address)
            .ok_or(GatewayError::NotConnected(address))?;
        session.write(payload).await?;
        Ok(())
    }

    pub fn state(&self, address: &DeviceAddress) -> Option<ConnectionState> {
        self.inner.registry.state(address)
    }

    /// Tear down every record. Called once at process shutdown.
    pub async fn shutdown(&self) {
        for address in self.inner.registry.addresses() {
            let op = self.op_lock(address);
            let _serialized = op.lock().await;
            Inner::teardown(&self.inner, address).await;
        }
    }
}

impl Inner {
    fn emit_state(
        inner: &Arc<Inner>,
        address: DeviceAddress,
        previous: Option<ConnectionState>,
        current: Option<ConnectionState>,
    ) {
        let _ = inner.events.send(GatewayEvent::StateChanged {
            address,
            previous,
            current,
        });
    }

    /// The per-record background task: attempt, supervise, retry, forever,
    /// until cancelled.
    async fn supervise(inner: Arc<Inner>, address: DeviceAddress, cancel: CancellationToken) {
        loop {
            if inner.registry.state(&address) == Some(ConnectionState::Retrying) {
                let Some(previous) = inner
                    .registry
                    .set_state(&address, ConnectionState::Connecting)
                else {
                    return;
                };
                Self::emit_state(
                    &inner,
                    address,
                    Some(previous),
                    Some(ConnectionState::Connecting),
                );
            }

            let attempt = async {
                let mut radio = inner.radio.lock().await;
                radio.open(address).await
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = attempt => result,
            };

            match result {
                Ok(handle) => {
                    let address_type = handle.address_type;
                    let session =
                        RadioSession::start(address, inner.radio.clone(), handle, inner.events.clone());
                    let Some(previous) = inner
                        .registry
                        .set_connected(&address, address_type, session.clone())
                    else {
                        // Record removed while the attempt was completing.
                        session.close().await;
                        return;
                    };
                    Self::emit_state(
                        &inner,
                        address,
                        Some(previous),
                        Some(ConnectionState::Connected),
                    );
                    info!("link to {} established ({})", address, address_type);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            session.close().await;
                            return;
                        }
                        _ = session.wait_lost() => {}
                    }

                    // Unexpected drop: destroy the session and resume
                    // reconnection without a new external request.
                    session.close().await;
                    warn!("link to {} lost, reconnecting", address);
                    let Some(previous) = inner
                        .registry
                        .set_retrying(&address, "link lost".to_string())
                    else {
                        return;
                    };
                    Self::emit_state(
                        &inner,
                        address,
                        Some(previous),
                        Some(ConnectionState::Retrying),
                    );
                }
                Err(e @ RadioError::Unavailable(_)) => {
                    // Process-level condition: report it and stop retrying.
                    error!("radio unavailable while connecting {}: {}", address, e);
                    if let Some(previous) = inner.registry.set_retrying(&address, e.to_string()) {
                        Self::emit_state(
                            &inner,
                            address,
                            Some(previous),
                            Some(ConnectionState::Retrying),
                        );
                    }
                    let _ = inner.events.send(GatewayEvent::Fault {
                        message: format!("radio unavailable while connecting {address}: {e}"),
                    });
                    return;
                }
                Err(e) => {
                    debug!("connect attempt to {} failed: {}", address, e);
                    let Some(previous) = inner.registry.set_retrying(&address, e.to_string())
                    else {
                        return;
                    };
                    Self::emit_state(
                        &inner,
                        address,
                        Some(previous),
                        Some(ConnectionState::Retrying),
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(inner.config.retry_backoff) => {}
            }
        }
    }

    /// Remove a record and release everything it owns. No-op for unknown
    /// addresses.
    async fn teardown(inner: &Arc<Inner>, address: DeviceAddress) {
        if !inner.registry.contains(&address) {
            debug!("disconnect for unknown device {}; nothing to do", address);
            return;
        }

        let previous = inner
            .registry
            .set_state(&address, ConnectionState::Disconnecting);
        Self::emit_state(
            inner,
            address,
            previous,
            Some(ConnectionState::Disconnecting),
        );

        let Some(removed) = inner.registry.remove(&address) else {
            return;
        };
        removed.cancel.cancel();

        if let Some(supervisor) = removed.supervisor {
            let mut supervisor = supervisor;
            if timeout(SUPERVISOR_GRACE, &mut supervisor).await.is_err() {
                warn!("supervisor for {} did not stop in time, aborting", address);
                supervisor.abort();
            }
        }
        if let Some(session) = removed.session {
            session.close().await;
        }

        Self::emit_state(inner, address, Some(ConnectionState::Disconnecting), None);
        info!("BLE device {} disconnected", address);
    }
}
