//! Gateway Engine
//!
//! The device connection manager and message-routing engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MessageRouter                          │
//! │   (bus boundary: control dispatch, data bridge, responses)   │
//! └──────────┬─────────────────────┬────────────────────────────┘
//!            │                     │
//!            ▼                     ▼
//! ┌────────────────────┐  ┌─────────────────┐
//! │ ConnectionManager  │  │ ScanCoordinator │
//! │                    │  │                 │
//! │ - DeviceRegistry   │  │ - single-flight │
//! │ - retry supervisor │  │   passes        │
//! │ - RadioSession per │  │ - Advertisement │
//! │   connected device │  │   parser        │
//! └─────────┬──────────┘  └────────┬────────┘
//!           │                      │
//!           └───────┐      ┌───────┘
//!                   ▼      ▼
//!            ┌──────────────────┐
//!            │   RadioHandle    │   one physical op at a time
//!            └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`advertisement`] - scan-response fragment decoding
//! - [`registry`] - per-address connection records, list snapshots
//! - [`session`] - one live link per connected device
//! - [`manager`] - connect/disconnect orchestration and retry supervision
//! - [`scanner`] - bounded single-flight discovery passes
//! - [`router`] - topic scheme, validation, and the data bridge

pub mod advertisement;
pub mod manager;
pub mod registry;
pub mod router;
pub mod scanner;
pub mod session;

pub use manager::{ConnectOutcome, ConnectionManager, GatewayError, ManagerConfig};
pub use router::{ControlOp, MessageRouter, TopicScheme};
pub use scanner::ScanCoordinator;

use crate::domain::models::GatewayEvent;
use crate::domain::settings::Settings;
use crate::infrastructure::bus::{BusMessage, MessageBus};
use crate::infrastructure::radio::RadioHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Fully wired engine. Construct with [`Gateway::new`], then drive it
/// with [`Gateway::run`] until the shutdown token fires.
pub struct Gateway {
    manager: ConnectionManager,
    router: MessageRouter,
    bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    events_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// `bus_rx` is the inbound half handed to the bus implementation; it
    /// delivers every message on a subscribed topic.
    pub fn new(
        settings: &Settings,
        radio: RadioHandle,
        bus: Arc<dyn MessageBus>,
        bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(
            radio.clone(),
            events_tx,
            ManagerConfig::from_settings(settings),
            shutdown.clone(),
        );
        let scanner = Arc::new(ScanCoordinator::new(
            radio,
            Duration::from_secs(settings.scan_secs),
        ));
        let topics = TopicScheme::new(&settings.topic_root, &settings.gateway_id);
        let router = MessageRouter::new(
            bus,
            manager.clone(),
            scanner,
            topics,
            settings.control_workers,
            shutdown.clone(),
        );

        Self {
            manager,
            router,
            bus_rx,
            events_rx,
            shutdown,
        }
    }

    /// Token that stops the engine when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Run until shutdown, then tear every session down.
    pub async fn run(self) {
        let Gateway {
            manager,
            router,
            bus_rx,
            events_rx,
            ..
        } = self;

        router.run(bus_rx, events_rx).await;

        info!("shutting down: disconnecting all devices");
        manager.shutdown().await;
    }
}
