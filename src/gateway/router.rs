//! Message router.
//!
//! The boundary between the message bus and the engine. Inbound control
//! messages are validated and dispatched to the connection manager or the
//! scan coordinator; their results, asynchronous state transitions and
//! device-originated payloads flow back out on the corresponding topics.
//!
//! Topic layout (prefix is `<root>/<gateway-id>/ble`):
//!
//! ```text
//! <prefix>/control/connect            control requests (+ /response)
//! <prefix>/control/disconnect
//! <prefix>/control/list
//! <prefix>/control/scan
//! <prefix>/data/tx/<MAC>              bus -> device payloads
//! <prefix>/data/rx/<MAC>              device -> bus payloads
//! <prefix>/state                      connection state notifications
//! <prefix>/error                      unroutable / malformed requests
//! ```

use crate::domain::models::{ConnectionState, DeviceAddress, GatewayEvent};
use crate::gateway::manager::{ConnectOutcome, ConnectionManager};
use crate::gateway::scanner::ScanCoordinator;
use crate::infrastructure::bus::{BusMessage, MessageBus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Connect,
    Disconnect,
    List,
    Scan,
}

impl ControlOp {
    pub const ALL: [ControlOp; 4] = [Self::Connect, Self::Disconnect, Self::List, Self::Scan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::List => "list",
            Self::Scan => "scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRoute {
    Control(ControlOp),
    DeviceTx(DeviceAddress),
}

/// Builds and parses the gateway's topic set.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
}

impl TopicScheme {
    pub fn new(root: &str, gateway_id: &str) -> Self {
        Self {
            prefix: format!("{root}/{gateway_id}/ble"),
        }
    }

    pub fn control(&self, op: ControlOp) -> String {
        format!("{}/control/{}", self.prefix, op.as_str())
    }

    pub fn control_response(&self, op: ControlOp) -> String {
        format!("{}/control/{}/response", self.prefix, op.as_str())
    }

    pub fn data_tx(&self, address: &DeviceAddress) -> String {
        format!("{}/data/tx/{}", self.prefix, address)
    }

    pub fn data_rx(&self, address: &DeviceAddress) -> String {
        format!("{}/data/rx/{}", self.prefix, address)
    }

    pub fn state(&self) -> String {
        format!("{}/state", self.prefix)
    }

    pub fn error(&self) -> String {
        format!("{}/error", self.prefix)
    }

    /// Classify an inbound topic. The error string is ready for the error
    /// topic.
    pub fn route(&self, topic: &str) -> Result<InboundRoute, String> {
        for op in ControlOp::ALL {
            if topic == self.control(op) {
                return Ok(InboundRoute::Control(op));
            }
        }
        let tx_prefix = format!("{}/data/tx/", self.prefix);
        if let Some(raw_mac) = topic.strip_prefix(tx_prefix.as_str()) {
            return raw_mac
                .parse()
                .map(InboundRoute::DeviceTx)
                .map_err(|e| format!("can't extract device MAC from topic '{topic}': {e}"));
        }
        Err(format!(
            "received message on unknown / unsupported topic '{topic}'"
        ))
    }
}

struct Bridge {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

pub struct MessageRouter {
    bus: Arc<dyn MessageBus>,
    manager: ConnectionManager,
    scanner: Arc<ScanCoordinator>,
    topics: TopicScheme,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
    bridges: HashMap<DeviceAddress, Bridge>,
}

impl MessageRouter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        manager: ConnectionManager,
        scanner: Arc<ScanCoordinator>,
        topics: TopicScheme,
        control_workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            manager,
            scanner,
            topics,
            workers: Arc::new(Semaphore::new(control_workers.max(1))),
            shutdown,
            bridges: HashMap::new(),
        }
    }

    /// Drive the router until shutdown. Consumes the inbound bus channel
    /// and the engine's event channel.
    pub async fn run(
        mut self,
        mut bus_rx: mpsc::UnboundedReceiver<BusMessage>,
        mut events_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    ) {
        for op in ControlOp::ALL {
            let topic = self.topics.control(op);
            if let Err(e) = self.bus.subscribe(&topic).await {
                error!("failed to subscribe control topic {}: {}", topic, e);
            }
        }
        info!("message router started (prefix {})", self.topics.prefix);

        // Control requests go through a dedicated dispatcher so that a
        // saturated worker pool queues further requests in acceptance
        // order without ever stalling the data path.
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let dispatcher = self.spawn_control_dispatcher(control_rx);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = bus_rx.recv() => match message {
                    Some(message) => self.handle_bus_message(message, &control_tx).await,
                    None => break,
                },
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        drop(control_tx);
        dispatcher.abort();
        for (_, bridge) in self.bridges.drain() {
            bridge.task.abort();
        }
        info!("message router stopped");
    }

    fn spawn_control_dispatcher(
        &self,
        mut control_rx: mpsc::UnboundedReceiver<(ControlOp, Value)>,
    ) -> JoinHandle<()> {
        let workers = self.workers.clone();
        let bus = self.bus.clone();
        let manager = self.manager.clone();
        let scanner = self.scanner.clone();
        let topics = self.topics.clone();
        tokio::spawn(async move {
            while let Some((op, payload)) = control_rx.recv().await {
                let Ok(permit) = workers.clone().acquire_owned().await else {
                    return; // pool closed only at shutdown
                };
                let bus = bus.clone();
                let manager = manager.clone();
                let scanner = scanner.clone();
                let topics = topics.clone();
                tokio::spawn(async move {
                    let _worker = permit;
                    handle_control(bus, manager, scanner, topics, op, payload).await;
                });
            }
        })
    }

    async fn handle_bus_message(
        &mut self,
        message: BusMessage,
        control_tx: &mpsc::UnboundedSender<(ControlOp, Value)>,
    ) {
        debug!("received message on {}", message.topic);
        match self.topics.route(&message.topic) {
            Ok(InboundRoute::Control(op)) => {
                // Validate JSON before accepting the request for dispatch.
                match serde_json::from_slice(&message.payload) {
                    Ok(payload) => {
                        let _ = control_tx.send((op, payload));
                    }
                    Err(e) => {
                        let reason =
                            format!("invalid JSON on control topic {}: {e}", message.topic);
                        publish_error(&self.bus, &self.topics, &reason).await;
                    }
                }
            }
            Ok(InboundRoute::DeviceTx(address)) => self.forward_to_device(address, message).await,
            Err(reason) => publish_error(&self.bus, &self.topics, &reason).await,
        }
    }

    /// Queue a bus payload for the device's bridge, preserving per-device
    /// arrival order.
    async fn forward_to_device(&mut self, address: DeviceAddress, message: BusMessage) {
        // Payloads are opaque but must at least be valid JSON.
        if serde_json::from_slice::<Value>(&message.payload).is_err() {
            let reason = format!("payload for BLE device {address} is not valid JSON");
            publish_error(&self.bus, &self.topics, &reason).await;
            return;
        }

        let delivered = self
            .bridges
            .get(&address)
            .map(|bridge| bridge.queue.send(message.payload).is_ok())
            .unwrap_or(false);
        if !delivered {
            let reason = format!("can't publish: BLE device {address} unknown or not connected");
            publish_error(&self.bus, &self.topics, &reason).await;
        }
    }

    async fn handle_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::DeviceData { address, payload } => {
                let topic = self.topics.data_rx(&address);
                if let Err(e) = self.bus.publish(&topic, payload).await {
                    error!("failed to proxy BLE payload from {}: {}", address, e);
                }
            }
            GatewayEvent::StateChanged {
                address,
                previous,
                current,
            } => {
                self.publish_state_change(address, previous, current).await;
                if current == Some(ConnectionState::Connected) {
                    self.start_bridge(address).await;
                } else if previous == Some(ConnectionState::Connected) {
                    self.stop_bridge(address).await;
                }
            }
            GatewayEvent::Fault { message } => {
                publish_error(&self.bus, &self.topics, &message).await;
            }
        }
    }

    async fn publish_state_change(
        &self,
        address: DeviceAddress,
        previous: Option<ConnectionState>,
        current: Option<ConnectionState>,
    ) {
        let body = json!({
            "ble-mac": address.to_string(),
            "previous-state": previous.map(|s| s.to_string()),
            "current-state": current.map(|s| s.to_string()),
        });
        publish_json(&self.bus, &self.topics.state(), body).await;
    }

    /// Begin bridging: subscribe the device's tx topic and start the
    /// ordered write loop. Runs exactly when a record enters `connected`.
    async fn start_bridge(&mut self, address: DeviceAddress) {
        if self.bridges.contains_key(&address) {
            return;
        }
        let tx_topic = self.topics.data_tx(&address);
        if let Err(e) = self.bus.subscribe(&tx_topic).await {
            error!("failed to subscribe {}: {}", tx_topic, e);
        }

        let (queue, mut queue_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let manager = self.manager.clone();
        let bus = self.bus.clone();
        let topics = self.topics.clone();
        let task = tokio::spawn(async move {
            while let Some(payload) = queue_rx.recv().await {
                if let Err(e) = manager.write(address, &payload).await {
                    let reason = format!("error publishing to BLE device {address}: {e}");
                    publish_error(&bus, &topics, &reason).await;
                }
            }
        });

        self.bridges.insert(address, Bridge { queue, task });
        info!("data bridge for {} started", address);
    }

    /// Stop bridging the moment the record leaves `connected`, whatever
    /// the reason.
    async fn stop_bridge(&mut self, address: DeviceAddress) {
        let Some(bridge) = self.bridges.remove(&address) else {
            return;
        };
        let tx_topic = self.topics.data_tx(&address);
        if let Err(e) = self.bus.unsubscribe(&tx_topic).await {
            warn!("failed to unsubscribe {}: {}", tx_topic, e);
        }
        bridge.task.abort();
        info!("data bridge for {} stopped", address);
    }
}

async fn handle_control(
    bus: Arc<dyn MessageBus>,
    manager: ConnectionManager,
    scanner: Arc<ScanCoordinator>,
    topics: TopicScheme,
    op: ControlOp,
    payload: Value,
) {
    match op {
        ControlOp::Connect => {
            let address = match require_mac(&payload) {
                Ok(address) => address,
                Err(reason) => return publish_error(&bus, &topics, &reason).await,
            };
            let (status, outcome) = match manager.connect(address).await {
                ConnectOutcome::Connected => (200, "success"),
                ConnectOutcome::Failed => (500, "failed"),
            };
            let body = json!({
                "status": status,
                "data": { "ble-mac": address.to_string(), "connect-status": outcome },
            });
            publish_json(&bus, &topics.control_response(op), body).await;
        }
        ControlOp::Disconnect => {
            let address = match require_mac(&payload) {
                Ok(address) => address,
                Err(reason) => return publish_error(&bus, &topics, &reason).await,
            };
            manager.disconnect(address).await;
            let body = json!({
                "status": 200,
                "data": { "ble-mac": address.to_string(), "disconnect-status": "success" },
            });
            publish_json(&bus, &topics.control_response(op), body).await;
        }
        ControlOp::List => {
            info!("device list requested");
            let data = serde_json::to_value(manager.list()).unwrap_or_else(|_| json!({}));
            let body = json!({ "status": 200, "data": data });
            publish_json(&bus, &topics.control_response(op), body).await;
        }
        ControlOp::Scan => match scanner.scan().await {
            Ok(report) => {
                let data = serde_json::to_value(report).unwrap_or_else(|_| json!({}));
                let body = json!({ "status": 200, "data": data });
                publish_json(&bus, &topics.control_response(op), body).await;
            }
            Err(e) => {
                publish_error(&bus, &topics, &format!("BLE device scan request error: {e}")).await;
            }
        },
    }
}

/// Extract and validate the required `ble-mac` field of a connect or
/// disconnect request.
fn require_mac(payload: &Value) -> Result<DeviceAddress, String> {
    let Some(raw) = payload.get("ble-mac").and_then(Value::as_str) else {
        return Err("control request missing required 'ble-mac' field".to_string());
    };
    raw.parse()
        .map_err(|e| format!("invalid 'ble-mac' field: {e}"))
}

async fn publish_json(bus: &Arc<dyn MessageBus>, topic: &str, body: Value) {
    match serde_json::to_vec(&body) {
        Ok(bytes) => {
            if let Err(e) = bus.publish(topic, bytes).await {
                error!("publish to {} failed: {}", topic, e);
            }
        }
        Err(e) => error!("failed to encode message for {}: {}", topic, e),
    }
}

async fn publish_error(bus: &Arc<dyn MessageBus>, topics: &TopicScheme, message: &str) {
    error!("{}", message);
    let body = json!({ "status": 500, "error-message": message });
    publish_json(bus, &topics.error(), body).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> TopicScheme {
        TopicScheme::new("gateway", "unit")
    }

    #[test]
    fn builds_expected_topics() {
        let topics = scheme();
        assert_eq!(
            topics.control(ControlOp::Connect),
            "gateway/unit/ble/control/connect"
        );
        assert_eq!(
            topics.control_response(ControlOp::Scan),
            "gateway/unit/ble/control/scan/response"
        );
        let address: DeviceAddress = "3C:61:05:12:EE:0A".parse().unwrap();
        assert_eq!(
            topics.data_tx(&address),
            "gateway/unit/ble/data/tx/3C:61:05:12:EE:0A"
        );
        assert_eq!(topics.error(), "gateway/unit/ble/error");
    }

    #[test]
    fn routes_control_topics() {
        let topics = scheme();
        assert_eq!(
            topics.route("gateway/unit/ble/control/list"),
            Ok(InboundRoute::Control(ControlOp::List))
        );
    }

    #[test]
    fn routes_device_tx_with_canonical_mac() {
        let topics = scheme();
        let route = topics
            .route("gateway/unit/ble/data/tx/ac:67:b2:3c:92:06")
            .unwrap();
        let InboundRoute::DeviceTx(address) = route else {
            panic!("expected a device tx route");
        };
        assert_eq!(address.to_string(), "AC:67:B2:3C:92:06");
    }

    #[test]
    fn rejects_bad_mac_in_tx_topic() {
        let topics = scheme();
        assert!(topics
            .route("gateway/unit/ble/data/tx/not-a-mac")
            .is_err());
    }

    #[test]
    fn rejects_unknown_topics() {
        let topics = scheme();
        assert!(topics.route("gateway/unit/ble/control/reboot").is_err());
        assert!(topics.route("something/else").is_err());
    }

    #[test]
    fn require_mac_distinguishes_missing_and_invalid() {
        assert!(require_mac(&json!({"unsupported": "command"}))
            .unwrap_err()
            .contains("ble-mac"));
        assert!(require_mac(&json!({"ble-mac": "nope"}))
            .unwrap_err()
            .contains("invalid"));
        let address = require_mac(&json!({"ble-mac": "3c:61:05:12:ee:0a"})).unwrap();
        assert_eq!(address.to_string(), "3C:61:05:12:EE:0A");
    }
}
