//! Shared test harness: a scripted in-memory radio plus a gateway wired
//! to the in-process bus.

use async_trait::async_trait;
use ble_gateway::domain::models::{AddressType, DeviceAddress};
use ble_gateway::domain::settings::Settings;
use ble_gateway::gateway::{ControlOp, Gateway, TopicScheme};
use ble_gateway::infrastructure::bus::{BusMessage, LocalBus};
use ble_gateway::infrastructure::radio::{
    LinkHandle, Radio, RadioError, RadioHandle, RadioLink, RawAdvertisement,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// One scripted peripheral the mock radio can connect to.
pub struct MockPeripheral {
    reachable: AtomicBool,
    connected: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
    notify: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl MockPeripheral {
    fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            connected: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            notify: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Emit a notification toward the gateway.
    pub async fn notify(&self, payload: &[u8]) {
        let sender = self.notify.lock().unwrap().clone();
        let sender = sender.expect("peripheral has no live link");
        sender.send(payload.to_vec()).await.unwrap();
    }

    /// Simulate an unexpected link drop.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify.lock().unwrap().take();
    }
}

#[derive(Default)]
pub struct MockState {
    peripherals: Mutex<HashMap<DeviceAddress, Arc<MockPeripheral>>>,
    scan_events: Mutex<Vec<RawAdvertisement>>,
    scan_count: AtomicUsize,
    scan_delay_ms: AtomicUsize,
}

impl MockState {
    pub fn add_peripheral(&self, address: DeviceAddress) -> Arc<MockPeripheral> {
        let peripheral = MockPeripheral::new(true);
        self.peripherals
            .lock()
            .unwrap()
            .insert(address, peripheral.clone());
        peripheral
    }

    pub fn set_scan_events(&self, events: Vec<RawAdvertisement>) {
        *self.scan_events.lock().unwrap() = events;
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        self.scan_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }
}

pub struct MockRadio {
    state: Arc<MockState>,
}

#[async_trait]
impl Radio for MockRadio {
    async fn scan(&mut self, _duration: Duration) -> Result<Vec<RawAdvertisement>, RadioError> {
        self.state.scan_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.scan_delay_ms.load(Ordering::SeqCst);
        sleep(Duration::from_millis(delay as u64)).await;
        Ok(self.state.scan_events.lock().unwrap().clone())
    }

    async fn open(&mut self, address: DeviceAddress) -> Result<LinkHandle, RadioError> {
        let peripheral = self.state.peripherals.lock().unwrap().get(&address).cloned();
        match peripheral {
            Some(peripheral) if peripheral.reachable.load(Ordering::SeqCst) => {
                let (tx, rx) = mpsc::channel(16);
                *peripheral.notify.lock().unwrap() = Some(tx);
                peripheral.connected.store(true, Ordering::SeqCst);
                Ok(LinkHandle {
                    link: Box::new(MockLink {
                        peripheral: peripheral.clone(),
                    }),
                    address_type: AddressType::Public,
                    notifications: rx,
                })
            }
            _ => Err(RadioError::Timeout),
        }
    }
}

struct MockLink {
    peripheral: Arc<MockPeripheral>,
}

#[async_trait]
impl RadioLink for MockLink {
    async fn write(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        if !self.peripheral.connected.load(Ordering::SeqCst) {
            return Err(RadioError::Link("link dropped".to_string()));
        }
        self.peripheral
            .writes
            .lock()
            .unwrap()
            .push(payload.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        self.peripheral.connected.store(false, Ordering::SeqCst);
        self.peripheral.notify.lock().unwrap().take();
    }
}

pub struct Harness {
    pub bus: Arc<LocalBus>,
    pub topics: TopicScheme,
    pub state: Arc<MockState>,
    pub shutdown: CancellationToken,
    _gateway_task: JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let mut settings = Settings::default();
        settings.gateway_id = "test".to_string();
        settings.scan_secs = 0;
        settings.connect_window_secs = 1;
        settings.retry_backoff_ms = 50;

        let state = Arc::new(MockState::default());
        let radio = RadioHandle::new(MockRadio {
            state: state.clone(),
        });

        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(LocalBus::new(bus_tx));
        let topics = TopicScheme::new(&settings.topic_root, &settings.gateway_id);

        let gateway = Gateway::new(&settings, radio, bus.clone(), bus_rx);
        let shutdown = gateway.shutdown_handle();
        let gateway_task = tokio::spawn(gateway.run());

        // The router subscribes its control topics on startup.
        let connect_topic = topics.control(ControlOp::Connect);
        let bus_ready = bus.clone();
        wait_until(move || bus_ready.is_subscribed(&connect_topic)).await;

        Self {
            bus,
            topics,
            state,
            shutdown,
            _gateway_task: gateway_task,
        }
    }

    /// Observe everything the gateway publishes from this point on.
    pub fn published(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.published()
    }

    pub fn send(&self, topic: &str, payload: &str) -> bool {
        self.bus.inject(topic, payload.as_bytes().to_vec())
    }
}

/// Receive the next message on `topic`, skipping others, within 5s.
pub async fn recv_on(rx: &mut broadcast::Receiver<BusMessage>, topic: &str) -> BusMessage {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Ok(message)) if message.topic == topic => return message,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                eprintln!("observer lagged, skipped {skipped} messages");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("publish stream closed"),
            Err(_) => panic!("no message on {topic} within 5s"),
        }
    }
}

pub async fn recv_json_on(rx: &mut broadcast::Receiver<BusMessage>, topic: &str) -> Value {
    let message = recv_on(rx, topic).await;
    serde_json::from_slice(&message.payload).expect("published payload is not JSON")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        sleep(Duration::from_millis(10)).await;
    }
}
