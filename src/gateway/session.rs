//! Radio session.
//!
//! One [`RadioSession`] per device in `connected` state, owning the live
//! link. Writes are serialized through the shared radio gate; inbound
//! notifications are forwarded to the gateway event channel in arrival
//! order by a dedicated receive task. The session never outlives its
//! connection record and is destroyed whenever the record leaves
//! `connected`.

use crate::domain::models::{DeviceAddress, GatewayEvent};
use crate::infrastructure::radio::{LinkHandle, RadioError, RadioHandle, RadioLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub struct RadioSession {
    address: DeviceAddress,
    radio: RadioHandle,
    link: Mutex<Box<dyn RadioLink>>,
    closed: AtomicBool,
    lost_tx: Arc<watch::Sender<bool>>,
    lost_rx: watch::Receiver<bool>,
    rx_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RadioSession {
    /// Take ownership of a freshly opened link and start the receive loop.
    pub fn start(
        address: DeviceAddress,
        radio: RadioHandle,
        handle: LinkHandle,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Arc<Self> {
        let LinkHandle {
            link,
            mut notifications,
            ..
        } = handle;

        let (lost_tx, lost_rx) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);
        let task_lost = lost_tx.clone();

        let rx_task = tokio::spawn(async move {
            while let Some(payload) = notifications.recv().await {
                trace!("notification from {}: {} bytes", address, payload.len());
                if events
                    .send(GatewayEvent::DeviceData { address, payload })
                    .is_err()
                {
                    // Router gone; the process is shutting down.
                    break;
                }
            }
            debug!("notification stream for {} ended", address);
            let _ = task_lost.send(true);
        });

        Arc::new(Self {
            address,
            radio,
            link: Mutex::new(link),
            closed: AtomicBool::new(false),
            lost_tx,
            lost_rx,
            rx_task: StdMutex::new(Some(rx_task)),
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Write a payload to the peripheral. Transient failures are returned
    /// to the caller as retryable; anything else closes the session.
    pub async fn write(&self, payload: &[u8]) -> Result<(), RadioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RadioError::Link(format!(
                "session for {} is closed",
                self.address
            )));
        }

        let result = {
            let _radio = self.radio.lock().await;
            let mut link = self.link.lock().await;
            link.write(payload).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!("transient write failure to {}: {}", self.address, e);
                Err(e)
            }
            Err(e) => {
                warn!("fatal write failure to {}: {} - closing session", self.address, e);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Resolves when the link is lost or the session is closed.
    pub async fn wait_lost(&self) {
        let mut rx = self.lost_rx.clone();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    /// Release the link. Idempotent; the underlying handle is guaranteed
    /// released on every exit path.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing session for {}", self.address);
        {
            let _radio = self.radio.lock().await;
            let mut link = self.link.lock().await;
            link.close().await;
        }
        if let Some(task) = self
            .rx_task
            .lock()
            .expect("session receive task slot poisoned")
            .take()
        {
            task.abort();
        }
        let _ = self.lost_tx.send(true);
    }
}
