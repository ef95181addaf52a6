//! Radio backend boundary.
//!
//! The gateway talks to the physical BLE adapter exclusively through the
//! [`Radio`] and [`RadioLink`] traits, and always from behind the
//! [`RadioHandle`] gate: the adapter supports only one outstanding
//! link-layer operation (scan, connect attempt, or write) at a time, so
//! every component that touches the hardware acquires the gate first.
//!
//! ## Modules
//!
//! - [`btle`] - btleplug-backed implementation (BlueZ / CoreBluetooth / WinRT)

use crate::domain::models::{AddressType, DeviceAddress};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};

pub mod btle;

#[derive(Debug, Clone, Error)]
pub enum RadioError {
    /// The adapter itself is missing or unusable. Process-level: reported
    /// on the error topic, never retried.
    #[error("radio adapter unavailable: {0}")]
    Unavailable(String),
    /// A link operation did not complete in time. Retryable.
    #[error("radio operation timed out")]
    Timeout,
    /// Transient link failure (peripheral out of range, connection
    /// dropped mid-operation). Retryable.
    #[error("link error: {0}")]
    Link(String),
    /// Any other failure. Closes the owning session.
    #[error("fatal link error: {0}")]
    Fatal(String),
}

impl RadioError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Link(_))
    }
}

/// One raw advertisement event observed during a scan pass.
#[derive(Debug, Clone)]
pub struct RawAdvertisement {
    pub address: DeviceAddress,
    pub address_type: AddressType,
    pub rssi: i16,
    /// Ordered (type-code, value-bytes) fragments from the advertising data.
    pub fragments: Vec<(u8, Vec<u8>)>,
}

/// A freshly established link plus its notification stream.
///
/// The notification channel closes when the underlying link drops, which
/// is how link loss reaches the session receive loop.
pub struct LinkHandle {
    pub link: Box<dyn RadioLink>,
    pub address_type: AddressType,
    pub notifications: mpsc::Receiver<Vec<u8>>,
}

/// A single central-role BLE adapter.
#[async_trait]
pub trait Radio: Send + 'static {
    /// Run one bounded discovery pass and return the raw advertisement
    /// events in arrival order.
    async fn scan(&mut self, duration: Duration) -> Result<Vec<RawAdvertisement>, RadioError>;

    /// Establish a link to the given address.
    async fn open(&mut self, address: DeviceAddress) -> Result<LinkHandle, RadioError>;
}

/// One live link to one peripheral.
#[async_trait]
pub trait RadioLink: Send {
    async fn write(&mut self, payload: &[u8]) -> Result<(), RadioError>;

    /// Release the link. Idempotent; never fails from the caller's
    /// perspective.
    async fn close(&mut self);
}

/// The mutual-exclusion gate in front of the shared adapter.
///
/// Cloning shares the gate; every physical operation holds the lock for
/// its full duration. Multiple devices stay connected at the application
/// layer, but any given radio I/O op is exclusive.
#[derive(Clone)]
pub struct RadioHandle {
    inner: Arc<Mutex<Box<dyn Radio>>>,
}

impl RadioHandle {
    pub fn new(radio: impl Radio) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(radio))),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Radio>> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RadioError::Timeout.is_transient());
        assert!(RadioError::Link("supervision timeout".into()).is_transient());
        assert!(!RadioError::Fatal("characteristic missing".into()).is_transient());
        assert!(!RadioError::Unavailable("no adapter".into()).is_transient());
    }
}
