//! Device registry.
//!
//! The authoritative mapping from peripheral address to connection state
//! and owned radio session. The registry is plain storage: every state
//! transition is performed by the connection manager, which is the single
//! writer. Readers (the list operation) only ever take a snapshot.

use crate::domain::models::{AddressType, ConnectionState, DeviceAddress, DeviceStatus};
use crate::gateway::session::RadioSession;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One record per address with an outstanding connect request. Absence of
/// a record is the `disconnected` state.
pub struct ConnectionRecord {
    pub state: ConnectionState,
    pub address_type: Option<AddressType>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub session: Option<Arc<RadioSession>>,
    pub supervisor: Option<JoinHandle<()>>,
    pub cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

/// Parts of a removed record the manager still has to tear down.
pub struct RemovedRecord {
    pub state: ConnectionState,
    pub session: Option<Arc<RadioSession>>,
    pub supervisor: Option<JoinHandle<()>>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceAddress, ConnectionRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceAddress, ConnectionRecord>> {
        self.devices.lock().expect("device registry lock poisoned")
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.lock().contains_key(address)
    }

    pub fn state(&self, address: &DeviceAddress) -> Option<ConnectionState> {
        self.lock().get(address).map(|record| record.state)
    }

    /// Create a fresh record in `connecting` and return a watch on its
    /// state transitions.
    pub fn insert_connecting(
        &self,
        address: DeviceAddress,
        cancel: CancellationToken,
    ) -> watch::Receiver<ConnectionState> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        self.lock().insert(
            address,
            ConnectionRecord {
                state: ConnectionState::Connecting,
                address_type: None,
                retry_count: 0,
                last_error: None,
                session: None,
                supervisor: None,
                cancel,
                state_tx,
            },
        );
        state_rx
    }

    pub fn attach_supervisor(&self, address: &DeviceAddress, handle: JoinHandle<()>) {
        if let Some(record) = self.lock().get_mut(address) {
            record.supervisor = Some(handle);
        }
    }

    /// Transition a record's state; returns the previous state if the
    /// record exists.
    pub fn set_state(
        &self,
        address: &DeviceAddress,
        state: ConnectionState,
    ) -> Option<ConnectionState> {
        let mut devices = self.lock();
        let record = devices.get_mut(address)?;
        let previous = record.state;
        record.state = state;
        let _ = record.state_tx.send(state);
        Some(previous)
    }

    /// Transition to `connected`, recording the address type and the owned
    /// session. Returns the previous state.
    pub fn set_connected(
        &self,
        address: &DeviceAddress,
        address_type: AddressType,
        session: Arc<RadioSession>,
    ) -> Option<ConnectionState> {
        let mut devices = self.lock();
        let record = devices.get_mut(address)?;
        let previous = record.state;
        record.state = ConnectionState::Connected;
        record.address_type = Some(address_type);
        record.session = Some(session);
        record.last_error = None;
        let _ = record.state_tx.send(ConnectionState::Connected);
        Some(previous)
    }

    /// Transition to `retrying` after a failed attempt or a lost link,
    /// dropping any owned session reference. Returns the previous state.
    pub fn set_retrying(&self, address: &DeviceAddress, error: String) -> Option<ConnectionState> {
        let mut devices = self.lock();
        let record = devices.get_mut(address)?;
        let previous = record.state;
        record.state = ConnectionState::Retrying;
        record.retry_count += 1;
        record.last_error = Some(error);
        record.session = None;
        let _ = record.state_tx.send(ConnectionState::Retrying);
        Some(previous)
    }

    pub fn session(&self, address: &DeviceAddress) -> Option<Arc<RadioSession>> {
        self.lock().get(address).and_then(|r| r.session.clone())
    }

    pub fn retry_count(&self, address: &DeviceAddress) -> Option<u32> {
        self.lock().get(address).map(|r| r.retry_count)
    }

    /// Delete the record, handing back whatever still needs tearing down.
    pub fn remove(&self, address: &DeviceAddress) -> Option<RemovedRecord> {
        self.lock().remove(address).map(|record| RemovedRecord {
            state: record.state,
            session: record.session,
            supervisor: record.supervisor,
            cancel: record.cancel,
        })
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.lock().keys().copied().collect()
    }

    /// Consistent snapshot for the list operation.
    pub fn snapshot(&self) -> BTreeMap<DeviceAddress, DeviceStatus> {
        self.lock()
            .iter()
            .map(|(address, record)| {
                (
                    *address,
                    DeviceStatus {
                        connection_state: record.state,
                        addr_type: record.address_type,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    #[test]
    fn record_lifecycle() {
        let registry = DeviceRegistry::new();
        let address = addr("AC:67:B2:3C:92:06");
        assert!(!registry.contains(&address));

        let watch = registry.insert_connecting(address, CancellationToken::new());
        assert_eq!(*watch.borrow(), ConnectionState::Connecting);
        assert_eq!(registry.state(&address), Some(ConnectionState::Connecting));

        let previous = registry.set_retrying(&address, "timed out".to_string());
        assert_eq!(previous, Some(ConnectionState::Connecting));
        assert_eq!(registry.retry_count(&address), Some(1));
        assert_eq!(*watch.borrow(), ConnectionState::Retrying);

        let removed = registry.remove(&address).unwrap();
        assert_eq!(removed.state, ConnectionState::Retrying);
        assert!(!registry.contains(&address));
        assert!(registry.remove(&address).is_none());
    }

    #[test]
    fn snapshot_reflects_records() {
        let registry = DeviceRegistry::new();
        assert!(registry.snapshot().is_empty());

        let a = addr("AC:67:B2:3C:92:06");
        let b = addr("AC:67:B2:3C:92:07");
        registry.insert_connecting(a, CancellationToken::new());
        registry.insert_connecting(b, CancellationToken::new());
        registry.set_retrying(&b, "no response".to_string());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot[&a].connection_state,
            ConnectionState::Connecting
        );
        assert_eq!(snapshot[&b].connection_state, ConnectionState::Retrying);
        assert!(snapshot[&a].addr_type.is_none());
    }
}
