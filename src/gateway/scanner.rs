//! Scan coordinator.
//!
//! Runs bounded-duration discovery passes against the shared radio. The
//! hardware cannot run two scans at once, so passes are single-flight: a
//! scan request arriving while a pass is in progress joins it and
//! receives the same result instead of starting another one.
//!
//! Reports are built fresh per pass and never merged across passes; the
//! coordinator reads connection state from nobody and mutates none.

use crate::domain::models::{AdvertisementReport, ScanReport};
use crate::gateway::advertisement;
use crate::infrastructure::radio::{RadioError, RadioHandle, RawAdvertisement};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

type PassResult = Result<ScanReport, RadioError>;

pub struct ScanCoordinator {
    radio: RadioHandle,
    pass_duration: Duration,
    in_flight: Mutex<Option<broadcast::Sender<PassResult>>>,
}

impl ScanCoordinator {
    pub fn new(radio: RadioHandle, pass_duration: Duration) -> Self {
        Self {
            radio,
            pass_duration,
            in_flight: Mutex::new(None),
        }
    }

    /// Run one discovery pass, or join the pass already in progress.
    pub async fn scan(&self) -> PassResult {
        let waiter = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *slot = Some(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            debug!("scan already in progress; awaiting its result");
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(RadioError::Fatal("scan pass aborted".to_string())),
            };
        }

        info!("BLE scan requested ({:?} pass)", self.pass_duration);
        let result = self.run_pass().await;

        let finished = self
            .in_flight
            .lock()
            .await
            .take()
            .expect("in-flight scan slot cleared externally");
        let _ = finished.send(result.clone());
        result
    }

    async fn run_pass(&self) -> PassResult {
        let events = {
            let mut radio = self.radio.lock().await;
            radio.scan(self.pass_duration).await?
        };
        let report = aggregate(events);
        info!("scan pass complete: {} device(s)", report.len());
        Ok(report)
    }
}

/// Fold raw advertisement events into one report per address: most recent
/// signal strength wins, first occurrence of an advertisement type wins.
pub fn aggregate(events: Vec<RawAdvertisement>) -> ScanReport {
    let mut report = ScanReport::new();
    for event in events {
        let entry = report
            .entry(event.address)
            .or_insert_with(|| AdvertisementReport {
                address: event.address,
                address_type: event.address_type,
                signal_strength: event.rssi,
                data_types: Default::default(),
            });
        entry.signal_strength = event.rssi;
        for (adtype, value) in &event.fragments {
            entry
                .data_types
                .entry(adtype.to_string())
                .or_insert_with(|| advertisement::decode_fragment(*adtype, value));
        }
    }
    report
}
