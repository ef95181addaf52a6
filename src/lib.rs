//! BLE ↔ pub/sub gateway engine.
//!
//! Bridges Bluetooth LE UART peripherals to a topic-addressed publish/
//! subscribe message bus: four control operations (connect, disconnect,
//! list, scan) plus a bidirectional opaque-payload data bridge per
//! connected device.
//!
//! The crate is organized the same way top to bottom:
//! - [`domain`] - data model and settings
//! - [`infrastructure`] - radio backend, bus boundary, logging
//! - [`gateway`] - the engine: connection manager, scan coordinator,
//!   radio sessions and the message router

pub mod domain;
pub mod gateway;
pub mod infrastructure;
