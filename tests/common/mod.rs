#![allow(dead_code)]

/// Common test utilities
///
/// Shared fixtures for the integration tests:
/// - A client configuration with millisecond settle and network-cycle delays
/// - A client wired to a fault-injecting in-memory driver
/// - Canonical fatal and transient driver errors
/// - A check over the driver call log for work done while offline

use resilient_docstore::driver::{DriverOp, MemoryDriver};
use resilient_docstore::{ClientConfig, DriverError, ResilientClient};
use serde_json::json;
use std::sync::Arc;

pub const FATAL_MESSAGE: &str =
    "FIRESTORE (9.6.1) INTERNAL ASSERTION FAILED: Unexpected state (ID: ca9)";

/// Default configuration with short reconnection delays
///
/// Backoff keeps its defaults (1 s base, 10 s cap) so tests can assert on
/// the documented schedule under paused time.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        settle_delay_ms: 10,
        network_cycle_delay_ms: 10,
        ..ClientConfig::default()
    }
}

/// Driver seeded with a small `tours` collection
pub fn seeded_driver() -> MemoryDriver {
    let driver = MemoryDriver::new();
    driver.insert("tours/lisbon", json!({"city": "Lisbon", "price": 120}));
    driver.insert("tours/porto", json!({"city": "Porto", "price": 80}));
    driver
}

pub fn client_with_driver() -> (ResilientClient, MemoryDriver) {
    client_with_config(fast_config())
}

pub fn client_with_config(config: ClientConfig) -> (ResilientClient, MemoryDriver) {
    let driver = seeded_driver();
    let client = ResilientClient::new(Arc::new(driver.clone()), config);
    (client, driver)
}

pub fn fatal_error() -> DriverError {
    DriverError::message(FATAL_MESSAGE)
}

pub fn transient_error() -> DriverError {
    DriverError::new("deadline-exceeded", "Deadline exceeded")
}

pub fn unavailable_error() -> DriverError {
    DriverError::new("unavailable", "The service is currently unavailable")
}

/// Fail if a document read or write ran between a network disable and the next enable
pub fn assert_no_document_calls_while_offline(log: &[DriverOp]) {
    let mut offline = false;
    for (i, op) in log.iter().enumerate() {
        match op {
            DriverOp::DisableNetwork => offline = true,
            DriverOp::EnableNetwork => offline = false,
            op if op.requires_network() => {
                assert!(!offline, "{:?} at position {} ran while offline: {:?}", op, i, log)
            }
            _ => {}
        }
    }
}
