//! Keeps a single BLE fitness machine connected: radio availability,
//! discovery, connection with bounded retries and the FTMS session.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{BleError, Result};
pub use infrastructure::bluetooth::{ConnectionManager, ConnectionManagerConfig};
