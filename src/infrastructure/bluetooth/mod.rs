//! Bluetooth Module
//!
//! Keeps one BLE fitness machine connected and exposes its protocol session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!     ┌─────────────┬───┴─────────┬──────────────┐
//!     │             │             │              │
//!     ▼             ▼             ▼              ▼
//! ┌──────────┐ ┌──────────┐ ┌────────────┐ ┌──────────┐
//! │Availabil.│ │ Scanner  │ │ Connection │ │ Session  │
//! │          │ │          │ │            │ │          │
//! │ - radio  │ │ - device │ │ - single   │ │ - FTMS   │
//! │   power  │ │   cache  │ │   link     │ │   service│
//! └──────────┘ └──────────┘ └────────────┘ └──────────┘
//!                       │
//!                       ▼
//!           RadioDriver / GattAccess (driver)
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - Radio and GATT abstractions, composed discovery stream
//! - [`availability`] - Radio availability monitor
//! - [`scanner`] - BLE device discovery cache
//! - [`connection`] - Single-connection state machine
//! - [`session`] - Protocol session derived from the connected device
//! - [`retry`] - Bounded retry policy
//! - [`protocol`] - Fitness Machine Service identifiers and session provider
//! - [`sim`] - In-memory radio for demos and tests
//! - [`service`] - Main service coordinator

pub mod availability;
pub mod connection;
pub mod driver;
pub mod protocol;
pub mod retry;
pub mod scanner;
pub mod service;
pub mod session;
pub mod sim;

#[cfg(test)]
mod testing;

// Re-export main service for convenience
pub use service::{ConnectionManager, ConnectionManagerConfig};
