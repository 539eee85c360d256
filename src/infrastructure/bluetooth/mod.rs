//! Bluetooth Module
//!
//! Native device binding for the O2Ring.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  DeviceBindingService                    │
//! │   (single task: BindingClient in, DeviceEvent out)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!      ┌────────────┬───┴────────┬────────────┐
//!      ▼            ▼            ▼            ▼
//! ┌─────────┐ ┌────────────┐ ┌──────────┐ ┌─────────┐
//! │ Scanner │ │ Connection │ │ Protocol │ │ Convert │
//! │ - dedup │ │ - platform │ │ - names  │ │ - CSV   │
//! │ - cache │ │ - link     │ │ - lists  │ │ buckets │
//! └─────────┘ └────────────┘ └──────────┘ └─────────┘
//!                       │
//!                       ▼
//!               VendorSdk (callbacks)
//! ```
//!
//! ## Modules
//!
//! - [`sdk`] - Vendor SDK seam and its callback types
//! - [`protocol`] - Normalisation of raw SDK values
//! - [`scanner`] - Scan session de-duplication and device cache
//! - [`connection`] - Platform readiness strategy and link bookkeeping
//! - [`convert`] - Firmware recording to CSV
//! - [`service`] - The binding task and its client
//! - [`simulated`] - In-memory ring

pub mod connection;
pub mod convert;
pub mod protocol;
pub mod scanner;
pub mod sdk;
pub mod service;
pub mod simulated;

pub use connection::Platform;
pub use service::{BindingClient, BindingConfig, BindingRequest, DeviceBindingService};
pub use simulated::SimulatedRing;
