//! proxmon — fleet monitor for Proxmox VE and Proxmox Backup Server
//!
//! The crate polls every configured PVE cluster and PBS instance on a fixed
//! cadence, normalizes the results into a canonical resource model, derives
//! I/O rates from cumulative counters, evaluates per-resource alert
//! thresholds with hysteresis, and fans the resulting snapshots and alert
//! events out to push subscribers.

pub mod alerts;
pub mod config;
pub mod error;
pub mod fanout;
pub mod models;
pub mod monitor;
pub mod pbs;
pub mod proxmox;
pub mod state;
pub mod tls;

pub use config::{Config, PbsInstance, PveInstance};
pub use error::{ErrorKind, MonitorError};
pub use fanout::{Event, Hub, Subscription};
pub use monitor::Monitor;
pub use state::{State, StateSnapshot};
