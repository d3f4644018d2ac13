//! Good Sleep commissioning
//!
//! Puts a Good Sleep bed sensor on a Wi-Fi network and keeps an eye on it
//! afterwards.
//!
//! This crate provides:
//! - capability traits for the Bluetooth adapter, the host Wi-Fi, the device
//!   status service and persistence
//! - discovery, negotiation, network selection, provisioning and status
//!   monitoring on top of them
//! - liveness monitoring once the sensor is online
//! - desktop implementations: btleplug, HTTP, JSON file
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use goodsleep_commission::*;
//!
//! let ctx = Commissioner::new(adapter, network, endpoint, store, config);
//! let devices = ctx.scan().await?.finish().await?;
//! let paired = ctx.negotiator().connect_device(&devices[0]).await?;
//! let chosen = ctx.network_selector().current_network().await?;
//! let done = ctx.commission(&paired, &chosen, "s3cret!", ctx.status_monitor()).await?;
//! ```

pub mod adapter;
pub mod ble;
pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod identity;
pub mod liveness;
pub mod negotiate;
pub mod network;
pub mod provision;
pub mod session;
pub mod status;
pub mod storage;
pub mod wifi;

pub use adapter::*;
pub use ble::BtleplugAdapter;
pub use config::{CommissionConfig, goodsleep_home};
pub use discovery::{DiscoveredDevice, DiscoveryScanner, ScanHandle, ScanOptions, ScanSet};
pub use error::{AbandonReason, AdapterError, CommissionError, LivenessError, NetworkError, StorageError};
pub use http::HttpLivenessEndpoint;
pub use identity::{AddressSource, ResolvedAddress};
pub use liveness::*;
pub use negotiate::{Capability, CapabilityNegotiator, PairedDevice};
pub use network::{ChosenNetwork, NetworkCandidate, NetworkSelector};
pub use provision::{CredentialProvisioner, Observation, Phase, ProvisioningSession};
pub use session::{Commissioned, Commissioner};
pub use status::{AbandonHandle, StatusEvent, StatusMonitor};
pub use storage::{JsonFileStore, MemoryStore, PairedIdentity, PersistenceService};
pub use wifi::{BandEvidence, FrequencyBand, NetworkService, WifiInfo};
