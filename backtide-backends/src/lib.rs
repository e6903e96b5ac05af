//! Backup backends for Backtide
//!
//! - [`remote`]: Drive-shaped remote object store behind OAuth
//! - [`appliance`]: HTTP appliance on the local network

pub mod appliance;
pub mod remote;

pub use appliance::{ApplianceBackend, ApplianceBackendFactory};
pub use remote::{RemoteStoreBackend, RemoteStoreBackendFactory, TokenManager};

use backtide_core::backend::BackendRegistry;
use std::sync::Arc;

/// Registry with every backend of this crate
pub fn default_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(RemoteStoreBackendFactory));
    registry.register(Arc::new(ApplianceBackendFactory));
    registry
}

// Re-export core types for convenience
pub use backtide_core::{
    backend::{BackupBackend, BackupBatch, BatchOutcome},
    error::{BacktideError, BacktideResult},
};
