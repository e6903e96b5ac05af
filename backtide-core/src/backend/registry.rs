use super::BackupBackend;
use crate::abstractions::time::Clock;
use crate::config::BacktideConfig;
use crate::error::{BacktideError, BacktideResult};
use crate::storage::SettingsStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a factory may need to build a backend
#[derive(Clone)]
pub struct BackendContext {
    pub config: BacktideConfig,
    pub settings: Arc<dyn SettingsStore>,
    pub clock: Arc<dyn Clock>,
}

/// Factory trait for creating backup backends
pub trait BackendFactory: Send + Sync {
    fn create_backend(&self, context: &BackendContext) -> BacktideResult<Arc<dyn BackupBackend>>;

    /// Location key, e.g. `google-drive`
    fn backend_type(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

/// Registry for backend factories
///
/// Concrete backends live in a separate crate, so the binary registers
/// them at startup.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        let backend_type = factory.backend_type().to_string();
        tracing::info!(
            "Registering backup backend: {} ({})",
            backend_type,
            factory.description()
        );
        self.factories.insert(backend_type, factory);
    }

    pub fn create_backend(
        &self,
        backend_type: &str,
        context: &BackendContext,
    ) -> BacktideResult<Arc<dyn BackupBackend>> {
        let factory = self.factories.get(backend_type).ok_or_else(|| {
            BacktideError::configuration(
                "backup.location",
                format!(
                    "Unknown backup backend: '{}'. Available backends: {:?}",
                    backend_type,
                    self.list_available_backends()
                ),
            )
        })?;

        factory.create_backend(context)
    }

    pub fn list_available_backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn get_backend_info(&self) -> Vec<(String, String)> {
        self.factories
            .values()
            .map(|f| (f.backend_type().to_string(), f.description().to_string()))
            .collect()
    }
}
