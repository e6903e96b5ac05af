//! Sink for user-facing backup notifications

use crate::error::BacktideResult;
use crate::types::NotificationId;
use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Show a notification; `store` keeps it in the user's inbox as well
    async fn dispatch(&self, id: NotificationId, store: bool) -> BacktideResult<()>;
}

/// Notifier that only writes a log line
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn dispatch(&self, id: NotificationId, store: bool) -> BacktideResult<()> {
        warn!(notification = %id, store, "Backup problem notification");
        Ok(())
    }
}
