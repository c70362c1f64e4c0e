use crate::AccountId;
use async_trait::async_trait;
use tracing::info;

/// Outbound notification capability, implemented by the excluded transport
/// layer. Delivery is best-effort and fire-and-forget: implementations must
/// never surface a failure that could roll back a committed ledger mutation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account: AccountId, message: &str);
}

/// Default sink: writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, account: AccountId, message: &str) {
        info!(account = %account, message, "📨 Notification");
    }
}

/// Silent sink for tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _account: AccountId, _message: &str) {}
}
