/// Where user-visible failures are reported. Hosts with a UI show these as
/// notifications; the default just logs them.
pub trait NotificationSink: Send + Sync {
    fn notify_error(&self, channel_id: &str, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify_error(&self, channel_id: &str, message: &str) {
        tracing::error!(target = "session_bridge::notify", channel = %channel_id, "{message}");
    }
}
