//! Best-effort announcements of new merge requests.
//!
//! Notification is a side channel: failures are logged and never affect
//! admission, so the trait is infallible from the caller's point of view.

use tracing::info;

/// Announcement sink for newly created merge requests.
pub trait Notifier: Send + Sync {
    /// Announces a new merge request. Must not block for long and must
    /// swallow its own failures.
    fn notify_merge_request(&self, url: &str);
}

/// Notifier that writes announcements to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_merge_request(&self, url: &str) {
        info!(%url, "new merge request");
    }
}
