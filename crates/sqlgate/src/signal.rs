use tokio::sync::Notify;

/// One-slot notifier used to wake background workers.
///
/// `send` never blocks and coalesces: if a notification is already pending it
/// is dropped. Receivers treat each wake-up as "check the world", not as one
/// event to process.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    notify: Notify,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn send(&self) {
        // Notify stores at most one permit, which is exactly the one-slot
        // semantics we need.
        self.notify.notify_one();
    }

    pub(crate) async fn recv(&self) {
        self.notify.notified().await;
    }
}
