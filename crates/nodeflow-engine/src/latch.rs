use std::sync::OnceLock;

use tokio::sync::Notify;

/// Broadcast-once completion signal.
///
/// One writer sets the value exactly once; any number of readers wait for
/// it, including readers that arrive after it was set.
pub struct CompletionLatch<T> {
    value: OnceLock<T>,
    notify: Notify,
}

impl<T: Clone> CompletionLatch<T> {
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Set the value and wake every waiter.
    /// Returns false (and drops `value`) if the latch was already signaled.
    pub fn signal(&self, value: T) -> bool {
        if self.value.set(value).is_err() {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn get(&self) -> Option<T> {
        self.value.get().cloned()
    }

    pub fn is_signaled(&self) -> bool {
        self.value.get().is_some()
    }

    /// Wait until signaled and return a copy of the value.
    pub async fn wait(&self) -> T {
        loop {
            // Register before checking so a signal in between is not lost.
            let notified = self.notify.notified();
            if let Some(value) = self.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for CompletionLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CompletionLatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("value", &self.value.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn late_waiter_sees_value() {
        let latch = CompletionLatch::new();
        assert!(!latch.is_signaled());
        assert!(latch.signal(7));
        assert_eq!(latch.wait().await, 7);
        assert_eq!(latch.get(), Some(7));
    }

    #[tokio::test]
    async fn second_signal_is_ignored() {
        let latch = CompletionLatch::new();
        assert!(latch.signal("first"));
        assert!(!latch.signal("second"));
        assert_eq!(latch.wait().await, "first");
    }

    #[tokio::test]
    async fn wakes_all_waiters() {
        let latch = Arc::new(CompletionLatch::<u32>::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        latch.signal(42);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn unsignaled_latch_blocks() {
        let latch = CompletionLatch::<u32>::new();
        let result = tokio::time::timeout(Duration::from_millis(10), latch.wait()).await;
        assert!(result.is_err());
    }
}
