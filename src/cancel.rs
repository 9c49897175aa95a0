//! Cooperative cancellation.
//!
//! A [`CancelSource`] owns the cancel signal; cloned [`CancelToken`]s
//! are handed down through every layer (task queue → collector → HTTP
//! client → rate-limit wait) so long-running operations can observe the
//! caller's cancellation without detaching from its scope.

use tokio::sync::watch;

/// Owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Observing side, cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal cancellation to every token cloned from this source.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that can never be cancelled, for callers without a scope.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled; pends forever if the
    /// source is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let ok = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !ok {
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_observed_by_clones() {
        let source = CancelSource::new();
        let token = source.token();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
        // Already-cancelled token resolves immediately.
        tokio::time::timeout(Duration::from_millis(50), clone.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = CancelToken::never();
        let waited =
            tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err());
    }
}
