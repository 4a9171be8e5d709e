use std::sync::Arc;

use tokio::sync::watch;

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for it.
    Requested,
    /// A step or registration failed and the run is not continuing on error.
    Failure,
}

/// Cooperative cancellation shared by every task of a run.
///
/// The first reason wins; later calls are ignored. Clones observe the same
/// state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Requested);
    }

    pub fn cancel_with(&self, reason: CancelReason) {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(Option::is_some).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
