use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::UtilError;
use crate::Result;

/// Cooperative cancellation signal shared across a transport exchange,
/// pack decode, or delta resolution pass.
///
/// Cloning shares the same underlying flag; cancel propagates to every
/// clone. Checked at well-defined points (between pkt-line frames, between
/// pack entries, between delta operations) rather than via thread
/// termination, so partial state can be cleaned up deterministically.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(UtilError::Canceled)` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UtilError::Canceled)
        } else {
            Ok(())
        }
    }
}
