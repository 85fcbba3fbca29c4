use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timed sleep that an external `cancel` cuts short.
#[derive(Debug, Clone, Default)]
pub struct Sleeper {
    token: CancellationToken,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares `token`, so cancelling the owner also wakes the sleeper.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Returns `true` when the sleep was cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.token.cancelled() => true,
            () = tokio::time::sleep(duration) => self.token.is_cancelled(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
