//! Backoff arithmetic and the cancelable backoff wait.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;

/// Retry counter after one more failure. Grows by one, capped at
/// `max_exponent`.
pub fn next_retry_count(current: u32, max_exponent: u32) -> u32 {
    current.saturating_add(1).min(max_exponent)
}

/// Delay before resubscribing: `retry_base * 2^retry_count`.
pub fn retry_delay(config: &SyncConfig, retry_count: u32) -> Duration {
    config
        .retry_base
        .saturating_mul(2u32.saturating_pow(retry_count.min(config.max_retry_exponent)))
}

/// Delay before re-adding a downed stream:
/// `min(stream_down_base * 2^attempt, stream_down_max)`.
pub fn stream_down_delay(config: &SyncConfig, attempt: u32) -> Duration {
    config
        .stream_down_base
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(config.stream_down_max)
}

/// How a backoff wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full delay elapsed.
    Elapsed,
    /// The release token fired (stop, foreground, network back).
    Released,
    /// The wait was parked offline and the network came back.
    Reconnected,
}

/// Wait out `delay` unless released first.
///
/// Going offline abandons the timer and parks the wait until either the
/// network returns or the token fires; a stale timer is never waited out
/// after reconnecting.
pub async fn backoff_wait(
    delay: Duration,
    release: &CancellationToken,
    online: &mut watch::Receiver<bool>,
) -> WaitOutcome {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        if !*online.borrow_and_update() {
            loop {
                tokio::select! {
                    _ = release.cancelled() => return WaitOutcome::Released,
                    changed = online.changed() => {
                        if changed.is_err() || *online.borrow_and_update() {
                            return WaitOutcome::Reconnected;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = &mut sleep => return WaitOutcome::Elapsed,
            _ = release.cancelled() => return WaitOutcome::Released,
            changed = online.changed() => {
                if changed.is_err() {
                    // Nobody reports network status any more; just wait out the delay.
                    tokio::select! {
                        _ = &mut sleep => return WaitOutcome::Elapsed,
                        _ = release.cancelled() => return WaitOutcome::Released,
                    }
                }
            }
        }
    }
}
