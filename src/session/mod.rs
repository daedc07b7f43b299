//! Per-identity session lifecycle
//!
//! - **Supervisor**: connect, run the protocol, classify the failure, back off, loop
//! - **Heartbeat**: client-initiated PINGs for one live connection
//! - **Backoff**: doubling delay with a cap

pub mod backoff;
pub mod heartbeat;
pub mod supervisor;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use backoff::Backoff;
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use supervisor::{is_cap_exceeded, SessionDeps, Supervisor, SupervisorConfig};

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
