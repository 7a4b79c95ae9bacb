//! Small shared helpers.

use std::time::Duration;

use tokio::time::Instant;

/// A deadline far enough away to stand in for "no deadline" in a
/// select loop.
pub(crate) fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}
