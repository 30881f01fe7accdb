//! Scheduling of the collect-metrics hook.

use std::time::Duration;

/// How long to wait before the next collect-metrics hook.
///
/// `now` and `last` are Unix timestamps in seconds. A collection that is
/// already overdue is due immediately.
#[must_use]
pub fn collect_metrics_delay(now: i64, last: i64, interval: Duration) -> Duration {
    let elapsed = u64::try_from(now.saturating_sub(last)).unwrap_or(0);
    interval.saturating_sub(Duration::from_secs(elapsed))
}

/// Sleep for `delay`, or forever if there is nothing to wait for.
pub async fn sleep_or_pending(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
