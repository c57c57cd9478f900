//! Quota usage reporting
//!
//! Forwards the number of secured resources in use to the platform: once at
//! startup and afterwards only when the count changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::Quota;
use crate::authority::AuthorityError;

/// Sink for quota usage reports
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// Report how many secured routes are currently in use
    async fn report_secured_routes_in_use(&self, in_use: i64) -> Result<(), AuthorityError>;
}

/// Poll `quota` every `interval` and report changes until `token` is cancelled.
///
/// Each report is bounded by `timeout`. Failures are logged and retried on the
/// next tick; they never stop the loop.
pub async fn run_reporter(
    quota: Arc<Quota>,
    reporter: Arc<dyn UsageReporter>,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_reported: Option<i64> = None;

    info!(interval_secs = interval.as_secs(), "Quota reporter started");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Quota reporter stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let in_use = quota.used();
        if last_reported == Some(in_use) {
            continue;
        }

        match tokio::time::timeout(timeout, reporter.report_secured_routes_in_use(in_use)).await {
            Ok(Ok(())) => {
                debug!(in_use, "Reported secured routes in use");
                last_reported = Some(in_use);
            }
            Ok(Err(e)) => warn!(in_use, error = %e, "Failed to report quota usage"),
            Err(_) => warn!(
                in_use,
                timeout_secs = timeout.as_secs(),
                "Timed out reporting quota usage"
            ),
        }
    }
}
