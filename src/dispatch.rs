//! Delivers detected follows to a [`Notifier`], one alert per account.

use crate::follows::{FollowedAccount, UserId};
use crate::notifier::{Alert, Notifier};
use std::time::Duration;
use tracing::{error, info};

/// Pause between two deliveries to the notifier.
pub const ALERT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Send one alert per entry of `follows` (oldest first), waiting `delay`
/// between deliveries. Failures are logged and never stop later alerts.
pub async fn dispatch(
    notifier: &dyn Notifier,
    target: &UserId,
    target_label: &str,
    follows: &[FollowedAccount],
    delay: Duration,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for (idx, account) in follows.iter().enumerate() {
        if idx > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let alert = Alert::new_follow(target_label, account);
        match notifier.send(&alert).await {
            Ok(()) => {
                report.sent += 1;
                info!(
                    target_id = %target,
                    "Alert sent for @{} (followed by {})",
                    account.handle,
                    target_label
                );
            }
            Err(e) => {
                report.failed += 1;
                error!(
                    target_id = %target,
                    phase = "dispatch",
                    account_id = %account.id,
                    "Failed to send alert for @{}: {}",
                    account.handle,
                    e
                );
            }
        }
    }

    report
}
