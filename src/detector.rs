//! Incremental detection of new follows against a stored watermark.

use crate::error::ProviderError;
use crate::follows::{FollowedAccount, OrderedSource, PullEnd, UserId};

/// Entries pulled on a target's first cycle. They only seed the watermark.
pub const FIRST_RUN_CAP: usize = 5;

/// Upper bound on entries treated as new when the watermark is not found.
pub const SAFETY_CAP: usize = 200;

#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// New follows, oldest first.
    pub new_follows: Vec<FollowedAccount>,
    /// No watermark existed before this cycle.
    pub first_run: bool,
    /// Newest identifier pulled this cycle; `None` leaves the watermark as is.
    pub new_watermark: Option<UserId>,
    pub end: PullEnd,
}

impl DetectionResult {
    /// Whether alerts should go out for this result.
    pub fn should_alert(&self) -> bool {
        !self.first_run && !self.new_follows.is_empty()
    }

    /// The previous watermark was never reached, either because the stream
    /// ended or the safety cap kicked in.
    pub fn boundary_missing(&self) -> bool {
        !self.first_run && self.end != PullEnd::Boundary
    }
}

/// Pull `source` newest-first until `watermark` is reached and return
/// everything newer.
///
/// Provider errors abort the whole detection; nothing partial is returned.
pub async fn detect<S>(source: &mut S, watermark: Option<&UserId>) -> Result<DetectionResult, ProviderError>
where
    S: OrderedSource<FollowedAccount>,
{
    let first_run = watermark.is_none();
    let cap = if first_run { FIRST_RUN_CAP } else { SAFETY_CAP };

    let pulled = source
        .pull_until(|account: &FollowedAccount| Some(&account.id) == watermark, cap)
        .await?;

    let new_watermark = pulled.items.first().map(|account| account.id.clone());
    let mut new_follows = pulled.items;
    new_follows.reverse();

    Ok(DetectionResult {
        new_follows,
        first_run,
        new_watermark,
        end: pulled.end,
    })
}
