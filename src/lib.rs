//! Watches a fixed set of accounts and announces every account they start
//! following.
//!
//! Each pass pulls a target's following list newest-first until the stored
//! watermark is reached ([`detector`]), posts one alert per new follow
//! ([`dispatch`]), then advances the watermark ([`store`]). [`monitor`] drives
//! the passes.

pub mod config;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod follows;
pub mod monitor;
pub mod notifier;
pub mod store;

pub use config::Config;
pub use detector::{detect, DetectionResult};
pub use error::{ConfigError, CycleError, NotifierError, ProviderError, StoreError};
pub use follows::{FollowedAccount, UserId};
pub use monitor::{Monitor, Pacing, PassReport};
