pub mod discord;

use crate::error::NotifierError;
use crate::follows::FollowedAccount;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

pub use discord::DiscordNotifier;

pub const ALERT_COLOR: u32 = 0x03b2f8;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// A structured, provider-agnostic alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub title: String,
    pub description: String,
    pub url: Option<String>,
    pub fields: Vec<AlertField>,
    pub thumbnail: Option<String>,
    pub color: u32,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Alert announcing that `target_label` started following `account`.
    pub fn new_follow(target_label: &str, account: &FollowedAccount) -> Self {
        let profile_url = account.profile_url();
        Self {
            title: format!("New Follow by {}", target_label),
            description: format!("**{}** (@{})", account.name, account.handle),
            url: Some(profile_url.clone()),
            fields: vec![
                AlertField {
                    name: "Bio".to_string(),
                    value: account.bio.clone().unwrap_or_else(|| "No bio".to_string()),
                    inline: false,
                },
                AlertField {
                    name: "Profile Link".to_string(),
                    value: profile_url,
                    inline: false,
                },
            ],
            thumbnail: account.avatar_url.clone(),
            color: ALERT_COLOR,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), NotifierError>;
}

/// Writes alerts to the log instead of delivering them. Used for `--dry-run`.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotifierError> {
        info!(
            title = %alert.title,
            link = alert.url.as_deref().unwrap_or(""),
            "[dry-run] {}",
            alert.description
        );
        Ok(())
    }
}
