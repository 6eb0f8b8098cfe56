use super::{Alert, Notifier};
use crate::error::NotifierError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    embeds: [Embed<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Embed<'a> {
    title: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    color: u32,
    fields: Vec<EmbedField<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<EmbedImage<'a>>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct EmbedField<'a> {
    name: &'a str,
    value: &'a str,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct EmbedImage<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

// Discord rejects field values above this length.
const MAX_FIELD_LEN: usize = 1024;

fn truncate(value: &str) -> &str {
    match value.char_indices().nth(MAX_FIELD_LEN) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

impl<'a> From<&'a Alert> for WebhookPayload<'a> {
    fn from(alert: &'a Alert) -> Self {
        WebhookPayload {
            embeds: [Embed {
                title: &alert.title,
                description: &alert.description,
                url: alert.url.as_deref(),
                color: alert.color,
                fields: alert
                    .fields
                    .iter()
                    .map(|f| EmbedField {
                        name: &f.name,
                        value: truncate(&f.value),
                        inline: f.inline,
                    })
                    .collect(),
                thumbnail: alert.thumbnail.as_deref().map(|url| EmbedImage { url }),
                timestamp: alert.timestamp.to_rfc3339(),
            }],
        }
    }
}

/// Delivers alerts as embeds to a Discord webhook.
pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            webhook_url,
            client,
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotifierError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&WebhookPayload::from(alert))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(rejection(status, &body))
    }
}

/// Map a non-2xx webhook response to an error. Discord explains 429s with a
/// JSON body carrying `retry_after` in seconds.
fn rejection(status: StatusCode, body: &str) -> NotifierError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = serde_json::from_str::<RateLimitBody>(body)
            .ok()
            .and_then(|body| body.retry_after);
        return NotifierError::RateLimited { retry_after };
    }
    NotifierError::Status(status.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follows::{FollowedAccount, UserId};

    fn alert(bio: Option<String>) -> Alert {
        Alert::new_follow(
            "Target",
            &FollowedAccount {
                id: UserId::new("1"),
                name: "Alice".to_string(),
                handle: "alice".to_string(),
                bio,
                avatar_url: Some("https://img.example/a.png".to_string()),
            },
        )
    }

    #[test]
    fn test_payload_shape() {
        let alert = alert(Some("hello".to_string()));
        let json = serde_json::to_value(WebhookPayload::from(&alert)).unwrap();
        let embed = &json["embeds"][0];
        assert_eq!(embed["title"], "New Follow by Target");
        assert_eq!(embed["color"], 0x03b2f8);
        assert_eq!(embed["fields"][0]["name"], "Bio");
        assert_eq!(embed["fields"][0]["value"], "hello");
        assert_eq!(embed["fields"][1]["value"], "https://x.com/alice");
        assert_eq!(embed["thumbnail"]["url"], "https://img.example/a.png");
        assert!(embed["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_long_bio_is_truncated() {
        let alert = alert(Some("x".repeat(MAX_FIELD_LEN + 10)));
        let json = serde_json::to_value(WebhookPayload::from(&alert)).unwrap();
        assert_eq!(
            json["embeds"][0]["fields"][0]["value"].as_str().unwrap().len(),
            MAX_FIELD_LEN
        );
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let body = r#"{"message": "You are being rate limited.", "retry_after": 0.64, "global": false}"#;
        match rejection(StatusCode::TOO_MANY_REQUESTS, body) {
            NotifierError::RateLimited { retry_after } => assert_eq!(retry_after, Some(0.64)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_without_usable_body() {
        for body in ["", "<html>slow down</html>", r#"{"message": "slow"}"#] {
            assert!(matches!(
                rejection(StatusCode::TOO_MANY_REQUESTS, body),
                NotifierError::RateLimited { retry_after: None }
            ));
        }
    }

    #[test]
    fn test_other_statuses_are_reported() {
        assert!(matches!(
            rejection(StatusCode::NOT_FOUND, r#"{"message": "Unknown Webhook"}"#),
            NotifierError::Status(404)
        ));
        assert!(matches!(
            rejection(StatusCode::INTERNAL_SERVER_ERROR, ""),
            NotifierError::Status(500)
        ));
    }
}
