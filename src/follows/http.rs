use super::{
    parse_page, parse_user, FollowClient, FollowedAccount, FollowingPage, SessionCookies, SessionProvider,
    UserId,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Talks to a JSON follow gateway over HTTP.
pub struct HttpFollowClient {
    base_url: String,
    page_size: usize,
    cookies: SessionCookies,
    client: reqwest::Client,
}

impl HttpFollowClient {
    pub fn new(
        base_url: &str,
        page_size: usize,
        timeout: Duration,
        cookies: SessionCookies,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("followwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
            cookies,
            client,
        })
    }

    fn following_url(&self, target: &UserId, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/users/{}/following?count={}",
            self.base_url,
            urlencoding::encode(target.as_str()),
            self.page_size
        );
        if let Some(cursor) = cursor {
            url.push_str("&cursor=");
            url.push_str(&urlencoding::encode(cursor));
        }
        url
    }

    async fn get(&self, url: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(url)
            .header(
                "Cookie",
                format!("auth_token={}; ct0={}", self.cookies.auth_token, self.cookies.ct0),
            )
            .header("x-csrf-token", &self.cookies.ct0)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }
        Ok(response.text().await?)
    }
}

/// Map a non-2xx gateway response onto the provider error taxonomy.
fn status_error(status: StatusCode) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("gateway returned {}", status))
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        s => ProviderError::Status(s.as_u16()),
    }
}

#[async_trait]
impl FollowClient for HttpFollowClient {
    async fn following_page(
        &self,
        target: &UserId,
        cursor: Option<&str>,
    ) -> Result<FollowingPage, ProviderError> {
        let body = self.get(&self.following_url(target, cursor)).await?;
        parse_page(&body)
    }

    async fn lookup_user(&self, id: &UserId) -> Result<FollowedAccount, ProviderError> {
        let url = format!("{}/users/{}", self.base_url, urlencoding::encode(id.as_str()));
        let body = self.get(&url).await?;
        parse_user(&body)
    }
}

/// Builds a new [`HttpFollowClient`] per session so rotated cookies in the
/// environment are picked up without a restart.
pub struct HttpSessionProvider {
    base_url: String,
    page_size: usize,
    timeout: Duration,
}

impl HttpSessionProvider {
    pub fn new(base_url: String, page_size: usize, timeout: Duration) -> Self {
        Self {
            base_url,
            page_size,
            timeout,
        }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn client(&self) -> Result<Arc<dyn FollowClient>, ProviderError> {
        let cookies = SessionCookies::from_env()?;
        let client = HttpFollowClient::new(&self.base_url, self.page_size, self.timeout, cookies)?;
        Ok(Arc::new(client))
    }
}
