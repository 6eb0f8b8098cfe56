pub mod command;
pub mod http;
pub mod stream;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

pub use stream::{FollowSession, FollowStream, FollowStreamAdapter};

/// Opaque account identifier. Providers hand these out as numbers or strings;
/// both are normalised to their decimal/string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Num(u64),
            Str(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Num(n) => UserId(n.to_string()),
            RawId::Str(s) => UserId(s.trim().to_string()),
        })
    }
}

/// An account followed by a target, as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowedAccount {
    pub id: UserId,
    pub name: String,
    pub handle: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

impl FollowedAccount {
    pub fn profile_url(&self) -> String {
        format!("https://x.com/{}", urlencoding::encode(&self.handle))
    }
}

/// One page of a target's following list, newest first.
#[derive(Debug, Clone, Default)]
pub struct FollowingPage {
    pub users: Vec<FollowedAccount>,
    pub next_cursor: Option<String>,
}

/// Session cookies both providers authenticate with.
#[derive(Debug, Clone)]
pub struct SessionCookies {
    pub auth_token: String,
    pub ct0: String,
}

impl SessionCookies {
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_vars(std::env::var("AUTH_TOKEN").ok(), std::env::var("CT0").ok())
    }

    fn from_vars(auth_token: Option<String>, ct0: Option<String>) -> Result<Self, ProviderError> {
        match (auth_token, ct0) {
            (Some(auth_token), Some(ct0)) if !auth_token.is_empty() && !ct0.is_empty() => {
                Ok(Self { auth_token, ct0 })
            }
            _ => Err(ProviderError::Auth(
                "missing AUTH_TOKEN or CT0 environment variables".to_string(),
            )),
        }
    }
}

/// An authenticated client handed out by a [`SessionProvider`].
#[async_trait]
pub trait FollowClient: Send + Sync {
    /// Fetch one page of accounts `target` follows, newest first.
    async fn following_page(
        &self,
        target: &UserId,
        cursor: Option<&str>,
    ) -> Result<FollowingPage, ProviderError>;

    async fn lookup_user(&self, id: &UserId) -> Result<FollowedAccount, ProviderError>;
}

/// Yields authenticated clients. Implementations may rotate sessions between
/// calls; the monitor asks for a fresh client for every target.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn client(&self) -> Result<Arc<dyn FollowClient>, ProviderError>;
}

/// How a [`OrderedSource::pull_until`] call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullEnd {
    /// An item matched the boundary predicate. It is not included.
    Boundary,
    /// The cap was reached before a boundary or the end of the source.
    Cap,
    /// The source ran out.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Pulled<T> {
    pub items: Vec<T>,
    pub end: PullEnd,
}

/// A lazily pulled, newest-first log of items.
#[async_trait]
pub trait OrderedSource<T: Send + 'static>: Send {
    async fn next(&mut self) -> Result<Option<T>, ProviderError>;

    /// Pull items in source order until one satisfies `is_boundary`, `cap`
    /// items have been collected, or the source ends.
    async fn pull_until<P>(&mut self, mut is_boundary: P, cap: usize) -> Result<Pulled<T>, ProviderError>
    where
        P: FnMut(&T) -> bool + Send,
    {
        let mut items = Vec::new();
        loop {
            if items.len() >= cap {
                return Ok(Pulled {
                    items,
                    end: PullEnd::Cap,
                });
            }
            match self.next().await? {
                None => {
                    return Ok(Pulled {
                        items,
                        end: PullEnd::Exhausted,
                    })
                }
                Some(item) if is_boundary(&item) => {
                    return Ok(Pulled {
                        items,
                        end: PullEnd::Boundary,
                    })
                }
                Some(item) => items.push(item),
            }
        }
    }
}

// Wire format shared by the HTTP and command providers.

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    users: Vec<ApiUser>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: UserId,
    #[serde(default)]
    name: Option<String>,
    #[serde(alias = "screen_name")]
    username: String,
    #[serde(default, alias = "bio")]
    description: Option<String>,
    #[serde(default, alias = "profile_image_url_https")]
    profile_image_url: Option<String>,
}

impl From<ApiUser> for FollowedAccount {
    fn from(u: ApiUser) -> Self {
        let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let handle = u.username.trim().trim_start_matches('@').to_string();
        FollowedAccount {
            id: u.id,
            name: non_empty(u.name).unwrap_or_else(|| handle.clone()),
            handle,
            bio: non_empty(u.description),
            avatar_url: non_empty(u.profile_image_url),
        }
    }
}

pub(crate) fn parse_page(body: &str) -> Result<FollowingPage, ProviderError> {
    let page: ApiPage = serde_json::from_str(body)?;
    Ok(FollowingPage {
        users: page.users.into_iter().map(FollowedAccount::from).collect(),
        next_cursor: page.next_cursor.filter(|c| !c.is_empty()),
    })
}

pub(crate) fn parse_user(body: &str) -> Result<FollowedAccount, ProviderError> {
    let user: ApiUser = serde_json::from_str(body)?;
    Ok(user.into())
}
