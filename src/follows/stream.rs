//! Turns a provider's paginated "following" endpoint into a single
//! newest-first [`OrderedSource`] the detector can pull from.

use super::{FollowClient, FollowedAccount, OrderedSource, SessionProvider, UserId};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Consecutive empty pages tolerated before a stream is considered finished.
const MAX_EMPTY_PAGES: usize = 3;

/// Entry point to the provider: hands out sessions for one target unit.
#[derive(Clone)]
pub struct FollowStreamAdapter {
    provider: Arc<dyn SessionProvider>,
}

impl FollowStreamAdapter {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self { provider }
    }

    pub async fn session(&self) -> Result<FollowSession, ProviderError> {
        let client = self.provider.client().await?;
        Ok(FollowSession { client })
    }
}

/// A single authenticated client, used for one target's cycle.
pub struct FollowSession {
    client: Arc<dyn FollowClient>,
}

impl FollowSession {
    /// A fresh stream starting at the newest entry.
    pub fn stream(&self, target: &UserId) -> FollowStream {
        FollowStream::new(Arc::clone(&self.client), target.clone())
    }

    /// Display name for alert headers. Falls back to the raw id.
    pub async fn resolve_target(&self, target: &UserId) -> String {
        match self.client.lookup_user(target).await {
            Ok(user) if !user.name.is_empty() => user.name,
            Ok(_) => format!("ID: {}", target),
            Err(e) => {
                warn!(target_id = %target, phase = "resolve", "could not resolve target name: {}", e);
                format!("ID: {}", target)
            }
        }
    }
}

pub struct FollowStream {
    client: Arc<dyn FollowClient>,
    target: UserId,
    buffer: VecDeque<FollowedAccount>,
    cursor: Option<String>,
    seen_cursors: HashSet<String>,
    empty_pages: usize,
    pages: usize,
    done: bool,
}

impl FollowStream {
    pub fn new(client: Arc<dyn FollowClient>, target: UserId) -> Self {
        Self {
            client,
            target,
            buffer: VecDeque::new(),
            cursor: None,
            seen_cursors: HashSet::new(),
            empty_pages: 0,
            pages: 0,
            done: false,
        }
    }

    /// Number of pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    async fn fetch_page(&mut self) -> Result<(), ProviderError> {
        let page = self
            .client
            .following_page(&self.target, self.cursor.as_deref())
            .await?;
        self.pages += 1;

        if page.users.is_empty() {
            self.empty_pages += 1;
        } else {
            self.empty_pages = 0;
        }
        debug!(
            target_id = %self.target,
            page = self.pages,
            users = page.users.len(),
            "fetched following page"
        );
        self.buffer.extend(page.users);

        match page.next_cursor {
            Some(cursor) if self.empty_pages < MAX_EMPTY_PAGES => {
                if self.seen_cursors.insert(cursor.clone()) {
                    self.cursor = Some(cursor);
                } else {
                    debug!(target_id = %self.target, "provider repeated a cursor, ending stream");
                    self.done = true;
                }
            }
            _ => self.done = true,
        }
        Ok(())
    }
}

#[async_trait]
impl OrderedSource<FollowedAccount> for FollowStream {
    async fn next(&mut self) -> Result<Option<FollowedAccount>, ProviderError> {
        loop {
            if let Some(account) = self.buffer.pop_front() {
                return Ok(Some(account));
            }
            if self.done {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider used by the stream, detector and monitor tests.

    use super::*;
    use crate::follows::FollowingPage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub fn account(id: &str) -> FollowedAccount {
        FollowedAccount {
            id: UserId::new(id),
            name: format!("User {}", id),
            handle: id.to_string(),
            bio: None,
            avatar_url: None,
        }
    }

    #[derive(Default)]
    pub struct ScriptedClient {
        /// Following list per target, newest first.
        pub following: Mutex<HashMap<UserId, Vec<FollowedAccount>>>,
        pub failing: Mutex<HashSet<UserId>>,
        pub names: HashMap<UserId, String>,
        pub page_size: usize,
        pub page_calls: Mutex<usize>,
    }

    impl ScriptedClient {
        pub fn new(page_size: usize) -> Self {
            Self {
                page_size,
                ..Default::default()
            }
        }

        pub fn set_following(&self, target: &str, ids: &[&str]) {
            self.following
                .lock()
                .unwrap()
                .insert(UserId::new(target), ids.iter().map(|id| account(id)).collect());
        }

        pub fn fail(&self, target: &str) {
            self.failing.lock().unwrap().insert(UserId::new(target));
        }
    }

    #[async_trait]
    impl FollowClient for ScriptedClient {
        async fn following_page(
            &self,
            target: &UserId,
            cursor: Option<&str>,
        ) -> Result<FollowingPage, ProviderError> {
            *self.page_calls.lock().unwrap() += 1;
            if self.failing.lock().unwrap().contains(target) {
                return Err(ProviderError::RateLimited);
            }
            let all = self
                .following
                .lock()
                .unwrap()
                .get(target)
                .cloned()
                .unwrap_or_default();
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + self.page_size).min(all.len());
            Ok(FollowingPage {
                users: all[start.min(end)..end].to_vec(),
                next_cursor: (end < all.len()).then(|| end.to_string()),
            })
        }

        async fn lookup_user(&self, id: &UserId) -> Result<FollowedAccount, ProviderError> {
            match self.names.get(id) {
                Some(name) => Ok(FollowedAccount {
                    name: name.clone(),
                    ..account(id.as_str())
                }),
                None => Err(ProviderError::Status(404)),
            }
        }
    }

    pub struct FixedProvider(pub Arc<ScriptedClient>);

    #[async_trait]
    impl SessionProvider for FixedProvider {
        async fn client(&self) -> Result<Arc<dyn FollowClient>, ProviderError> {
            Ok(self.0.clone())
        }
    }
}
