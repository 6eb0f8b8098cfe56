//! Follow data from an external CLI client such as Bird.
//!
//! The client is expected to print the JSON page / user shapes understood by
//! [`parse_page`] and [`parse_user`] when given `--json`.

use super::{
    parse_page, parse_user, FollowClient, FollowedAccount, FollowingPage, SessionCookies, SessionProvider,
    UserId,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_PROGRAM: &str = "bird";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CommandFollowClient {
    program: String,
    args_prefix: Vec<String>,
    timeout: Duration,
}

impl CommandFollowClient {
    pub fn new(program: String, args_prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args_prefix,
            timeout,
        }
    }

    fn following_args(&self, target: &UserId, cursor: Option<&str>) -> Vec<String> {
        let mut args = self.args_prefix.clone();
        args.extend(["following".to_string(), target.to_string(), "--json".to_string()]);
        if let Some(cursor) = cursor {
            args.extend(["--cursor".to_string(), cursor.to_string()]);
        }
        args
    }

    fn user_args(&self, id: &UserId) -> Vec<String> {
        let mut args = self.args_prefix.clone();
        args.extend(["user".to_string(), id.to_string(), "--json".to_string()]);
        args
    }

    async fn execute(&self, args: &[String]) -> Result<String, ProviderError> {
        let run = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                ProviderError::Network(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs_f64()
                ))
            })?
            .map_err(|e| ProviderError::Unavailable(format!("{}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

/// Map a failed invocation's stderr onto the provider error taxonomy.
fn classify_failure(stderr: &str) -> ProviderError {
    let lower = stderr.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        ProviderError::RateLimited
    } else if lower.contains("unauthorized")
        || lower.contains("authenticat")
        || lower.contains("401")
        || lower.contains("403")
    {
        ProviderError::Auth(stderr.trim().to_string())
    } else {
        ProviderError::Network(stderr.trim().to_string())
    }
}

#[async_trait]
impl FollowClient for CommandFollowClient {
    async fn following_page(
        &self,
        target: &UserId,
        cursor: Option<&str>,
    ) -> Result<FollowingPage, ProviderError> {
        let stdout = self.execute(&self.following_args(target, cursor)).await?;
        parse_page(&stdout)
    }

    async fn lookup_user(&self, id: &UserId) -> Result<FollowedAccount, ProviderError> {
        let stdout = self.execute(&self.user_args(id)).await?;
        parse_user(&stdout)
    }
}

pub struct CommandSessionProvider {
    program: String,
    args_prefix: Vec<String>,
    timeout: Duration,
}

impl CommandSessionProvider {
    pub fn new(program: String, args_prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args_prefix,
            timeout,
        }
    }
}

#[async_trait]
impl SessionProvider for CommandSessionProvider {
    async fn client(&self) -> Result<Arc<dyn FollowClient>, ProviderError> {
        let installed = Command::new("which")
            .arg(&self.program)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);

        if !installed {
            return Err(ProviderError::Unavailable(format!(
                "{} not found on PATH",
                self.program
            )));
        }

        // The client reads the cookies itself; only their presence is checked here.
        SessionCookies::from_env()?;

        Ok(Arc::new(CommandFollowClient::new(
            self.program.clone(),
            self.args_prefix.clone(),
            self.timeout,
        )))
    }
}
