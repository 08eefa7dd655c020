//! The single shared, logged-in web session.
//!
//! [`WebSession`] is the raw browser capability (navigate, wait, run a script).
//! [`SessionResource`] owns the one instance used for the whole process and
//! layers the re-authentication policy on top of it.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::retry::with_timeout;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub mod webdriver;

/// Element rendered only for a logged-in user (the online status badge).
pub const AUTH_MARKER: &str = r#"rect[mask="url(#svg-mask-status-online)"]"#;
pub const LOGIN_PATH: &str = "/login";

#[async_trait]
pub trait WebSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    /// Waits until `selector` matches an element, or fails with
    /// [`SyncError::NavigationTimeout`].
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Runs `script` in the page; `arguments[i]` inside the script is `args[i]`.
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    async fn send_keys(&self, selector: &str, text: &str) -> Result<()>;

    /// DOM settling pause between pagination steps.
    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[async_trait]
impl<T: WebSession + ?Sized> WebSession for std::sync::Arc<T> {
    async fn goto(&self, url: &str) -> Result<()> {
        (**self).goto(url).await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()> {
        (**self).wait_for(selector, timeout).await
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        (**self).evaluate(script, args).await
    }

    async fn send_keys(&self, selector: &str, text: &str) -> Result<()> {
        (**self).send_keys(selector, text).await
    }

    async fn pause(&self, duration: Duration) {
        (**self).pause(duration).await
    }
}

pub struct SessionResource {
    web: Box<dyn WebSession>,
    base_url: String,
    probe_timeout: Duration,
    navigation_timeout: Duration,
}

impl SessionResource {
    pub fn new(web: Box<dyn WebSession>, config: &Config) -> Self {
        Self {
            web,
            base_url: config.platform_base_url.clone(),
            probe_timeout: config.auth_probe_timeout,
            navigation_timeout: config.navigation_timeout,
        }
    }

    pub fn web(&self) -> &dyn WebSession {
        self.web.as_ref()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn navigate(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        debug!("Session: navigating to {}", url);
        with_timeout(&url, self.navigation_timeout, self.web.goto(&url)).await
    }

    /// Probes for the logged-in marker; on a miss, reloads the login page
    /// once and probes again. A second miss is an [`SyncError::Auth`].
    pub async fn ensure_authenticated(&self) -> Result<()> {
        if self.probe().await? {
            return Ok(());
        }
        warn!("Session: auth marker not found, reloading login page");
        self.navigate(LOGIN_PATH).await?;
        if self.probe().await? {
            return Ok(());
        }
        Err(SyncError::Auth(format!(
            "no logged-in marker after {:?}; log in through the browser profile",
            self.probe_timeout
        )))
    }

    async fn probe(&self) -> Result<bool> {
        match self.web.wait_for(AUTH_MARKER, self.probe_timeout).await {
            Ok(()) => Ok(true),
            Err(SyncError::NavigationTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
