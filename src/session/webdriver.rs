//! [`WebSession`] over the W3C WebDriver HTTP protocol (chromedriver,
//! geckodriver, selenium). The browser profile keeps the platform login
//! between restarts.

use super::WebSession;
use crate::config::Config;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const ELEMENT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct DriverFailure {
    error: String,
    message: String,
}

impl DriverFailure {
    fn into_error(self, what: &str, timeout: Duration) -> SyncError {
        match self.error.as_str() {
            "timeout" | "script timeout" => SyncError::NavigationTimeout {
                what: what.to_string(),
                timeout,
            },
            "invalid session id" | "session not created" => {
                SyncError::Session(format!("browser session lost: {}", self.message))
            }
            _ => SyncError::Session(format!("{}: {}", self.error, self.message)),
        }
    }
}

pub struct WebDriverSession {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
    timeout: Duration,
}

impl WebDriverSession {
    pub async fn connect(config: &Config) -> Result<Self> {
        let timeout = config.navigation_timeout;
        let client = reqwest::Client::builder()
            .timeout(timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {}", e)))?;

        let mut args = vec!["--window-size=1400,1000".to_string()];
        if let Some(dir) = &config.browser_profile_dir {
            args.push(format!("--user-data-dir={}", dir));
        }
        if config.browser_headless {
            args.push("--headless=new".to_string());
        }
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                    "timeouts": {
                        "pageLoad": timeout.as_millis() as u64,
                        "script": timeout.as_millis() as u64,
                    }
                }
            }
        });

        let url = format!("{}/session", config.webdriver_url);
        let value = send(&client, Method::POST, &url, Some(capabilities), timeout)
            .await?
            .map_err(|f| f.into_error("new browser session", timeout))?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Session("WebDriver returned no session id".to_string()))?
            .to_string();

        info!("WebDriver: session {} opened at {}", session_id, config.webdriver_url);
        Ok(Self {
            client,
            endpoint: config.webdriver_url.clone(),
            session_id,
            timeout,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.command(Method::DELETE, "", None, "close session").await?;
        info!("WebDriver: session {} closed", self.session_id);
        Ok(())
    }

    async fn raw(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<std::result::Result<Value, DriverFailure>> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        send(&self.client, method, &url, body, self.timeout).await
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>, what: &str) -> Result<Value> {
        self.raw(method, path, body)
            .await?
            .map_err(|f| f.into_error(what, self.timeout))
    }

    async fn find_element(&self, selector: &str) -> Result<Option<String>> {
        let found = self
            .raw(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        match found {
            Ok(value) => Ok(value
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(str::to_string)),
            Err(f) if f.error == "no such element" => Ok(None),
            Err(f) => Err(f.into_error(selector, self.timeout)),
        }
    }
}

async fn send(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
    timeout: Duration,
) -> Result<std::result::Result<Value, DriverFailure>> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            SyncError::NavigationTimeout {
                what: url.to_string(),
                timeout,
            }
        } else {
            SyncError::Session(e.to_string())
        }
    })?;

    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| SyncError::Session(format!("invalid WebDriver response: {}", e)))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        Ok(Ok(value))
    } else {
        Ok(Err(DriverFailure {
            error: value["error"].as_str().unwrap_or("unknown error").to_string(),
            message: value["message"].as_str().unwrap_or_default().to_string(),
        }))
    }
}

#[async_trait]
impl WebSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })), url)
            .await?;
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.find_element(selector).await?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::NavigationTimeout {
                    what: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
            "script",
        )
        .await
    }

    async fn send_keys(&self, selector: &str, text: &str) -> Result<()> {
        let element = self
            .find_element(selector)
            .await?
            .ok_or_else(|| SyncError::extraction(selector, "element not present"))?;
        debug!("WebDriver: typing {} chars into {}", text.chars().count(), selector);
        self.command(
            Method::POST,
            &format!("/element/{}/value", element),
            Some(json!({ "text": text })),
            selector,
        )
        .await?;
        Ok(())
    }
}
