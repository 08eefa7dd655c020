use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    // Web session
    pub platform_base_url: String,
    pub webdriver_url: String,
    pub browser_profile_dir: Option<String>,
    pub browser_headless: bool,
    // Text generation
    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_timeout_secs: u64,

    // Retention & summarization windows
    pub retention_window: Duration,
    pub summary_window_capacity: usize,
    pub min_messages_to_summarize: usize,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub retention_job_enabled: bool,
    pub watched_servers: Vec<String>,

    // Crawler pacing & retry policy
    pub sync_max_attempts: u32,
    pub retry_pause: Duration,
    pub scroll_pause: Duration,
    pub auth_probe_timeout: Duration,
    pub navigation_timeout: Duration,
    pub max_scrape_messages: usize,
}

const WATCHED_SERVERS_FILE: &str = "watched_servers.toml";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/chatdigest.db".to_string()),
            platform_base_url: env::var("PLATFORM_BASE_URL")
                .unwrap_or_else(|_| "https://discord.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            webdriver_url: env::var("WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:4444".to_string())
                .trim_end_matches('/')
                .to_string(),
            browser_profile_dir: env::var("BROWSER_PROFILE_DIR").ok(),
            browser_headless: env::var("BROWSER_HEADLESS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            llm_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1".to_string()),
            llm_model: env::var("LLM_MODEL_ID").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_timeout_secs: env::var("LLM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),

            // Bounds every purge, so a typo here must not silently fall back.
            retention_window: match env::var("RETENTION_WINDOW") {
                Ok(raw) => humantime::parse_duration(&raw).map_err(|e| {
                    anyhow::anyhow!("RETENTION_WINDOW must be a duration like '3days': {}", e)
                })?,
                Err(_) => Duration::from_secs(3 * 24 * 60 * 60),
            },
            summary_window_capacity: env::var("SUMMARY_WINDOW_CAPACITY")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .unwrap_or(200),
            min_messages_to_summarize: env::var("MIN_MESSAGES_TO_SUMMARIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            poll_interval: duration_var("POLL_INTERVAL", Duration::from_secs(5 * 60)),
            stale_after: duration_var("STALE_AFTER", Duration::from_secs(60 * 60)),
            retention_job_enabled: env::var("RETENTION_JOB_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            watched_servers: Self::load_watched_servers()?,

            sync_max_attempts: env::var("SYNC_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            retry_pause: duration_var("RETRY_PAUSE", Duration::from_secs(1)),
            scroll_pause: duration_var("SCROLL_PAUSE", Duration::from_millis(1000)),
            auth_probe_timeout: duration_var("AUTH_PROBE_TIMEOUT", Duration::from_secs(10)),
            navigation_timeout: duration_var("NAVIGATION_TIMEOUT", Duration::from_secs(30)),
            max_scrape_messages: env::var("MAX_SCRAPE_MESSAGES")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5000),
        })
    }

    pub fn load_watched_servers() -> anyhow::Result<Vec<String>> {
        if let Ok(content) = fs::read_to_string(WATCHED_SERVERS_FILE) {
            #[derive(Deserialize)]
            struct WatchedWrapper {
                servers: Vec<String>,
            }
            if let Ok(wrapper) = toml::from_str::<WatchedWrapper>(&content) {
                return Ok(wrapper.servers);
            }
        }

        // Fallback to env variable
        if let Ok(env_servers) = env::var("WATCHED_SERVERS") {
            if let Ok(servers) = serde_json::from_str(&env_servers) {
                return Ok(servers);
            }
        }

        Ok(Vec::new())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention_window)
            .unwrap_or_else(|_| chrono::Duration::days(3))
    }

    pub fn is_watched(&self, server_id: &str) -> bool {
        self.watched_servers.is_empty() || self.watched_servers.iter().any(|s| s == server_id)
    }
}

fn duration_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|raw| humantime::parse_duration(&raw).ok())
        .unwrap_or(default)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("platform_base_url", &self.platform_base_url)
            .field("webdriver_url", &self.webdriver_url)
            .field("browser_profile_dir", &self.browser_profile_dir)
            .field("browser_headless", &self.browser_headless)
            .field("llm_url", &self.llm_url)
            .field("llm_model", &self.llm_model)
            .field(
                "llm_api_key",
                &self.llm_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field(
                "retention_window",
                &humantime::format_duration(self.retention_window).to_string(),
            )
            .field("summary_window_capacity", &self.summary_window_capacity)
            .field("min_messages_to_summarize", &self.min_messages_to_summarize)
            .field(
                "poll_interval",
                &humantime::format_duration(self.poll_interval).to_string(),
            )
            .field(
                "stale_after",
                &humantime::format_duration(self.stale_after).to_string(),
            )
            .field("retention_job_enabled", &self.retention_job_enabled)
            .field("watched_servers", &self.watched_servers)
            .field("sync_max_attempts", &self.sync_max_attempts)
            .field("retry_pause", &self.retry_pause)
            .field("scroll_pause", &self.scroll_pause)
            .field("auth_probe_timeout", &self.auth_probe_timeout)
            .field("navigation_timeout", &self.navigation_timeout)
            .field("max_scrape_messages", &self.max_scrape_messages)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: ":memory:".to_string(),
        platform_base_url: "https://chat.test".to_string(),
        webdriver_url: "http://localhost:4444".to_string(),
        browser_profile_dir: None,
        browser_headless: true,
        llm_url: "test".to_string(),
        llm_model: "test".to_string(),
        llm_api_key: None,
        llm_timeout_secs: 5,
        retention_window: Duration::from_secs(3 * 24 * 60 * 60),
        summary_window_capacity: 200,
        min_messages_to_summarize: 10,
        poll_interval: Duration::from_secs(300),
        stale_after: Duration::from_secs(3600),
        retention_job_enabled: false,
        watched_servers: Vec::new(),
        sync_max_attempts: 3,
        retry_pause: Duration::ZERO,
        scroll_pause: Duration::ZERO,
        auth_probe_timeout: Duration::from_millis(10),
        navigation_timeout: Duration::from_millis(10),
        max_scrape_messages: 5000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Test defaults
        env::remove_var("RETENTION_WINDOW");
        env::remove_var("POLL_INTERVAL");
        env::remove_var("LLM_API_KEY");
        let config = Config::build().unwrap();
        assert_eq!(config.retention_window, Duration::from_secs(259_200));
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.summary_window_capacity, 200);
        assert_eq!(config.sync_max_attempts, 3);

        // 2. Test humantime overrides
        env::set_var("RETENTION_WINDOW", "15days");
        env::set_var("POLL_INTERVAL", "90s");
        let config = Config::build().unwrap();
        assert_eq!(config.retention_window, Duration::from_secs(15 * 86_400));
        assert_eq!(config.poll_interval, Duration::from_secs(90));
        assert_eq!(config.retention(), chrono::Duration::days(15));

        // 3. A malformed retention window is rejected
        env::set_var("RETENTION_WINDOW", "three days");
        assert!(Config::build().is_err());

        // 4. Test debug redaction
        env::set_var("RETENTION_WINDOW", "3days");
        env::set_var("LLM_API_KEY", "secret_api_key");
        let debug_output = format!("{:?}", Config::build().unwrap());
        assert!(!debug_output.contains("secret_api_key"));
        assert!(debug_output.contains("[REDACTED]"));

        // Cleanup
        env::remove_var("RETENTION_WINDOW");
        env::remove_var("POLL_INTERVAL");
        env::remove_var("LLM_API_KEY");
    }

    #[test]
    fn test_watched_servers() {
        let mut config = test_config();
        assert!(config.is_watched("anything"));
        config.watched_servers = vec!["s1".to_string()];
        assert!(config.is_watched("s1"));
        assert!(!config.is_watched("s2"));
    }
}
