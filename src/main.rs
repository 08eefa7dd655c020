use chatdigest::config::Config;
use chatdigest::crawler::{Crawler, CrawlerOptions};
use chatdigest::db::Database;
use chatdigest::engine::{user_facing, Engine};
use chatdigest::llm::LlmClient;
use chatdigest::retention::RetentionJob;
use chatdigest::session::webdriver::WebDriverSession;
use chatdigest::session::SessionResource;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: chatdigest [digest <server_id> [channel_id] | post <server_id> <channel_id> <text>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let db = Database::new(&config)?;
    db.execute_init()?;

    let browser = Arc::new(WebDriverSession::connect(&config).await?);
    let session = SessionResource::new(Box::new(browser.clone()), &config);
    let crawler = Crawler::new(session, CrawlerOptions::from_config(&config));
    let llm = LlmClient::new(&config);
    let engine = Arc::new(Engine::new(&config, db, Arc::new(crawler), Arc::new(llm)));

    match args.first().map(String::as_str) {
        Some("digest") => {
            let Some(server_id) = args.get(1) else {
                anyhow::bail!(USAGE);
            };
            let digest = engine.channel_digest(server_id, args.get(2).map(String::as_str)).await;
            println!("{}", user_facing(digest));
        }
        Some("post") => {
            let (Some(server_id), Some(channel_id)) = (args.get(1), args.get(2)) else {
                anyhow::bail!(USAGE);
            };
            let text = args[3..].join(" ");
            if text.is_empty() {
                anyhow::bail!(USAGE);
            }
            let posted = engine.post_message(server_id, channel_id, &text).await;
            println!("{}", user_facing(posted.map(|_| "posted")));
        }
        Some(other) => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
        None => {
            if !config.retention_job_enabled {
                warn!("Retention job disabled (RETENTION_JOB_ENABLED=false); nothing to run");
            } else {
                if let Err(e) = engine.sync().authenticate().await {
                    error!("{}", e.user_message());
                }
                let job = tokio::spawn(RetentionJob::new(engine.clone(), &config).run());
                tokio::signal::ctrl_c().await?;
                info!("Shutting down");
                job.abort();
            }
        }
    }

    if let Err(e) = browser.close().await {
        warn!("Could not close browser session: {}", e);
    }
    Ok(())
}
