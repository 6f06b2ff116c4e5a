use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Which producer feeds the delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The append path publishes to subscribers as soon as the insert commits.
    Push,
    /// A background worker re-reads the message log tail on an interval.
    Poll,
}

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub delivery: DeliveryMode,
    pub poll_interval: Duration,
    pub typing_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path = match std::env::var("CLIENTELE_DB") {
            Ok(p) => PathBuf::from(p),
            Err(_) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home).join(".clientele").join("clientele.db")
            }
        };

        let bind_addr =
            std::env::var("CLIENTELE_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let delivery = match std::env::var("CLIENTELE_DELIVERY").as_deref() {
            Ok("poll") => DeliveryMode::Poll,
            Ok("push") | Err(_) => DeliveryMode::Push,
            Ok(other) => anyhow::bail!("CLIENTELE_DELIVERY must be 'push' or 'poll', got '{other}'"),
        };

        let poll_interval = duration_var("CLIENTELE_POLL_INTERVAL_MS", 2000)?;
        let typing_timeout = duration_var("CLIENTELE_TYPING_TIMEOUT_MS", 2000)?;

        Ok(Self {
            db_path,
            bind_addr,
            delivery,
            poll_interval,
            typing_timeout,
        })
    }
}

fn duration_var(name: &str, default_ms: u64) -> Result<Duration> {
    let ms = match std::env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .with_context(|| format!("{name} must be an integer millisecond count"))?,
        Err(_) => default_ms,
    };
    Ok(Duration::from_millis(ms))
}
