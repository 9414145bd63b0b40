use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::FixedOffset;

use crate::timestamp::{ClockStyle, DisplayClock};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(4000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_base_url: String,
    /// Used when the primary backend does not answer `/ping`.
    pub mock_api_url: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub clock: DisplayClock,
    pub store_path: PathBuf,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            mock_api_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            clock: DisplayClock::local(ClockStyle::TwelveHour),
            store_path: PathBuf::from("castline-session.json"),
        }
    }
}

impl ChatConfig {
    /// Reads `CASTLINE_*` variables from the process environment. Call
    /// `dotenvy::dotenv()` first if a `.env` file should be honoured.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let poll_interval = match get("CASTLINE_POLL_INTERVAL_MS") {
            Some(raw) => millis("CASTLINE_POLL_INTERVAL_MS", &raw)?,
            None => defaults.poll_interval,
        };
        let request_timeout = match get("CASTLINE_REQUEST_TIMEOUT_MS") {
            Some(raw) => millis("CASTLINE_REQUEST_TIMEOUT_MS", &raw)?,
            None => defaults.request_timeout,
        };

        let style = match get("CASTLINE_CLOCK").as_deref() {
            None | Some("12h") => ClockStyle::TwelveHour,
            Some("24h") => ClockStyle::TwentyFourHour,
            Some(other) => bail!("CASTLINE_CLOCK must be 12h or 24h, got '{}'", other),
        };
        let clock = match get("CASTLINE_UTC_OFFSET_MINUTES") {
            Some(raw) => {
                let minutes: i32 = raw
                    .parse()
                    .with_context(|| format!("CASTLINE_UTC_OFFSET_MINUTES is not a number: '{}'", raw))?;
                let offset = minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .with_context(|| format!("CASTLINE_UTC_OFFSET_MINUTES out of range: {}", minutes))?;
                DisplayClock::new(offset, style)
            }
            None => DisplayClock::local(style),
        };

        Ok(Self {
            api_base_url: get("CASTLINE_API_BASE_URL").unwrap_or(defaults.api_base_url),
            mock_api_url: get("CASTLINE_MOCK_API_URL"),
            poll_interval,
            request_timeout,
            clock,
            store_path: get("CASTLINE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
        })
    }
}

fn millis(key: &str, raw: &str) -> Result<Duration> {
    let ms: u64 = raw
        .parse()
        .with_context(|| format!("{} is not a number of milliseconds: '{}'", key, raw))?;
    if ms == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_millis(ms))
}
