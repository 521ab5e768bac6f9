//! Optional web services the daemon talks to on the knob's behalf.
//!
//! Feeds are fetched on a timer and pushed to the device as
//! `<COMMAND>:<json>`; sinks receive what the device or the user produces.
//! The active set is rebuilt from the settings file on reload.

pub mod calendar;
pub mod jira;
pub mod notion;
pub mod weather;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use focusknob_common::{ConfigError, Settings};
use serde_json::Value;
use tracing::info;

pub const JIRA_PROJECTS: &str = "JIRA_PROJECTS";
pub const JIRA_HOURS: &str = "JIRA_HOURS";
pub const WEATHER: &str = "WEATHER";
pub const CALENDAR: &str = "CALENDAR";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{0}")]
    Auth(String),
    #[error("unexpected payload: {0}")]
    Payload(String),
    #[error("nothing to send: {0}")]
    NoData(&'static str),
    #[error("token cache: {0}")]
    Cache(#[from] std::io::Error),
}

/// Data source pushed to the device on a schedule.
#[async_trait]
pub trait Feed: Send + Sync {
    /// Device command prefix, e.g. `WEATHER`.
    fn command(&self) -> &'static str;
    /// Refresh period while connected; `None` means on connect only.
    fn period(&self) -> Option<Duration>;
    async fn fetch(&self) -> Result<Value, IntegrationError>;
}

/// Where time entries end up.
#[async_trait]
pub trait WorkLog: Send + Sync {
    async fn log_work(
        &self,
        issue_key: &str,
        seconds: u64,
        description: &str,
    ) -> Result<(), IntegrationError>;
    /// `KEY - summary` lines for the user's open issues.
    async fn issue_suggestions(&self, limit: usize) -> Result<Vec<String>, IntegrationError>;
}

/// Where the device's focus logs and notes end up.
#[async_trait]
pub trait EntrySink: Send + Sync {
    async fn add_log_entry(&self, entry: &Value) -> Result<(), IntegrationError>;
    async fn add_note(&self, note: &Value) -> Result<(), IntegrationError>;
}

/// The integrations enabled by one settings snapshot.
#[derive(Default, Clone)]
pub struct IntegrationSet {
    pub notion: Option<Arc<dyn EntrySink>>,
    pub jira: Option<Arc<dyn WorkLog>>,
    /// `<base>/browse/<KEY>` target for `JIRA_OPEN`.
    pub jira_browse_url: Option<String>,
    pub feeds: Vec<Arc<dyn Feed>>,
}

impl IntegrationSet {
    pub fn from_settings(settings: &Settings, cache_dir: PathBuf) -> Result<Self, IntegrationError> {
        let http = http_client()?;
        let mut set = IntegrationSet::default();

        if let Some(creds) = settings.notion() {
            set.notion = Some(Arc::new(notion::NotionClient::new(http.clone(), creds)));
        }
        if let Some(creds) = settings.jira() {
            set.jira_browse_url = Some(creds.base_url.clone());
            let client = Arc::new(jira::JiraClient::new(http.clone(), creds));
            set.feeds.push(Arc::new(jira::IssuesFeed::new(client.clone())));
            set.feeds.push(Arc::new(jira::HoursFeed::new(client.clone())));
            set.jira = Some(client);
        }
        if let Some(creds) = settings.weather() {
            set.feeds
                .push(Arc::new(weather::WeatherClient::new(http.clone(), creds)));
        }
        if let Some(creds) = settings.calendar() {
            set.feeds.push(Arc::new(calendar::CalendarClient::new(
                http, creds, cache_dir,
            )));
        }
        Ok(set)
    }

    pub fn feed(&self, command: &str) -> Option<Arc<dyn Feed>> {
        self.feeds.iter().find(|f| f.command() == command).cloned()
    }

    pub fn notion_enabled(&self) -> bool {
        self.notion.is_some()
    }

    pub fn jira_enabled(&self) -> bool {
        self.jira.is_some()
    }

    pub fn weather_enabled(&self) -> bool {
        self.feed(WEATHER).is_some()
    }

    pub fn calendar_enabled(&self) -> bool {
        self.feed(CALENDAR).is_some()
    }

    pub fn summary(&self) -> String {
        let parts: Vec<&str> = [
            (self.notion_enabled(), "Notion enabled"),
            (self.jira_enabled(), "Jira enabled"),
            (self.weather_enabled(), "Weather enabled"),
            (self.calendar_enabled(), "Calendar enabled"),
        ]
        .into_iter()
        .filter_map(|(on, label)| on.then_some(label))
        .collect();
        if parts.is_empty() {
            "No integrations configured".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error("no settings file configured")]
    NoSource,
}

/// Current integration set, swapped whole on reload.
pub struct IntegrationRegistry {
    config_path: Option<PathBuf>,
    cache_dir: PathBuf,
    active: RwLock<Arc<IntegrationSet>>,
}

impl IntegrationRegistry {
    pub fn new(config_path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            config_path: Some(config_path),
            cache_dir,
            active: RwLock::new(Arc::new(IntegrationSet::default())),
        }
    }

    /// A registry that always serves `set`.
    pub fn fixed(set: IntegrationSet) -> Self {
        Self {
            config_path: None,
            cache_dir: std::env::temp_dir(),
            active: RwLock::new(Arc::new(set)),
        }
    }

    pub fn current(&self) -> Arc<IntegrationSet> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, set: IntegrationSet) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(set);
    }

    /// Re-read the settings file and swap in the resulting set. The old set
    /// stays active when loading fails.
    pub fn reload(&self) -> Result<String, ReloadError> {
        let path = self.config_path.as_ref().ok_or(ReloadError::NoSource)?;
        let settings = Settings::load_with_env(path)?;
        let set = IntegrationSet::from_settings(&settings, self.cache_dir.clone())?;
        let summary = set.summary();
        self.replace(set);
        info!(config = %path.display(), "Integrations: {}", summary);
        Ok(summary)
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, IntegrationError> {
    Ok(reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("focusknobd/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Pass successful responses through, turn the rest into
/// [`IntegrationError::Status`] with a short body excerpt.
pub(crate) async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, IntegrationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IntegrationError::Status {
        service,
        status: status.as_u16(),
        body: truncate(&body, 200, 200),
    })
}

/// Cut `text` to fit a fixed device buffer: longer than `max` characters
/// becomes the first `keep` characters plus `...`.
pub(crate) fn truncate(text: &str, max: usize, keep: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
