//! Credentials for the optional integrations.
//!
//! The file is a flat key-value map. The desktop settings window writes
//! JSON; hand-written files may be TOML. Missing keys are unset, and so
//! are empty values or leftovers from the sample file (`YOUR_...`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const PLACEHOLDER_PREFIX: &str = "YOUR_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
    pub jira_base_url: Option<String>,
    pub jira_email: Option<String>,
    pub jira_api_token: Option<String>,
    pub openweathermap_api_key: Option<String>,
    pub weather_location: Option<String>,
    pub calendar_tenant_id: Option<String>,
    pub calendar_client_id: Option<String>,
    pub calendar_timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionCredentials {
    pub token: String,
    pub database_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraCredentials {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeatherCredentials {
    pub api_key: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub timezone: Option<String>,
}

impl Settings {
    /// Load `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(path, &raw)
    }

    /// Like [`Settings::load`] but falls back to the process environment
    /// for Notion and Jira credentials the file does not provide.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Self::load(path)?;
        settings.apply_env_fallbacks(|key| std::env::var(key).ok());
        Ok(settings)
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(raw).map_err(|e| e.to_string())
        } else {
            toml::from_str(raw).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Fill in a whole credential group from `env` when the file leaves
    /// that group incomplete. Groups are never mixed between sources.
    pub fn apply_env_fallbacks<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.notion().is_none() {
            let token = env("NOTION_TOKEN");
            let database_id = env("NOTION_DATABASE_ID");
            if usable(&token).is_some() && usable(&database_id).is_some() {
                self.notion_token = token;
                self.notion_database_id = database_id;
            }
        }
        if self.jira().is_none() {
            let base_url = env("JIRA_BASE_URL");
            let email = env("JIRA_EMAIL");
            let api_token = env("JIRA_API_TOKEN");
            if usable(&base_url).is_some() && usable(&email).is_some() && usable(&api_token).is_some()
            {
                self.jira_base_url = base_url;
                self.jira_email = email;
                self.jira_api_token = api_token;
            }
        }
    }

    pub fn notion(&self) -> Option<NotionCredentials> {
        Some(NotionCredentials {
            token: usable(&self.notion_token)?.to_string(),
            database_id: usable(&self.notion_database_id)?.to_string(),
        })
    }

    pub fn jira(&self) -> Option<JiraCredentials> {
        Some(JiraCredentials {
            base_url: usable(&self.jira_base_url)?.trim_end_matches('/').to_string(),
            email: usable(&self.jira_email)?.to_string(),
            api_token: usable(&self.jira_api_token)?.to_string(),
        })
    }

    pub fn weather(&self) -> Option<WeatherCredentials> {
        Some(WeatherCredentials {
            api_key: usable(&self.openweathermap_api_key)?.to_string(),
            location: usable(&self.weather_location)?.to_string(),
        })
    }

    pub fn calendar(&self) -> Option<CalendarCredentials> {
        Some(CalendarCredentials {
            tenant_id: usable(&self.calendar_tenant_id)?.to_string(),
            client_id: usable(&self.calendar_client_id)?.to_string(),
            timezone: usable(&self.calendar_timezone).map(str::to_string),
        })
    }
}

fn usable(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.starts_with(PLACEHOLDER_PREFIX))
}
