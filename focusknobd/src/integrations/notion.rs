use async_trait::async_trait;
use chrono::Local;
use focusknob_common::settings::NotionCredentials;
use serde_json::{json, Value};
use tracing::info;

use super::{check_status, EntrySink, IntegrationError};

const SERVICE: &str = "Notion";
const API_URL: &str = "https://api.notion.com/v1/pages";
const API_VERSION: &str = "2022-06-28";

pub struct NotionClient {
    http: reqwest::Client,
    creds: NotionCredentials,
}

impl NotionClient {
    pub fn new(http: reqwest::Client, creds: NotionCredentials) -> Self {
        Self { http, creds }
    }

    async fn create_page(&self, properties: Value) -> Result<(), IntegrationError> {
        let payload = json!({
            "parent": {"database_id": self.creds.database_id},
            "properties": properties,
        });
        let response = self
            .http
            .post(API_URL)
            .bearer_auth(&self.creds.token)
            .header("Notion-Version", API_VERSION)
            .json(&payload)
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        Ok(())
    }
}

#[async_trait]
impl EntrySink for NotionClient {
    async fn add_log_entry(&self, entry: &Value) -> Result<(), IntegrationError> {
        self.create_page(log_properties(entry, &Local::now().date_naive().to_string()))
            .await?;
        info!("Added log entry to Notion: {}", entry["date"]);
        Ok(())
    }

    async fn add_note(&self, note: &Value) -> Result<(), IntegrationError> {
        self.create_page(note_properties(note, &Local::now().naive_local().to_string()))
            .await?;
        info!("Added note to Notion");
        Ok(())
    }
}

fn log_properties(entry: &Value, today: &str) -> Value {
    let number = |key: &str| entry[key].as_i64().unwrap_or(0);
    json!({
        "Date": {"date": {"start": entry["date"].as_str().unwrap_or(today)}},
        "Work Minutes": {"number": number("total_work_minutes")},
        "Break Minutes": {"number": number("total_break_minutes")},
        "Pomodoros": {"number": number("pomodoros")},
    })
}

fn note_properties(note: &Value, now: &str) -> Value {
    let text = note["text"].as_str().unwrap_or_default();
    let title: String = text.chars().take(100).collect();
    json!({
        "Title": {"title": [{"text": {"content": title}}]},
        "Content": {"rich_text": [{"text": {"content": text}}]},
        "Timestamp": {"date": {"start": note["timestamp"].as_str().unwrap_or(now)}},
    })
}
