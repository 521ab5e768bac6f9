//! Jira Cloud REST v3: assigned issues, today's logged time, worklogs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, Weekday};
use focusknob_common::settings::JiraCredentials;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{check_status, truncate, Feed, IntegrationError, WorkLog, JIRA_HOURS, JIRA_PROJECTS};

const SERVICE: &str = "Jira";
const WORKDAY_TARGET_MIN: u64 = 480;
const HOURS_PERIOD: Duration = Duration::from_secs(300);

/// One assigned issue, trimmed to the device's fixed-size fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueSummary {
    pub key: String,
    pub name: String,
    pub proj: String,
    pub status: String,
    pub desc: String,
}

pub struct JiraClient {
    http: reqwest::Client,
    creds: JiraCredentials,
    account_id: OnceCell<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    issues: Vec<SearchIssue>,
}

#[derive(Deserialize)]
struct SearchIssue {
    key: String,
    #[serde(default)]
    fields: Value,
}

#[derive(Deserialize)]
struct Worklog {
    #[serde(default)]
    author: Value,
    #[serde(default)]
    started: String,
    #[serde(default, rename = "timeSpentSeconds")]
    time_spent_seconds: u64,
}

impl JiraClient {
    pub fn new(http: reqwest::Client, creds: JiraCredentials) -> Self {
        Self {
            http,
            creds,
            account_id: OnceCell::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}/rest/api/3/{}", self.creds.base_url, path))
            .basic_auth(&self.creds.email, Some(&self.creds.api_token))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn account_id(&self) -> Result<&str, IntegrationError> {
        let id = self
            .account_id
            .get_or_try_init(|| async {
                let me: Value = check_status(SERVICE, self.get("myself").send().await?)
                    .await?
                    .json()
                    .await?;
                me.get("accountId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| IntegrationError::Payload("myself has no accountId".into()))
            })
            .await?;
        Ok(id.as_str())
    }

    async fn search(&self, jql: &str, max: u32, fields: &str) -> Result<Vec<SearchIssue>, IntegrationError> {
        let max = max.to_string();
        let response = self
            .get("search/jql")
            .query(&[("jql", jql), ("maxResults", max.as_str()), ("fields", fields)])
            .send()
            .await?;
        let body: SearchResponse = check_status(SERVICE, response).await?.json().await?;
        Ok(body.issues)
    }

    /// Open and in-progress issues assigned to the current user.
    pub async fn my_issues(&self) -> Result<Vec<IssueSummary>, IntegrationError> {
        let jql = "assignee = currentUser() \
                   AND statusCategory in (\"To Do\", \"In Progress\") \
                   ORDER BY updated DESC";
        let issues = self
            .search(jql, 20, "summary,project,status,description")
            .await?;
        let summaries: Vec<IssueSummary> = issues.iter().map(summarize_issue).collect();
        info!("Fetched {} Jira issues for current user", summaries.len());
        Ok(summaries)
    }

    /// Minutes the current user logged on `day`, and the day's target.
    pub async fn logged_on(&self, day: NaiveDate) -> Result<Value, IntegrationError> {
        let account_id = self.account_id().await?.to_string();
        let day_str = day.format("%Y-%m-%d").to_string();
        let jql = format!("worklogDate = \"{day_str}\" AND worklogAuthor = currentUser()");
        let issues = self.search(&jql, 50, "worklog").await?;

        let mut total_seconds = 0;
        for issue in issues {
            let inline = &issue.fields["worklog"];
            let total = inline["total"].as_u64().unwrap_or(0);
            let max = inline["maxResults"].as_u64().unwrap_or(20);
            let mut worklogs: Vec<Worklog> =
                serde_json::from_value(inline["worklogs"].clone()).unwrap_or_default();
            if total > max {
                match self.all_worklogs(&issue.key).await {
                    Ok(all) => worklogs = all,
                    Err(e) => warn!("Failed to fetch full worklogs for {}: {}", issue.key, e),
                }
            }
            total_seconds += worklogs
                .iter()
                .filter(|wl| wl.author["accountId"].as_str() == Some(account_id.as_str()))
                .filter(|wl| wl.started.get(..10) == Some(day_str.as_str()))
                .map(|wl| wl.time_spent_seconds)
                .sum::<u64>();
        }

        let logged_min = total_seconds / 60;
        let target_min = if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            0
        } else {
            WORKDAY_TARGET_MIN
        };
        info!("Today's Jira worklogs: {logged_min} min logged, target {target_min} min");
        Ok(json!({"logged_min": logged_min, "target_min": target_min}))
    }

    async fn all_worklogs(&self, key: &str) -> Result<Vec<Worklog>, IntegrationError> {
        let response = self.get(&format!("issue/{key}/worklog")).send().await?;
        let body: Value = check_status(SERVICE, response).await?.json().await?;
        Ok(serde_json::from_value(body["worklogs"].clone()).unwrap_or_default())
    }
}

#[async_trait]
impl WorkLog for JiraClient {
    async fn log_work(
        &self,
        issue_key: &str,
        seconds: u64,
        description: &str,
    ) -> Result<(), IntegrationError> {
        let payload = json!({
            "timeSpentSeconds": seconds,
            "comment": {
                "type": "doc",
                "version": 1,
                "content": [{
                    "type": "paragraph",
                    "content": [{"type": "text", "text": description}],
                }],
            },
        });
        let response = self
            .http
            .post(format!(
                "{}/rest/api/3/issue/{}/worklog",
                self.creds.base_url, issue_key
            ))
            .basic_auth(&self.creds.email, Some(&self.creds.api_token))
            .json(&payload)
            .send()
            .await?;
        check_status(SERVICE, response).await?;
        info!("Logged {}s to {}", seconds, issue_key);
        Ok(())
    }

    async fn issue_suggestions(&self, limit: usize) -> Result<Vec<String>, IntegrationError> {
        Ok(self
            .my_issues()
            .await?
            .into_iter()
            .take(limit)
            .map(|issue| format!("{} - {}", issue.key, issue.name))
            .collect())
    }
}

/// `JIRA_PROJECTS`: assigned issues, sent once per connection.
pub struct IssuesFeed {
    client: Arc<JiraClient>,
}

impl IssuesFeed {
    pub fn new(client: Arc<JiraClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Feed for IssuesFeed {
    fn command(&self) -> &'static str {
        JIRA_PROJECTS
    }

    fn period(&self) -> Option<Duration> {
        None
    }

    async fn fetch(&self) -> Result<Value, IntegrationError> {
        let issues = self.client.my_issues().await?;
        if issues.is_empty() {
            return Err(IntegrationError::NoData("no Jira issues assigned"));
        }
        serde_json::to_value(issues).map_err(|e| IntegrationError::Payload(e.to_string()))
    }
}

/// `JIRA_HOURS`: today's logged minutes against the daily target.
pub struct HoursFeed {
    client: Arc<JiraClient>,
}

impl HoursFeed {
    pub fn new(client: Arc<JiraClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Feed for HoursFeed {
    fn command(&self) -> &'static str {
        JIRA_HOURS
    }

    fn period(&self) -> Option<Duration> {
        Some(HOURS_PERIOD)
    }

    async fn fetch(&self) -> Result<Value, IntegrationError> {
        self.client.logged_on(Local::now().date_naive()).await
    }
}

fn summarize_issue(issue: &SearchIssue) -> IssueSummary {
    let fields = &issue.fields;
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
    IssueSummary {
        key: issue.key.clone(),
        name: truncate(&text(&fields["summary"]), 47, 44),
        proj: truncate(&text(&fields["project"]["name"]), 23, 20),
        status: truncate(&text(&fields["status"]["name"]), 15, 12),
        desc: truncate(&adf_to_text(&fields["description"]), 127, 124),
    }
}

/// Plain text of an Atlassian Document Format tree.
pub fn adf_to_text(adf: &Value) -> String {
    fn walk(node: &Value, out: &mut String) {
        match node {
            Value::Object(map) => {
                let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
                match kind {
                    "text" => out.push_str(map.get("text").and_then(Value::as_str).unwrap_or_default()),
                    "hardBreak" => out.push('\n'),
                    _ => {}
                }
                if let Some(children) = map.get("content") {
                    walk(children, out);
                }
                if matches!(
                    kind,
                    "paragraph" | "heading" | "bulletList" | "orderedList" | "listItem"
                ) {
                    out.push('\n');
                }
            }
            Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
            _ => {}
        }
    }

    if !adf.is_object() {
        return String::new();
    }
    let mut out = String::new();
    walk(adf, &mut out);
    let mut text = out.trim().to_string();
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text
}
