//! Outlook calendar through Microsoft Graph.
//!
//! Sign-in uses the OAuth device-code flow. The first fetch without a usable
//! token starts the flow in the background and reports an auth error; once
//! the user has entered the code, the token pair is cached next to the
//! settings file and refreshed from then on.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeZone, Timelike, Utc};
use focusknob_common::paths::TOKEN_CACHE_FILE;
use focusknob_common::settings::CalendarCredentials;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{check_status, truncate, Feed, IntegrationError, CALENDAR};

const SERVICE: &str = "Microsoft Graph";
const GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const LOGIN_URL: &str = "https://login.microsoftonline.com";
const SCOPE: &str = "Calendars.Read offline_access";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const PERIOD: Duration = Duration::from_secs(300);
/// Tokens this close to expiry are refreshed early.
const EXPIRY_MARGIN_SECS: i64 = 60;

pub const NEXT_IN_PROGRESS: i64 = -1;
pub const NEXT_NONE: i64 = -2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenSet {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Unix seconds.
    expires_at: i64,
}

impl TokenSet {
    fn from_response(resp: TokenResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: Utc::now().timestamp() + resp.expires_in,
        }
    }

    fn is_fresh(&self) -> bool {
        self.expires_at - EXPIRY_MARGIN_SECS > Utc::now().timestamp()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct DeviceCode {
    device_code: String,
    verification_uri: String,
    #[serde(default)]
    message: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Token state shared with a running sign-in task.
struct Auth {
    http: reqwest::Client,
    creds: CalendarCredentials,
    cache_path: PathBuf,
    token: Mutex<Option<TokenSet>>,
    signing_in: AtomicBool,
}

impl Auth {
    fn token_url(&self) -> String {
        format!("{LOGIN_URL}/{}/oauth2/v2.0/token", self.creds.tenant_id)
    }

    async fn load_cache(&self) -> Option<TokenSet> {
        let raw = tokio::fs::read_to_string(&self.cache_path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Ignoring unreadable token cache {}: {}", self.cache_path.display(), e);
                None
            }
        }
    }

    async fn save_cache(&self, token: &TokenSet) -> Result<(), IntegrationError> {
        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(token).map_err(|e| IntegrationError::Payload(e.to_string()))?;
        tokio::fs::write(&self.cache_path, body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.cache_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        debug!("Saved calendar token cache");
        Ok(())
    }

    async fn store(&self, token: TokenSet) -> String {
        if let Err(e) = self.save_cache(&token).await {
            warn!("Failed to save token cache: {}", e);
        }
        let access = token.access_token.clone();
        *self.token.lock().await = Some(token);
        access
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IntegrationError> {
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.creds.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", SCOPE),
            ])
            .send()
            .await?;
        let resp: TokenResponse = check_status(SERVICE, response).await?.json().await?;
        let mut token = TokenSet::from_response(resp);
        // Microsoft may omit the refresh token on refresh; keep the old one.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    /// A usable access token, or an auth error while sign-in is pending.
    async fn access_token(self: &Arc<Self>) -> Result<String, IntegrationError> {
        let current = {
            let mut slot = self.token.lock().await;
            if slot.is_none() {
                *slot = self.load_cache().await;
            }
            slot.clone()
        };

        if let Some(token) = current {
            if token.is_fresh() {
                return Ok(token.access_token);
            }
            if let Some(refresh) = token.refresh_token.as_deref() {
                match self.refresh(refresh).await {
                    Ok(fresh) => return Ok(self.store(fresh).await),
                    Err(e) => warn!("Calendar token refresh failed: {}", e),
                }
            }
            *self.token.lock().await = None;
        }

        self.start_sign_in();
        Err(IntegrationError::Auth(
            "calendar sign-in required, follow the device login prompt".into(),
        ))
    }

    fn start_sign_in(self: &Arc<Self>) {
        if self.signing_in.swap(true, Ordering::SeqCst) {
            return;
        }
        let auth = self.clone();
        tokio::spawn(async move {
            match auth.device_flow().await {
                Ok(token) => {
                    auth.store(token).await;
                    info!("Calendar sign-in completed");
                }
                Err(e) => warn!("Calendar sign-in failed: {}", e),
            }
            auth.signing_in.store(false, Ordering::SeqCst);
        });
    }

    async fn device_flow(&self) -> Result<TokenSet, IntegrationError> {
        let response = self
            .http
            .post(format!(
                "{LOGIN_URL}/{}/oauth2/v2.0/devicecode",
                self.creds.tenant_id
            ))
            .form(&[("client_id", self.creds.client_id.as_str()), ("scope", SCOPE)])
            .send()
            .await?;
        let code: DeviceCode = check_status(SERVICE, response).await?.json().await?;
        warn!("AUTH REQUIRED: {}", code.message);
        crate::desktop::open_url(&code.verification_uri).await;

        let mut interval = Duration::from_secs(code.interval.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in.max(0) as u64);
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(interval).await;
            let response = self
                .http
                .post(self.token_url())
                .form(&[
                    ("grant_type", DEVICE_GRANT),
                    ("client_id", self.creds.client_id.as_str()),
                    ("device_code", code.device_code.as_str()),
                ])
                .send()
                .await?;
            if response.status().is_success() {
                return Ok(TokenSet::from_response(response.json().await?));
            }
            let err: OAuthError = response
                .json()
                .await
                .map_err(|e| IntegrationError::Auth(format!("unreadable token error: {e}")))?;
            match err.error.as_str() {
                "authorization_pending" => {}
                "slow_down" => interval += Duration::from_secs(5),
                _ => {
                    return Err(IntegrationError::Auth(format!(
                        "{}: {}",
                        err.error, err.error_description
                    )))
                }
            }
        }
        Err(IntegrationError::Auth("device code expired".into()))
    }
}

pub struct CalendarClient {
    auth: Arc<Auth>,
}

impl CalendarClient {
    pub fn new(http: reqwest::Client, creds: CalendarCredentials, cache_dir: PathBuf) -> Self {
        Self {
            auth: Arc::new(Auth {
                http,
                creds,
                cache_path: cache_dir.join(TOKEN_CACHE_FILE),
                token: Mutex::new(None),
                signing_in: AtomicBool::new(false),
            }),
        }
    }

    /// Events from now to the end of the local day.
    async fn calendar_view(&self, token: &str) -> Result<Vec<Slot>, IntegrationError> {
        let now = Local::now();
        let end_of_day = now
            .date_naive()
            .and_hms_opt(23, 59, 59)
            .unwrap_or_else(|| now.naive_local());
        let zone = self.auth.creds.timezone.as_deref();

        let (start, end) = match zone {
            Some(_) => (
                now.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string(),
                end_of_day.format("%Y-%m-%dT%H:%M:%S").to_string(),
            ),
            None => {
                let end_utc = Local
                    .from_local_datetime(&end_of_day)
                    .earliest()
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                (
                    now.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    end_utc.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                )
            }
        };

        let mut request = self
            .auth
            .http
            .get(format!("{GRAPH_URL}/me/calendarView"))
            .bearer_auth(token)
            .query(&[
                ("startDateTime", start.as_str()),
                ("endDateTime", end.as_str()),
                ("$select", "subject,start,end,isAllDay,location"),
                ("$orderby", "start/dateTime asc"),
                ("$top", "10"),
            ]);
        if let Some(zone) = zone {
            request = request.header("Prefer", format!("outlook.timezone=\"{zone}\""));
        }
        let body: Value = check_status(SERVICE, request.send().await?)
            .await?
            .json()
            .await?;
        Ok(parse_events(&body, zone.is_none()))
    }
}

#[async_trait]
impl Feed for CalendarClient {
    fn command(&self) -> &'static str {
        CALENDAR
    }

    fn period(&self) -> Option<Duration> {
        Some(PERIOD)
    }

    async fn fetch(&self) -> Result<Value, IntegrationError> {
        let token = self.auth.access_token().await?;
        let slots = self.calendar_view(&token).await?;
        let calendar = build_calendar(&slots, Local::now().naive_local());
        info!(
            "Fetched {} calendar events, next in {} min",
            slots.len(),
            calendar["next_meeting_min"]
        );
        Ok(calendar)
    }
}

/// One event with its times in local wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub title: String,
    pub location: String,
    pub is_all_day: bool,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

fn parse_graph_time(raw: &Value, utc: bool) -> Option<NaiveDateTime> {
    let text = raw["dateTime"].as_str()?.trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(if utc {
        Utc.from_utc_datetime(&naive).with_timezone(&Local).naive_local()
    } else {
        naive
    })
}

/// Graph `value` entries with unparsable times are skipped.
fn parse_events(body: &Value, utc: bool) -> Vec<Slot> {
    let Some(events) = body["value"].as_array() else {
        return Vec::new();
    };
    events
        .iter()
        .filter_map(|ev| {
            Some(Slot {
                title: ev["subject"].as_str().unwrap_or("No Title").to_string(),
                location: ev["location"]["displayName"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                is_all_day: ev["isAllDay"].as_bool().unwrap_or(false),
                start: parse_graph_time(&ev["start"], utc)?,
                end: parse_graph_time(&ev["end"], utc)?,
            })
        })
        .collect()
}

/// `9:05a`, `12:30p`.
fn short_time(t: &NaiveDateTime) -> String {
    let (pm, hour) = t.hour12();
    format!("{}:{:02}{}", hour, t.minute(), if pm { 'p' } else { 'a' })
}

/// The `CALENDAR` payload: display-ready events plus minutes until the next
/// meeting (`-1` while one is in progress, `-2` when none remain).
pub fn build_calendar(slots: &[Slot], now: NaiveDateTime) -> Value {
    let mut next = NEXT_NONE;
    let events: Vec<Value> = slots
        .iter()
        .map(|slot| {
            let until_start = (slot.start - now).num_seconds();
            let until_end = (slot.end - now).num_seconds();
            if until_start <= 0 && until_end > 0 {
                if next == NEXT_NONE {
                    next = NEXT_IN_PROGRESS;
                }
            } else if until_start > 0 {
                let mins = until_start / 60;
                if next == NEXT_NONE || (next >= 0 && mins < next) {
                    next = mins;
                }
            }

            json!({
                "title": truncate(&slot.title, 31, 28),
                "start_str": short_time(&slot.start),
                "start_time": slot.start.format("%H:%M").to_string(),
                "end_time": slot.end.format("%H:%M").to_string(),
                "duration_min": (slot.end - slot.start).num_minutes().max(1),
                "is_all_day": slot.is_all_day,
                "location": truncate(&slot.location, 31, 28),
            })
        })
        .collect();
    json!({ "events": events, "next_meeting_min": next })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn slot(title: &str, start: NaiveDateTime, end: NaiveDateTime) -> Slot {
        Slot {
            title: title.into(),
            location: String::new(),
            is_all_day: false,
            start,
            end,
        }
    }

    #[test]
    fn upcoming_meetings_count_down() {
        let slots = [
            slot("Standup", at(9, 30), at(9, 45)),
            slot("Review", at(11, 0), at(12, 0)),
        ];
        let cal = build_calendar(&slots, at(9, 5));
        assert_eq!(cal["next_meeting_min"], 25);
        let first = &cal["events"][0];
        assert_eq!(first["start_str"], "9:30a");
        assert_eq!(first["start_time"], "09:30");
        assert_eq!(first["end_time"], "09:45");
        assert_eq!(first["duration_min"], 15);
    }

    #[test]
    fn in_progress_wins_and_none_is_minus_two() {
        let slots = [
            slot("Planning", at(9, 0), at(10, 0)),
            slot("Lunch", at(12, 0), at(13, 0)),
        ];
        assert_eq!(build_calendar(&slots, at(9, 30))["next_meeting_min"], NEXT_IN_PROGRESS);
        assert_eq!(build_calendar(&slots, at(14, 0))["next_meeting_min"], NEXT_NONE);
        assert_eq!(build_calendar(&[], at(9, 0))["next_meeting_min"], NEXT_NONE);
    }

    #[test]
    fn display_fields() {
        let mut long = slot(&"t".repeat(40), at(12, 5), at(12, 5));
        long.location = "Room 4".into();
        let cal = build_calendar(&[long, slot("Late", at(0, 15), at(1, 0))], at(8, 0));
        let ev = &cal["events"][0];
        assert_eq!(ev["title"].as_str().unwrap().chars().count(), 31);
        assert_eq!(ev["start_str"], "12:05p");
        assert_eq!(ev["duration_min"], 1);
        assert_eq!(ev["location"], "Room 4");
        assert_eq!(cal["events"][1]["start_str"], "12:15a");
    }

    #[test]
    fn graph_events_parse_and_skip_bad_times() {
        let body = json!({"value": [
            {"subject": "Sync", "isAllDay": false,
             "start": {"dateTime": "2025-03-04T14:00:00.0000000"},
             "end": {"dateTime": "2025-03-04T14:30:00.0000000"},
             "location": {"displayName": "Teams"}},
            {"subject": "Broken", "start": {"dateTime": "soon"}, "end": {}}
        ]});
        let slots = parse_events(&body, false);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].start, at(14, 0));
        assert_eq!(slots[0].location, "Teams");
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let creds = CalendarCredentials {
            tenant_id: "t".into(),
            client_id: "c".into(),
            timezone: None,
        };
        let client = CalendarClient::new(reqwest::Client::new(), creds, dir.path().to_path_buf());
        let token = TokenSet {
            access_token: "cached".into(),
            refresh_token: None,
            expires_at: Utc::now().timestamp() + 3600,
        };
        client.auth.save_cache(&token).await.unwrap();
        assert_eq!(client.auth.access_token().await.unwrap(), "cached");
    }
}
