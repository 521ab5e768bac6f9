//! Device-triggered flows that need an answer from the person at the desk.
//!
//! The question goes out as an `input_request` push to every UI client and
//! the flow waits on the correlator until one of them answers, the timeout
//! passes, or no UI is attached at all. The device always hears back:
//! `JIRA_LOG_OK` or `JIRA_LOG_ERROR:<reason>`.

use std::sync::Arc;
use std::time::Duration;

use focusknob_common::{InputField, InputReply, InputRequest, Message, PendingRequests, PromptKind};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::device::Device;
use crate::duration::parse_minutes;
use crate::integrations::{IntegrationRegistry, WorkLog, JIRA_HOURS};
use crate::ipc_server::EventSink;
use crate::meetings::DueMeeting;
use crate::wire::{clean_payload, log_error, JIRA_LOG_OK};

const DEFAULT_DESCRIPTION: &str = "Focus work";
const DEFAULT_DURATION: &str = "30";
const TIMER_FALLBACK_MIN: u64 = 1;
const MEETING_FALLBACK_MIN: u64 = 30;
const SUGGESTION_LIMIT: usize = 5;

/// Why a flow ended without logging anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declined {
    InvalidData,
    NotConfigured,
    Cancelled,
    NoAnswer,
    ApiError,
}

impl Declined {
    /// Reason text sent to the device after `JIRA_LOG_ERROR:`.
    pub fn reason(self) -> &'static str {
        match self {
            Declined::InvalidData => "Invalid data",
            Declined::NotConfigured => "Jira not configured",
            Declined::Cancelled => "Cancelled by user",
            Declined::NoAnswer => "No answer",
            Declined::ApiError => "Jira API error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkflowTimeouts {
    pub description: Duration,
    pub duration: Duration,
    pub meeting: Duration,
}

impl Default for WorkflowTimeouts {
    fn default() -> Self {
        Self {
            description: Duration::from_secs(300),
            duration: Duration::from_secs(120),
            meeting: Duration::from_secs(120),
        }
    }
}

/// Pushes questions to the UI and pairs them with `input_response`s.
pub struct InputBroker {
    events: Arc<dyn EventSink>,
    pending: PendingRequests<InputReply>,
}

impl InputBroker {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            events,
            pending: PendingRequests::new(),
        }
    }

    /// Ask every connected UI; the first answer wins. `None` when no UI is
    /// attached (returned at once) or nobody answered within `timeout`.
    pub async fn request(
        &self,
        prompt: PromptKind,
        fields: Vec<InputField>,
        context: Map<String, Value>,
        timeout: Duration,
    ) -> Option<InputReply> {
        if !self.events.has_clients() {
            warn!("No UI connected, skipping {:?} prompt", prompt);
            return None;
        }
        let id = Uuid::new_v4().to_string();
        let handle = match self.pending.register(id.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot track input request: {}", e);
                return None;
            }
        };
        self.events.push_event(&Message::InputRequest(InputRequest {
            id,
            prompt,
            fields,
            context,
        }));
        let reply = self.pending.await_result(handle, timeout).await;
        if reply.is_none() {
            warn!(
                "Input request {:?} got no answer within {}s",
                prompt,
                timeout.as_secs()
            );
        }
        reply
    }

    /// Hand an `input_response` to its waiting flow. Late or unknown ids
    /// are dropped.
    pub fn resolve(&self, id: &str, reply: InputReply) -> bool {
        let delivered = self.pending.fulfill(id, reply);
        if !delivered {
            info!(id, "Ignoring input response nobody is waiting for");
        }
        delivered
    }

    /// Wake every waiting flow with no answer.
    pub fn release_all(&self) {
        self.pending.clear();
    }

    pub fn waiting(&self) -> usize {
        self.pending.len()
    }
}

fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Cheap to clone; each flow runs on its own task.
#[derive(Clone)]
pub struct Workflows {
    device: Arc<dyn Device>,
    registry: Arc<IntegrationRegistry>,
    inputs: Arc<InputBroker>,
    /// Lines the device sent back to our replies, for the sync loop.
    inbox: mpsc::UnboundedSender<Vec<String>>,
    timeouts: WorkflowTimeouts,
}

impl Workflows {
    pub fn new(
        device: Arc<dyn Device>,
        registry: Arc<IntegrationRegistry>,
        inputs: Arc<InputBroker>,
        inbox: mpsc::UnboundedSender<Vec<String>>,
    ) -> Self {
        Self {
            device,
            registry,
            inputs,
            inbox,
            timeouts: WorkflowTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: WorkflowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// `JIRA_TIMER_DONE:<KEY>|<MIN>`: ask what was done, then log it.
    pub async fn timer_done(&self, payload: &str) -> Result<(), Declined> {
        let payload = clean_payload(payload);
        info!("JIRA_TIMER_DONE raw: {:?}", payload);
        let outcome = self.log_timer(&payload).await;
        self.reply(outcome).await;
        outcome
    }

    /// `JIRA_LOG_TIME:<KEY>`: ask how long and what, then log it.
    pub async fn log_time(&self, payload: &str) -> Result<(), Declined> {
        let key = clean_payload(payload);
        info!("JIRA_LOG_TIME: {}", key);
        let outcome = self.log_manual(&key).await;
        self.reply(outcome).await;
        outcome
    }

    /// `JIRA_LOG_MEETING:<TITLE>|<MIN>`: ask which issue, then log it.
    pub async fn log_meeting(&self, payload: &str) -> Result<(), Declined> {
        let payload = clean_payload(payload);
        info!("JIRA_LOG_MEETING raw: {:?}", payload);
        let outcome = match payload.split_once('|') {
            None => {
                error!("Invalid JIRA_LOG_MEETING format: {:?}", payload);
                Err(Declined::InvalidData)
            }
            Some((title, minutes)) => {
                let minutes = minutes.trim().parse().unwrap_or(MEETING_FALLBACK_MIN);
                self.prompt_meeting_log(title.trim(), minutes).await
            }
        };
        self.reply(outcome).await;
        outcome
    }

    /// Offer to log a meeting the calendar says just ended. Nothing is sent
    /// to the device.
    pub async fn meeting_ended(&self, meeting: DueMeeting) -> Result<(), Declined> {
        info!("Meeting ended: {} ({} min)", meeting.title, meeting.duration_min);
        let outcome = self
            .prompt_meeting_log(&meeting.title, meeting.duration_min)
            .await;
        if let Err(reason) = outcome {
            info!("Meeting '{}' not logged: {}", meeting.title, reason.reason());
        }
        outcome
    }

    /// `JIRA_OPEN:<KEY>`: show the issue in the browser.
    pub async fn open_issue(&self, payload: &str) {
        let key = clean_payload(payload);
        match self.registry.current().jira_browse_url.as_deref() {
            Some(base) if !key.is_empty() => {
                info!("Opening Jira issue in browser: {}", key);
                crate::desktop::open_url(&format!("{base}/browse/{key}")).await;
            }
            Some(_) => warn!("JIRA_OPEN without an issue key"),
            None => error!("No Jira URL configured"),
        }
    }

    fn jira(&self) -> Result<Arc<dyn WorkLog>, Declined> {
        self.registry.current().jira.clone().ok_or_else(|| {
            error!("Jira not configured, cannot log work");
            Declined::NotConfigured
        })
    }

    async fn log_timer(&self, payload: &str) -> Result<(), Declined> {
        let mut parts = payload.split('|');
        let (Some(key), Some(minutes)) = (parts.next(), parts.next()) else {
            error!("Invalid JIRA_TIMER_DONE format: {:?}", payload);
            return Err(Declined::InvalidData);
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Declined::InvalidData);
        }
        let minutes = minutes.trim().parse().unwrap_or(TIMER_FALLBACK_MIN);
        info!("Jira timer done: {} - {}min", key, minutes);

        let jira = self.jira()?;
        let description = self.ask_description(key, minutes).await?;
        self.log_work(jira.as_ref(), key, minutes, &description).await
    }

    async fn log_manual(&self, key: &str) -> Result<(), Declined> {
        if key.is_empty() {
            return Err(Declined::InvalidData);
        }
        let jira = self.jira()?;
        let minutes = self.ask_duration(key).await?;
        let description = self.ask_description(key, minutes).await?;
        self.log_work(jira.as_ref(), key, minutes, &description).await
    }

    async fn prompt_meeting_log(&self, title: &str, minutes: u64) -> Result<(), Declined> {
        let jira = self.jira()?;

        let mut label = format!(
            "Meeting ended: {title}\nDuration: {minutes} min\n\nEnter Jira issue key to log to:"
        );
        match jira.issue_suggestions(SUGGESTION_LIMIT).await {
            Ok(suggestions) if !suggestions.is_empty() => {
                label.push_str("\n\n");
                label.push_str(&suggestions.join("\n"));
            }
            Ok(_) => {}
            Err(e) => warn!("No issue suggestions: {}", e),
        }

        let reply = self
            .inputs
            .request(
                PromptKind::MeetingLog,
                vec![InputField::text("issue_key", label, "")],
                context(&[("meeting_title", json!(title)), ("duration", json!(minutes))]),
                self.timeouts.meeting,
            )
            .await
            .ok_or(Declined::NoAnswer)?;
        if reply.cancelled {
            info!("User skipped meeting log for: {}", title);
            return Err(Declined::Cancelled);
        }
        let key = reply.field("issue_key").unwrap_or_default().trim().to_uppercase();
        if key.is_empty() {
            return Err(Declined::Cancelled);
        }

        self.log_work(jira.as_ref(), &key, minutes, &format!("Meeting: {title}"))
            .await?;
        self.refresh_hours().await;
        Ok(())
    }

    async fn ask_description(&self, key: &str, minutes: u64) -> Result<String, Declined> {
        let reply = self
            .inputs
            .request(
                PromptKind::WorkDescription,
                vec![InputField::text(
                    "description",
                    format!("What did you work on?\n\n{key} - {minutes} min"),
                    DEFAULT_DESCRIPTION,
                )],
                context(&[("issue_key", json!(key)), ("duration", json!(minutes))]),
                self.timeouts.description,
            )
            .await
            .ok_or(Declined::NoAnswer)?;
        if reply.cancelled {
            info!("User cancelled work description");
            return Err(Declined::Cancelled);
        }
        let description = reply.field("description").unwrap_or_default().trim();
        Ok(if description.is_empty() {
            DEFAULT_DESCRIPTION.to_string()
        } else {
            description.to_string()
        })
    }

    async fn ask_duration(&self, key: &str) -> Result<u64, Declined> {
        let reply = self
            .inputs
            .request(
                PromptKind::Duration,
                vec![InputField::text(
                    "duration",
                    format!("How long to log?\n\n{key}\n(e.g. 30, 1h, 1h30m, 1.5h)"),
                    DEFAULT_DURATION,
                )],
                context(&[("issue_key", json!(key))]),
                self.timeouts.duration,
            )
            .await
            .ok_or(Declined::NoAnswer)?;
        if reply.cancelled {
            return Err(Declined::Cancelled);
        }
        let text = reply.field("duration").unwrap_or_default();
        match parse_minutes(text).filter(|m| *m > 0) {
            Some(minutes) => {
                info!("Parsed duration: {:?} -> {} min", text, minutes);
                Ok(minutes)
            }
            None => {
                error!("Could not parse duration: {:?}", text);
                Err(Declined::InvalidData)
            }
        }
    }

    async fn log_work(
        &self,
        jira: &dyn WorkLog,
        key: &str,
        minutes: u64,
        description: &str,
    ) -> Result<(), Declined> {
        let Some(seconds) = minutes.checked_mul(60) else {
            error!("Duration out of range for {}: {} min", key, minutes);
            return Err(Declined::InvalidData);
        };
        match jira.log_work(key, seconds, description).await {
            Ok(()) => {
                info!("Logged {}min to {}: {}", minutes, key, description);
                Ok(())
            }
            Err(e) => {
                error!("Failed to log work to {}: {}", key, e);
                Err(Declined::ApiError)
            }
        }
    }

    async fn refresh_hours(&self) {
        let Some(feed) = self.registry.current().feed(JIRA_HOURS) else {
            return;
        };
        if let Some((_, lines)) = crate::sync::push_feed(self.device.as_ref(), feed.as_ref()).await {
            self.forward(lines);
        }
    }

    async fn reply(&self, outcome: Result<(), Declined>) {
        let command = match outcome {
            Ok(()) => JIRA_LOG_OK.to_string(),
            Err(reason) => log_error(reason.reason()),
        };
        let lines = self.device.send_command(&command).await;
        self.forward(lines);
    }

    fn forward(&self, lines: Vec<String>) {
        if !lines.is_empty() && self.inbox.send(lines).is_err() {
            warn!("Sync loop is gone, dropping device lines");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records pushes; `clients` decides what `has_clients` reports.
    #[derive(Default)]
    pub struct RecordingEvents {
        pub clients: AtomicBool,
        pub pushed: Mutex<Vec<Message>>,
    }

    impl RecordingEvents {
        pub fn with_clients() -> Self {
            let events = Self::default();
            events.clients.store(true, Ordering::SeqCst);
            events
        }

        pub fn pushed(&self) -> Vec<Message> {
            self.pushed.lock().unwrap().clone()
        }

        pub fn input_requests(&self) -> Vec<InputRequest> {
            self.pushed()
                .into_iter()
                .filter_map(|m| match m {
                    Message::InputRequest(req) => Some(req),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingEvents {
        fn push_event(&self, message: &Message) {
            self.pushed.lock().unwrap().push(message.clone());
        }

        fn has_clients(&self) -> bool {
            self.clients.load(Ordering::SeqCst)
        }
    }
}
