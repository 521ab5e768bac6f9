//! The daemon's main loop: find the knob, keep it alive, keep it fed.
//!
//! Disconnected, the loop polls for the device every [`POLL_INTERVAL`].
//! Once connected it pings every [`PING_INTERVAL`], refreshes each enabled
//! feed on its own period and drains anything the device says unprompted.
//! A missing `PONG` drops back to disconnected. Flows that wait on a human
//! run on their own tasks and hand the device's replies back through an
//! inbox, so the loop itself never waits on a person.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use focusknob_common::Message;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::channel::{PING, PONG};
use crate::device::Device;
use crate::handlers::StatusBoard;
use crate::integrations::{Feed, IntegrationRegistry, CALENDAR, JIRA_HOURS, JIRA_PROJECTS, WEATHER};
use crate::ipc_server::EventSink;
use crate::meetings::{CalendarEvent, MeetingTracker};
use crate::wire::{time_command, DeviceLine, GET_LOGS, TIME_OK};
use crate::workflows::{InputBroker, Workflows};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Feeds pushed right after connecting, in this order.
const HANDSHAKE_FEEDS: [&str; 4] = [JIRA_PROJECTS, WEATHER, CALENDAR, JIRA_HOURS];

#[derive(Debug, Clone, Copy)]
pub struct SyncTiming {
    pub poll: Duration,
    pub ping: Duration,
    /// How long to wait for unsolicited device output per cycle.
    pub drain: Duration,
    /// Pause between connected cycles.
    pub idle: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            poll: POLL_INTERVAL,
            ping: PING_INTERVAL,
            drain: Duration::from_millis(100),
            idle: Duration::from_millis(50),
        }
    }
}

/// Fetch `feed` and push it as `<COMMAND>:<json>`. Returns the data and the
/// device's response lines, or `None` when the fetch failed.
pub(crate) async fn push_feed(device: &dyn Device, feed: &dyn Feed) -> Option<(Value, Vec<String>)> {
    let command = feed.command();
    let data = match feed.fetch().await {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to fetch {} data: {}", command, e);
            return None;
        }
    };
    let body = match serde_json::to_string(&data) {
        Ok(body) => body,
        Err(e) => {
            error!("Cannot encode {} data: {}", command, e);
            return None;
        }
    };
    let responses = device.send_command(&format!("{command}:{body}")).await;
    let ack = format!("{command}_OK");
    if responses.iter().any(|line| *line == ack) {
        info!("Synced {} to device", command);
    } else {
        warn!("No acknowledgment for {} sync", command);
    }
    Some((data, responses))
}

#[derive(Clone, Copy)]
enum Entry {
    Log,
    Note,
}

pub struct SyncService {
    device: Arc<dyn Device>,
    registry: Arc<IntegrationRegistry>,
    events: Arc<dyn EventSink>,
    status: Arc<StatusBoard>,
    workflows: Workflows,
    inbox: mpsc::UnboundedReceiver<Vec<String>>,
    meetings: MeetingTracker,
    last_ping: Option<Instant>,
    last_sync: HashMap<&'static str, Instant>,
    timing: SyncTiming,
}

impl SyncService {
    pub fn new(
        device: Arc<dyn Device>,
        registry: Arc<IntegrationRegistry>,
        events: Arc<dyn EventSink>,
        inputs: Arc<InputBroker>,
        status: Arc<StatusBoard>,
    ) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let workflows = Workflows::new(device.clone(), registry.clone(), inputs, tx);
        Self {
            device,
            registry,
            events,
            status,
            workflows,
            inbox,
            meetings: MeetingTracker::new(),
            last_ping: None,
            last_sync: HashMap::new(),
            timing: SyncTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: SyncTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Run until `shutdown` carries an exit code, then let go of the device.
    pub async fn run(mut self, mut shutdown: watch::Receiver<Option<i32>>) {
        info!("FocusKnob sync service started");
        loop {
            if shutdown.borrow().is_some() {
                break;
            }
            let pause = self.tick(Instant::now()).await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
        self.device.disconnect().await;
        if self.status.set_disconnected() {
            self.push_status(false, None);
        }
        info!("FocusKnob sync service stopped");
    }

    /// One pass of the loop; returns how long to pause before the next.
    pub async fn tick(&mut self, now: Instant) -> Duration {
        self.drain_inbox().await;

        if !self.device.is_connected().await {
            // A failed command already closed the link.
            self.mark_disconnected();
            let Some(port) = self.device.discover().await else {
                return self.timing.poll;
            };
            if !self.device.connect(&port).await {
                return self.timing.poll;
            }
            self.on_connected(port, now).await;
            return self.timing.idle;
        }

        if self
            .last_ping
            .map_or(true, |at| now.duration_since(at) >= self.timing.ping)
        {
            let responses = self.device.send_command(PING).await;
            if !responses.iter().any(|line| line == PONG) {
                warn!("Lost connection to device");
                self.device.disconnect().await;
                self.mark_disconnected();
                return self.timing.poll;
            }
            self.last_ping = Some(now);
            self.dispatch(responses).await;
        }

        self.refresh_due_feeds(now).await;

        if let Some(line) = self.device.read_line(self.timing.drain).await {
            self.dispatch(vec![line]).await;
        }
        self.timing.idle
    }

    fn push_status(&self, connected: bool, port: Option<String>) {
        self.events
            .push_event(&Message::StatusUpdate { connected, port });
    }

    /// Push the negative status once per connected period.
    fn mark_disconnected(&mut self) {
        self.last_ping = None;
        if self.status.set_disconnected() {
            self.push_status(false, None);
        }
    }

    async fn on_connected(&mut self, port: String, now: Instant) {
        info!("Connected to FocusKnob on {}", port);
        self.status.set_connected(port.clone());
        self.push_status(true, Some(port));

        self.sync_time().await;
        let responses = self.device.send_command(GET_LOGS).await;
        self.dispatch(responses).await;

        let set = self.registry.current();
        for command in HANDSHAKE_FEEDS {
            if let Some(feed) = set.feed(command) {
                self.sync_feed(feed.as_ref()).await;
                self.last_sync.insert(command, now);
            }
        }
        self.last_ping = Some(now);
    }

    async fn sync_time(&mut self) {
        let responses = self
            .device
            .send_command(&time_command(Local::now().naive_local()))
            .await;
        if responses.iter().any(|line| line == TIME_OK) {
            info!("Device clock synced");
        } else {
            warn!("No acknowledgment for time sync");
        }
        self.dispatch(responses).await;
    }

    async fn refresh_due_feeds(&mut self, now: Instant) {
        let set = self.registry.current();
        for feed in &set.feeds {
            let Some(period) = feed.period() else {
                continue;
            };
            let due = self
                .last_sync
                .get(feed.command())
                .map_or(true, |at| now.duration_since(*at) >= period);
            if due {
                self.sync_feed(feed.as_ref()).await;
                self.last_sync.insert(feed.command(), now);
            }
        }
    }

    async fn sync_feed(&mut self, feed: &dyn Feed) {
        let Some((data, responses)) = push_feed(self.device.as_ref(), feed).await else {
            return;
        };
        self.dispatch(responses).await;
        if feed.command() == CALENDAR {
            self.check_ended_meetings(&data);
        }
    }

    fn check_ended_meetings(&mut self, calendar: &Value) {
        if !self.registry.current().jira_enabled() {
            return;
        }
        let events: Vec<CalendarEvent> =
            serde_json::from_value(calendar["events"].clone()).unwrap_or_default();
        for meeting in self.meetings.due(&events, Local::now().naive_local()) {
            let workflows = self.workflows.clone();
            tokio::spawn(async move {
                let _ = workflows.meeting_ended(meeting).await;
            });
        }
    }

    async fn drain_inbox(&mut self) {
        while let Ok(lines) = self.inbox.try_recv() {
            self.dispatch(lines).await;
        }
    }

    async fn dispatch(&mut self, lines: Vec<String>) {
        for line in lines {
            match DeviceLine::parse(&line) {
                DeviceLine::Log(json) => self.forward_entry(Entry::Log, json).await,
                DeviceLine::Note(json) => self.forward_entry(Entry::Note, json).await,
                DeviceLine::JiraTimerDone(payload) => {
                    let (workflows, payload) = (self.workflows.clone(), payload.to_string());
                    tokio::spawn(async move {
                        let _ = workflows.timer_done(&payload).await;
                    });
                }
                DeviceLine::JiraLogTime(payload) => {
                    let (workflows, payload) = (self.workflows.clone(), payload.to_string());
                    tokio::spawn(async move {
                        let _ = workflows.log_time(&payload).await;
                    });
                }
                DeviceLine::JiraLogMeeting(payload) => {
                    let (workflows, payload) = (self.workflows.clone(), payload.to_string());
                    tokio::spawn(async move {
                        let _ = workflows.log_meeting(&payload).await;
                    });
                }
                DeviceLine::JiraOpen(payload) => self.workflows.open_issue(payload).await,
                DeviceLine::Ack(command) => debug!("Device acknowledged {}", command),
                DeviceLine::Error(message) => error!("Device error: {}", message),
                DeviceLine::Ready(name) => info!("Device ready: {}", name),
                DeviceLine::Expected => {}
                DeviceLine::Debug(text) => debug!("Device debug: {}", text),
                DeviceLine::Unknown(text) => debug!("Unknown response: {}", text),
            }
        }
    }

    /// `LOG:` / `NOTE:` go to Notion when it is enabled; the device gets
    /// `OK` once the entry is stored (or right away without Notion).
    async fn forward_entry(&mut self, kind: Entry, json: &str) {
        let label = match kind {
            Entry::Log => "log",
            Entry::Note => "note",
        };
        let entry: Value = match serde_json::from_str(json) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Invalid {} JSON: {}", label, e);
                return;
            }
        };
        match kind {
            Entry::Log => info!(
                "Received log: {} - {} pomodoros",
                entry["date"], entry["pomodoros"]
            ),
            Entry::Note => {
                let text: String = entry["text"]
                    .as_str()
                    .unwrap_or_default()
                    .chars()
                    .take(50)
                    .collect();
                info!("Received note: {}...", text)
            }
        }

        let Some(notion) = self.registry.current().notion.clone() else {
            self.device.send_ack().await;
            return;
        };
        let stored = match kind {
            Entry::Log => notion.add_log_entry(&entry).await,
            Entry::Note => notion.add_note(&entry).await,
        };
        match stored {
            Ok(()) => self.device.send_ack().await,
            Err(e) => error!("Failed to sync {} to Notion: {}", label, e),
        }
    }
}
