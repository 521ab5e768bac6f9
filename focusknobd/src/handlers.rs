//! Answers to UI requests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use focusknob_common::{DaemonStatus, InputReply, Message};
use tracing::{info, warn};

use crate::integrations::IntegrationRegistry;
use crate::ipc_server::MessageHandler;
use crate::logs;
use crate::shutdown::Shutdown;
use crate::workflows::InputBroker;

/// Delay between answering `restart` and stopping, so the reply gets out.
const RESTART_DELAY: Duration = Duration::from_millis(500);
/// Exit code asking the service manager to start us again.
pub const RESTART_EXIT_CODE: i32 = 1;

/// Connection state as last seen by the sync loop.
pub struct StatusBoard {
    connected: AtomicBool,
    port: Mutex<Option<String>>,
    started: Instant,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            port: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn set_connected(&self, port: String) {
        *self.port.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// True when this call ended a connected period.
    pub fn set_disconnected(&self) -> bool {
        *self.port.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> Option<String> {
        self.port.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct DaemonHandler {
    status: Arc<StatusBoard>,
    registry: Arc<IntegrationRegistry>,
    inputs: Arc<InputBroker>,
    log_file: PathBuf,
    shutdown: Shutdown,
}

impl DaemonHandler {
    pub fn new(
        status: Arc<StatusBoard>,
        registry: Arc<IntegrationRegistry>,
        inputs: Arc<InputBroker>,
        log_file: PathBuf,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            status,
            registry,
            inputs,
            log_file,
            shutdown,
        }
    }

    fn snapshot(&self) -> DaemonStatus {
        let set = self.registry.current();
        DaemonStatus {
            connected: self.status.connected(),
            port: self.status.port(),
            jira_enabled: set.jira_enabled(),
            notion_enabled: set.notion_enabled(),
            weather_enabled: set.weather_enabled(),
            calendar_enabled: set.calendar_enabled(),
            uptime_seconds: self.status.uptime().as_secs(),
        }
    }

    fn reload(&self) -> (bool, String) {
        match self.registry.reload() {
            Ok(summary) => (true, format!("Config reloaded: {summary}")),
            Err(e) => {
                warn!("Config reload failed: {}", e);
                (false, format!("Config reload failed: {e}"))
            }
        }
    }

    fn schedule_restart(&self) {
        info!("Restart requested via IPC");
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DELAY).await;
            shutdown.trigger(RESTART_EXIT_CODE);
        });
    }
}

#[async_trait]
impl MessageHandler for DaemonHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        match message {
            Message::Status { id } => Some(Message::StatusResult {
                id,
                status: self.snapshot(),
            }),
            Message::ReloadConfig { id } => {
                let (success, message) = self.reload();
                Some(Message::ReloadConfigResult {
                    id,
                    success,
                    message,
                })
            }
            Message::Restart { id } => {
                self.schedule_restart();
                Some(Message::RestartResult { id, success: true })
            }
            Message::Logs { id, lines } => {
                let path = self.log_file.clone();
                let content = tokio::task::spawn_blocking(move || logs::tail(&path, lines))
                    .await
                    .unwrap_or_else(|e| format!("Error reading logs: {e}"));
                Some(Message::LogsResult { id, content })
            }
            Message::InputResponse {
                id,
                cancelled,
                data,
            } => {
                self.inputs.resolve(&id, InputReply { cancelled, data });
                None
            }
            other => Some(Message::error(
                other.id(),
                format!("Unknown command: {}", other.kind()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::testing::RecordingSink;
    use crate::integrations::IntegrationSet;
    use crate::workflows::testing::RecordingEvents;
    use focusknob_common::{InputField, PromptKind};
    use serde_json::{json, Map};

    fn handler(dir: &std::path::Path) -> (DaemonHandler, Arc<StatusBoard>, Arc<InputBroker>, Shutdown) {
        let status = Arc::new(StatusBoard::new());
        let mut set = IntegrationSet::default();
        set.notion = Some(Arc::new(RecordingSink::default()));
        let registry = Arc::new(IntegrationRegistry::fixed(set));
        let inputs = Arc::new(InputBroker::new(Arc::new(RecordingEvents::with_clients())));
        let shutdown = Shutdown::new();
        let handler = DaemonHandler::new(
            status.clone(),
            registry,
            inputs.clone(),
            dir.join("sync.log"),
            shutdown.clone(),
        );
        (handler, status, inputs, shutdown)
    }

    #[tokio::test]
    async fn status_reflects_board_and_integrations() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, status, _, _) = handler(dir.path());
        status.set_connected("/dev/ttyACM0".into());

        let Some(Message::StatusResult { id, status }) =
            handler.handle(Message::Status { id: "X".into() }).await
        else {
            panic!("expected status_result");
        };
        assert_eq!(id, "X");
        assert!(status.connected);
        assert_eq!(status.port.as_deref(), Some("/dev/ttyACM0"));
        assert!(status.notion_enabled);
        assert!(!status.jira_enabled);
    }

    #[tokio::test]
    async fn logs_and_unknown_types() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _, _, _) = handler(dir.path());
        std::fs::write(dir.path().join("sync.log"), "a\nb\nc\n").unwrap();

        let reply = handler
            .handle(Message::Logs {
                id: "L".into(),
                lines: 2,
            })
            .await;
        assert_eq!(
            reply,
            Some(Message::LogsResult {
                id: "L".into(),
                content: "b\nc\n".into()
            })
        );

        let reply = handler
            .handle(Message::Unknown {
                kind: "bogus".into(),
                id: Some("U".into()),
            })
            .await;
        assert_eq!(
            reply,
            Some(Message::Error {
                id: Some("U".into()),
                message: "Unknown command: bogus".into()
            })
        );
    }

    #[tokio::test]
    async fn reload_without_source_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _, _, _) = handler(dir.path());
        let Some(Message::ReloadConfigResult { success, message, .. }) = handler
            .handle(Message::ReloadConfig { id: "R".into() })
            .await
        else {
            panic!("expected reload_config_result");
        };
        assert!(!success);
        assert!(message.starts_with("Config reload failed"));
    }

    #[tokio::test]
    async fn restart_replies_then_triggers_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _, _, shutdown) = handler(dir.path());
        let reply = handler.handle(Message::Restart { id: "Z".into() }).await;
        assert_eq!(
            reply,
            Some(Message::RestartResult {
                id: "Z".into(),
                success: true
            })
        );
        assert_eq!(shutdown.requested(), None);
        let code = tokio::time::timeout(Duration::from_secs(2), shutdown.wait())
            .await
            .unwrap();
        assert_eq!(code, RESTART_EXIT_CODE);
    }

    #[tokio::test]
    async fn input_response_resolves_waiter_without_reply() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(RecordingEvents::with_clients());
        let inputs = Arc::new(InputBroker::new(events.clone()));
        let handler = DaemonHandler::new(
            Arc::new(StatusBoard::new()),
            Arc::new(IntegrationRegistry::fixed(IntegrationSet::default())),
            inputs.clone(),
            dir.path().join("sync.log"),
            Shutdown::new(),
        );

        let waiter = tokio::spawn({
            let inputs = inputs.clone();
            async move {
                inputs
                    .request(
                        PromptKind::Duration,
                        vec![InputField::text("duration", "How long?", "30")],
                        Map::new(),
                        Duration::from_secs(2),
                    )
                    .await
            }
        });
        let id = loop {
            if let Some(req) = events.input_requests().first() {
                break req.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let stray = Message::InputResponse {
            id: "nobody".into(),
            cancelled: false,
            data: Map::new(),
        };
        assert_eq!(handler.handle(stray).await, None);
        assert_eq!(inputs.waiting(), 1);

        let mut data = Map::new();
        data.insert("duration".into(), json!("45"));
        let reply = handler
            .handle(Message::InputResponse {
                id,
                cancelled: false,
                data,
            })
            .await;
        assert_eq!(reply, None);
        let answer = waiter.await.unwrap().unwrap();
        assert!(!answer.cancelled);
        assert_eq!(answer.field("duration"), Some("45"));
        assert_eq!(inputs.waiting(), 0);
    }
}
