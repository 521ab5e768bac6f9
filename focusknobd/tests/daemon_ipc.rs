//! The daemon's socket as a UI sees it: real server, real client.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use focusknob_common::{Message, RequestKind};
use focusknobd::device::Device;
use focusknobd::handlers::{DaemonHandler, StatusBoard, RESTART_EXIT_CODE};
use focusknobd::integrations::{IntegrationError, IntegrationRegistry, IntegrationSet, WorkLog};
use focusknobd::ipc_server::{EventSink, IpcServer};
use focusknobd::shutdown::Shutdown;
use focusknobd::workflows::{Declined, InputBroker, Workflows};
use focusknobd::{serve, DaemonOptions};
use focusknobd_client::IpcClient;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// A knob that is never plugged in, but remembers what it was told.
#[derive(Default)]
struct UnpluggedKnob {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Device for UnpluggedKnob {
    async fn discover(&self) -> Option<String> {
        None
    }
    async fn connect(&self, _port: &str) -> bool {
        false
    }
    async fn disconnect(&self) {}
    async fn send_command(&self, command: &str) -> Vec<String> {
        self.sent.lock().unwrap().push(command.to_string());
        Vec::new()
    }
    async fn send_ack(&self) {}
    async fn read_line(&self, _timeout: Duration) -> Option<String> {
        None
    }
    async fn is_connected(&self) -> bool {
        false
    }
    async fn port(&self) -> Option<String> {
        None
    }
}

#[derive(Default)]
struct JiraLog {
    logged: Mutex<Vec<(String, u64, String)>>,
}

#[async_trait]
impl WorkLog for JiraLog {
    async fn log_work(&self, key: &str, seconds: u64, description: &str) -> Result<(), IntegrationError> {
        self.logged
            .lock()
            .unwrap()
            .push((key.to_string(), seconds, description.to_string()));
        Ok(())
    }

    async fn issue_suggestions(&self, _limit: usize) -> Result<Vec<String>, IntegrationError> {
        Ok(Vec::new())
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never appeared", path.display());
}

async fn listening(client: &Arc<IpcClient>) {
    assert!(client.connect().await);
    let client = client.clone();
    tokio::spawn(async move { client.listen().await });
}

#[tokio::test]
async fn serve_answers_requests_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("knob.sock");
    let config_file = dir.path().join("config.toml");
    std::fs::write(
        &config_file,
        "openweathermap_api_key = \"abc123\"\nweather_location = \"Boston\"\n",
    )
    .unwrap();
    let log_file = dir.path().join("sync.log");
    std::fs::write(&log_file, "one\ntwo\nthree\n").unwrap();

    let shutdown = Shutdown::new();
    let daemon = tokio::spawn(serve(
        DaemonOptions {
            socket: socket.clone(),
            config_file,
            log_file,
        },
        Arc::new(UnpluggedKnob::default()),
        shutdown.clone(),
    ));
    wait_for_socket(&socket).await;

    let client = Arc::new(IpcClient::new(&socket));
    listening(&client).await;
    let timeout = Duration::from_secs(2);

    let Some(Message::StatusResult { status, .. }) =
        client.request(RequestKind::Status, timeout).await.unwrap()
    else {
        panic!("expected status_result");
    };
    assert!(!status.connected);
    assert!(status.weather_enabled);
    assert!(!status.calendar_enabled);

    let Some(Message::LogsResult { content, .. }) = client
        .request(RequestKind::Logs { lines: 2 }, timeout)
        .await
        .unwrap()
    else {
        panic!("expected logs_result");
    };
    assert_eq!(content, "two\nthree\n");

    let Some(Message::ReloadConfigResult { success, message, .. }) = client
        .request(RequestKind::ReloadConfig, timeout)
        .await
        .unwrap()
    else {
        panic!("expected reload_config_result");
    };
    assert!(success);
    assert!(message.contains("Weather enabled"), "{message}");

    let reply = client.request(RequestKind::Restart, timeout).await.unwrap();
    assert!(matches!(reply, Some(Message::RestartResult { success: true, .. })));

    let code = tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(code, RESTART_EXIT_CODE);
    assert!(!socket.exists());
}

fn handler_for(dir: &Path, inputs: Arc<InputBroker>) -> Arc<DaemonHandler> {
    Arc::new(DaemonHandler::new(
        Arc::new(StatusBoard::new()),
        Arc::new(IntegrationRegistry::fixed(IntegrationSet::default())),
        inputs,
        dir.join("sync.log"),
        Shutdown::new(),
    ))
}

#[tokio::test]
async fn unknown_and_malformed_lines_do_not_break_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("knob.sock");
    let server = Arc::new(IpcServer::new(&socket));
    let events: Arc<dyn EventSink> = server.clone();
    let inputs = Arc::new(InputBroker::new(events));
    server.start(handler_for(dir.path(), inputs)).await.unwrap();

    let stream = UnixStream::connect(&socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(b"not json\n{\"no_type\":1}\n{\"type\":\"bogus\",\"id\":\"7\"}\n{\"type\":\"status\",\"id\":\"8\"}\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["type"], "error");
    assert_eq!(first["id"], "7");
    assert_eq!(first["message"], "Unknown command: bogus");

    let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second["type"], "status_result");
    assert_eq!(second["id"], "8");
    assert_eq!(second["connected"], false);

    server.stop();
}

fn timer_rig(
    events: Arc<dyn EventSink>,
) -> (Workflows, Arc<InputBroker>, Arc<UnpluggedKnob>, Arc<JiraLog>) {
    let knob = Arc::new(UnpluggedKnob::default());
    let jira = Arc::new(JiraLog::default());
    let set = IntegrationSet {
        jira: Some(jira.clone()),
        ..IntegrationSet::default()
    };
    let inputs = Arc::new(InputBroker::new(events));
    let (inbox, _) = mpsc::unbounded_channel();
    let workflows = Workflows::new(
        knob.clone(),
        Arc::new(IntegrationRegistry::fixed(set)),
        inputs.clone(),
        inbox,
    );
    (workflows, inputs, knob, jira)
}

#[tokio::test]
async fn prompt_without_ui_is_declined_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(IpcServer::new(dir.path().join("knob.sock")));
    let (workflows, _, knob, jira) = timer_rig(server.clone());

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        workflows.timer_done("PROJ-1|25"),
    )
    .await
    .unwrap();
    assert_eq!(outcome, Err(Declined::NoAnswer));
    assert_eq!(*knob.sent.lock().unwrap(), vec!["JIRA_LOG_ERROR:No answer"]);
    assert!(jira.logged.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ui_answers_a_prompt_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("knob.sock");
    let server = Arc::new(IpcServer::new(&socket));
    let (workflows, inputs, knob, jira) = timer_rig(server.clone());
    server.start(handler_for(dir.path(), inputs)).await.unwrap();

    let client = Arc::new(IpcClient::new(&socket));
    let answering = client.clone();
    client.set_event_callback(move |message| {
        let Message::InputRequest(request) = message else {
            return;
        };
        assert_eq!(request.context["issue_key"], "PROJ-1");
        let mut data = Map::new();
        data.insert("description".into(), Value::from("Fixed the flaky test"));
        let reply = Message::InputResponse {
            id: request.id,
            cancelled: false,
            data,
        };
        let client = answering.clone();
        tokio::spawn(async move { client.send(&reply).await.unwrap() });
    });
    listening(&client).await;
    while !server.has_clients() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        workflows.timer_done("PROJ-1|25"),
    )
    .await
    .unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(
        *jira.logged.lock().unwrap(),
        vec![("PROJ-1".to_string(), 1500, "Fixed the flaky test".to_string())]
    );
    assert_eq!(*knob.sent.lock().unwrap(), vec!["JIRA_LOG_OK"]);

    server.stop();
}
