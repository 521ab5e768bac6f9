use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::channel::{DeviceChannel, PortProvider};
use super::Device;

enum DeviceOp {
    Discover {
        responder: oneshot::Sender<Option<String>>,
    },
    Connect {
        port: String,
        responder: oneshot::Sender<bool>,
    },
    Disconnect {
        responder: oneshot::Sender<()>,
    },
    Command {
        command: String,
        responder: oneshot::Sender<Vec<String>>,
    },
    Ack {
        responder: oneshot::Sender<()>,
    },
    ReadLine {
        timeout: Duration,
        responder: oneshot::Sender<Option<String>>,
    },
    State {
        responder: oneshot::Sender<(bool, Option<String>)>,
    },
}

/// Cloneable handle to the thread that owns the serial port.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: mpsc::UnboundedSender<DeviceOp>,
}

/// Move `channel` onto its own thread. The thread exits, closing the port,
/// once every handle is dropped.
pub fn spawn_device_actor<P>(channel: DeviceChannel<P>) -> io::Result<DeviceHandle>
where
    P: PortProvider + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("focusknob-serial".into())
        .spawn(move || run(channel, rx))?;
    Ok(DeviceHandle { tx })
}

fn run<P: PortProvider>(mut channel: DeviceChannel<P>, mut rx: mpsc::UnboundedReceiver<DeviceOp>) {
    while let Some(op) = rx.blocking_recv() {
        // A dropped responder only means the caller stopped waiting.
        match op {
            DeviceOp::Discover { responder } => {
                let _ = responder.send(channel.discover());
            }
            DeviceOp::Connect { port, responder } => {
                let _ = responder.send(channel.connect(&port));
            }
            DeviceOp::Disconnect { responder } => {
                channel.disconnect();
                let _ = responder.send(());
            }
            DeviceOp::Command { command, responder } => {
                let _ = responder.send(channel.send_command(&command));
            }
            DeviceOp::Ack { responder } => {
                channel.send_ack();
                let _ = responder.send(());
            }
            DeviceOp::ReadLine { timeout, responder } => {
                let _ = responder.send(channel.read_line(timeout));
            }
            DeviceOp::State { responder } => {
                let state = (channel.is_connected(), channel.port().map(str::to_string));
                let _ = responder.send(state);
            }
        }
    }
    channel.disconnect();
    debug!("Serial actor stopped");
}

impl DeviceHandle {
    async fn call<R>(&self, op: impl FnOnce(oneshot::Sender<R>) -> DeviceOp) -> Option<R> {
        let (responder, rx) = oneshot::channel();
        if self.tx.send(op(responder)).is_err() {
            debug!("Serial actor is gone");
            return None;
        }
        rx.await.ok()
    }
}

#[async_trait]
impl Device for DeviceHandle {
    async fn discover(&self) -> Option<String> {
        self.call(|responder| DeviceOp::Discover { responder })
            .await
            .flatten()
    }

    async fn connect(&self, port: &str) -> bool {
        let port = port.to_string();
        self.call(|responder| DeviceOp::Connect { port, responder })
            .await
            .unwrap_or(false)
    }

    async fn disconnect(&self) {
        self.call(|responder| DeviceOp::Disconnect { responder })
            .await;
    }

    async fn send_command(&self, command: &str) -> Vec<String> {
        let command = command.to_string();
        self.call(|responder| DeviceOp::Command { command, responder })
            .await
            .unwrap_or_default()
    }

    async fn send_ack(&self) {
        self.call(|responder| DeviceOp::Ack { responder }).await;
    }

    async fn read_line(&self, timeout: Duration) -> Option<String> {
        self.call(|responder| DeviceOp::ReadLine { timeout, responder })
            .await
            .flatten()
    }

    async fn is_connected(&self) -> bool {
        self.call(|responder| DeviceOp::State { responder })
            .await
            .is_some_and(|(connected, _)| connected)
    }

    async fn port(&self) -> Option<String> {
        self.call(|responder| DeviceOp::State { responder })
            .await
            .and_then(|(_, port)| port)
    }
}
