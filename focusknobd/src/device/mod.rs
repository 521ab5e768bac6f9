//! The knob on the other end of the serial line.

mod actor;
pub mod channel;

use std::time::Duration;

use async_trait::async_trait;

pub use actor::{spawn_device_actor, DeviceHandle};
pub use channel::{ChannelTiming, DeviceChannel, PortProvider, SerialLink, SystemPorts};

/// Async view of the device used by the sync loop and the workflows.
/// Calls are serialized: a command and its response are never interleaved
/// with another caller's traffic.
#[async_trait]
pub trait Device: Send + Sync {
    async fn discover(&self) -> Option<String>;
    async fn connect(&self, port: &str) -> bool;
    async fn disconnect(&self);
    /// Response lines, or nothing when the device did not answer or the
    /// link failed (check [`Device::is_connected`] to tell them apart).
    async fn send_command(&self, command: &str) -> Vec<String>;
    async fn send_ack(&self);
    async fn read_line(&self, timeout: Duration) -> Option<String>;
    async fn is_connected(&self) -> bool;
    async fn port(&self) -> Option<String>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`Device`] for workflow and sync-loop tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers `PING` with `PONG` while `pong` is set and replies to other
    /// commands from `replies`, keyed by the text before the first `:`.
    pub struct FakeDevice {
        pub port: String,
        pub available: AtomicBool,
        pub pong: AtomicBool,
        pub connected: AtomicBool,
        pub connects: AtomicUsize,
        pub acks: AtomicUsize,
        pub sent: Mutex<Vec<String>>,
        pub replies: Mutex<HashMap<String, Vec<String>>>,
        pub unsolicited: Mutex<Vec<String>>,
    }

    impl FakeDevice {
        pub fn new(port: &str) -> Self {
            Self {
                port: port.to_string(),
                available: AtomicBool::new(true),
                pong: AtomicBool::new(true),
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                acks: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                replies: Mutex::new(HashMap::new()),
                unsolicited: Mutex::new(Vec::new()),
            }
        }

        pub fn reply(&self, command: &str, lines: &[&str]) {
            self.replies.lock().unwrap().insert(
                command.to_string(),
                lines.iter().map(|l| l.to_string()).collect(),
            );
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Device for FakeDevice {
        async fn discover(&self) -> Option<String> {
            self.available
                .load(Ordering::SeqCst)
                .then(|| self.port.clone())
        }

        async fn connect(&self, port: &str) -> bool {
            let ok = port == self.port && self.available.load(Ordering::SeqCst);
            if ok {
                self.connected.store(true, Ordering::SeqCst);
                self.connects.fetch_add(1, Ordering::SeqCst);
            }
            ok
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn send_command(&self, command: &str) -> Vec<String> {
            if !self.connected.load(Ordering::SeqCst) {
                return Vec::new();
            }
            self.sent.lock().unwrap().push(command.to_string());
            if command == channel::PING {
                return if self.pong.load(Ordering::SeqCst) {
                    vec![channel::PONG.to_string()]
                } else {
                    Vec::new()
                };
            }
            let key = command.split(':').next().unwrap_or(command);
            self.replies
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or_default()
        }

        async fn send_ack(&self) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        async fn read_line(&self, _timeout: Duration) -> Option<String> {
            let mut queue = self.unsolicited.lock().unwrap();
            (!queue.is_empty()).then(|| queue.remove(0))
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn port(&self) -> Option<String> {
            self.is_connected().await.then(|| self.port.clone())
        }
    }
}
