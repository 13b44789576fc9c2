//! Single ordered outbound channel per session (spec §4.14). `publish` is
//! the only write path; the bus itself serializes writes so that event
//! order observed at the subscriber equals the order of publication.
//! Disconnects do not buffer for reconnection — at-least-once within a live
//! connection, not exactly-once.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use elisa_wire::EngineEvent;

const CHANNEL_CAPACITY: usize = 2048;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publishing with no subscribers is not an error — a session may be
    /// created before its WebSocket client has connected.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a task that mirrors every event published on `bus` into
/// `log_path` as newline-delimited JSON. This sink never participates in
/// workspace pruning — `.elisa/logs/session-<id>.log` is append-only for
/// the lifetime of the workspace (spec §4.2, §6). The task exits once the
/// bus's last sender is dropped and the channel is empty.
pub fn spawn_session_log_sink(bus: &EventBus, log_path: PathBuf) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        if let Some(parent) = log_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;
        let Ok(mut file) = file else {
            tracing::warn!(path = %log_path.display(), "failed to open session log sink");
            return;
        };
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(mut line) = serde_json::to_vec(&event) {
                        line.push(b'\n');
                        if file.write_all(&line).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = file.flush().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_before_subscribe_is_not_an_error() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::new("s1", "task_started", json!({})));
    }

    #[tokio::test]
    async fn subscribers_observe_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::new("s1", "a", json!({})));
        bus.publish(EngineEvent::new("s1", "b", json!({})));
        assert_eq!(rx.recv().await.unwrap().kind, "a");
        assert_eq!(rx.recv().await.unwrap().kind, "b");
    }

    #[tokio::test]
    async fn session_log_sink_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(".elisa/logs/session-s1.log");
        let bus = EventBus::new();
        let handle = spawn_session_log_sink(&bus, log_path.clone());
        bus.publish(EngineEvent::new("s1", "task_started", json!({"task_id": "t1"})));
        drop(bus);
        let _ = handle.await;
        let content = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("task_started"));
    }
}
