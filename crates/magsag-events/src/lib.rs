use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use magsag_protocol::{EventSink, GateError, GateEvent, GateResult};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

/// Append-only JSONL audit log, one event per line.
#[derive(Debug)]
pub struct JsonlEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(path: &Path) -> GateResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|error| {
                GateError::Io(format!("failed to create journal dir {parent:?}: {error}"))
            })?;
        }
        Ok(())
    }

    #[instrument(skip(self, event), fields(event = event.name(), event_id = %event.event_id))]
    pub async fn append(&self, event: &GateEvent) -> GateResult<()> {
        let line = serde_json::to_string(event)?;
        let _guard = self.write_lock.lock().await;
        Self::ensure_parent(&self.path).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| {
                GateError::Io(format!("failed opening journal {:?}: {error}", self.path))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!("event appended to journal");
        Ok(())
    }

    /// Read every event back, skipping blank lines.
    pub async fn read_all(&self) -> GateResult<Vec<GateEvent>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: GateEvent = serde_json::from_str(&line).map_err(|error| {
                GateError::Serialization(format!(
                    "failed parsing event line in {:?}: {error}",
                    self.path
                ))
            })?;
            out.push(event);
        }
        Ok(out)
    }
}

#[derive(Clone, Debug)]
pub struct EventHub {
    sender: broadcast::Sender<GateEvent>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: GateEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<GateEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

#[async_trait]
impl EventSink for EventHub {
    async fn emit(&self, event: &GateEvent) -> GateResult<()> {
        self.publish(event.clone());
        Ok(())
    }
}

/// Durable log (when configured) followed by live fan-out.
#[derive(Clone)]
pub struct EventJournal {
    log: Option<Arc<JsonlEventLog>>,
    hub: EventHub,
}

impl EventJournal {
    pub fn new(log: Option<Arc<JsonlEventLog>>, hub: EventHub) -> Self {
        Self { log, hub }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.hub.subscribe()
    }
}

#[async_trait]
impl EventSink for EventJournal {
    async fn emit(&self, event: &GateEvent) -> GateResult<()> {
        // a journal failure must not hide the event from live subscribers
        let logged = match &self.log {
            Some(log) => log.append(event).await,
            None => Ok(()),
        };
        if let Err(error) = &logged {
            warn!(%error, event = event.name(), "failed to journal event");
        }
        self.hub.publish(event.clone());
        logged
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use futures_util::StreamExt;
    use magsag_protocol::{GateEventKind, RunId, TicketId, TicketStatus};
    use tokio::fs;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn updated(status: TicketStatus) -> GateEvent {
        GateEvent::new(GateEventKind::ApprovalUpdated {
            ticket_id: TicketId::new_uuid(),
            run_id: RunId::from_string("run-1"),
            tool_name: "delete_file".to_owned(),
            status,
            resolved_by: None,
            note: None,
        })
    }

    #[tokio::test]
    async fn jsonl_log_appends_and_reads_back_in_order() -> Result<()> {
        let root = unique_test_root("magsag-events");
        let log = JsonlEventLog::new(root.join("audit").join("events.jsonl"));

        let first = updated(TicketStatus::Approved);
        let second = updated(TicketStatus::Expired);
        log.append(&first).await?;
        log.append(&second).await?;

        let events = log.read_all().await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, first.event_id);
        assert_eq!(events[1].event_id, second.event_id);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() -> Result<()> {
        let log = JsonlEventLog::new(unique_test_root("magsag-events-missing").join("none.jsonl"));
        assert!(log.read_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_appends_keep_lines_intact() -> Result<()> {
        let root = unique_test_root("magsag-events-concurrent");
        let log = Arc::new(JsonlEventLog::new(root.join("events.jsonl")));

        let writers = (0..16).map(|_| {
            let log = log.clone();
            tokio::spawn(async move { log.append(&updated(TicketStatus::Denied)).await })
        });
        for outcome in futures_util::future::join_all(writers).await {
            outcome??;
        }
        assert_eq!(log.read_all().await?.len(), 16);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn journal_logs_then_publishes() -> Result<()> {
        let root = unique_test_root("magsag-events-journal");
        let log = Arc::new(JsonlEventLog::new(root.join("events.jsonl")));
        let journal = EventJournal::new(Some(log.clone()), EventHub::new(16));
        let mut stream = journal.hub().subscribe_stream();

        let event = updated(TicketStatus::Approved);
        journal.emit(&event).await?;

        let received = stream.next().await.expect("stream open")?;
        assert_eq!(received.event_id, event.event_id);
        assert_eq!(log.read_all().await?.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
