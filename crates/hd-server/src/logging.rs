use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error};

use hd_resolver::{SOURCE_BLOCKED, SOURCE_UPSTREAM_CACHE};

#[derive(Serialize)]
struct QueryLogEntry<'a> {
    ts: String,
    #[serde(rename = "type")]
    query_type: &'a str,
    domain: &'a str,
    from: &'a str,
    transport: &'a str,
    source: &'a str,
    blocked: bool,
    cached: bool,
    ms: u64,
}

/// Async JSONL query logger backed by a background writer task, so the
/// serving path never blocks on file I/O.
pub struct QueryLogger {
    sender: mpsc::UnboundedSender<String>,
}

impl QueryLogger {
    pub fn new(path: &str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let path = PathBuf::from(path);

        tokio::spawn(async move {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }

            let mut file = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(err) => {
                    error!("failed to open query log {}: {}", path.display(), err);
                    return;
                }
            };

            while let Some(line) = receiver.recv().await {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    error!("failed to write query log: {}", err);
                }
            }
        });

        Self { sender }
    }

    pub fn log(
        &self,
        domain: &str,
        query_type: &str,
        source_ip: &str,
        transport: &str,
        source: &str,
        elapsed_ms: u64,
    ) {
        let entry = QueryLogEntry {
            ts: Utc::now().to_rfc3339(),
            query_type,
            domain,
            from: source_ip,
            transport,
            source,
            blocked: source == SOURCE_BLOCKED,
            cached: source == SOURCE_UPSTREAM_CACHE,
            ms: elapsed_ms,
        };

        match serde_json::to_string(&entry) {
            Ok(json) => {
                if self.sender.send(format!("{}\n", json)).is_err() {
                    debug!("query log channel closed");
                }
            }
            Err(err) => {
                debug!("failed to serialize query log entry: {}", err);
            }
        }
    }
}
