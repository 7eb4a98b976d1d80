//! Filesystem history store: one JSONL file per instance under a root
//! directory. Each line is one serialized [`HistoryEvent`]; appends are
//! single `O_APPEND` writes, so a crash can lose at most the batch being
//! written, never corrupt earlier lines.
//!
//! Corruption policy: a torn final line is a crash artifact of an unacked
//! append and is discarded; an unreadable record anywhere else is data
//! corruption and permanently blocks further appends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{now_ms, EventKind, HistoryEvent};

use super::{check_appendable, HistoryStore, StoreError};

pub struct FsHistoryStore {
    root: PathBuf,
    // Serializes appends; reads go straight to the file.
    write_lock: Mutex<()>,
}

struct LoadedHistory {
    events: Vec<HistoryEvent>,
    torn_tail: bool,
    corrupt: Option<StoreError>,
}

impl FsHistoryStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    /// With `reset_on_open`, any existing histories are removed first.
    pub fn new(root: impl AsRef<Path>, reset_on_open: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        if reset_on_open {
            let _ = std::fs::remove_dir_all(&root);
        }
        let _ = std::fs::create_dir_all(&root);
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    fn instance_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{instance}.jsonl"))
    }

    async fn load(&self, instance: &str) -> LoadedHistory {
        let path = self.instance_path(instance);
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return LoadedHistory {
                events: Vec::new(),
                torn_tail: false,
                corrupt: None,
            };
        };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::new();
        let mut torn_tail = false;
        let mut corrupt = None;
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<HistoryEvent>(line) {
                Ok(e) => events.push(e),
                Err(err) => {
                    if idx + 1 == lines.len() {
                        torn_tail = true;
                    } else {
                        corrupt = Some(StoreError::permanent(
                            "read",
                            format!("corrupt history record at line {}: {err}", idx + 1),
                        ));
                    }
                    break;
                }
            }
        }
        LoadedHistory {
            events,
            torn_tail,
            corrupt,
        }
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    /// Reads stop at the first unreadable record, returning the consistent
    /// prefix; appends to such a log fail permanently.
    async fn read(&self, instance: &str) -> Vec<HistoryEvent> {
        let loaded = self.load(instance).await;
        if let Some(err) = &loaded.corrupt {
            tracing::warn!(instance, error = %err, "history truncated at corrupt record");
        }
        if loaded.torn_tail {
            tracing::warn!(instance, "ignoring torn final history line");
        }
        loaded.events
    }

    async fn append(
        &self,
        instance: &str,
        events: Vec<EventKind>,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.instance_path(instance);
        if !path.exists() {
            return Err(StoreError::permanent(
                "append",
                format!("unknown instance '{instance}'"),
            ));
        }
        let loaded = self.load(instance).await;
        if let Some(err) = loaded.corrupt {
            return Err(err);
        }
        check_appendable(&loaded.events, &events)?;

        let mut next_seq = loaded.events.last().map(|e| e.seq + 1).unwrap_or(1);
        let ts_ms = now_ms();
        let mut appended = Vec::with_capacity(events.len());
        let mut buf = String::new();
        for kind in events {
            let e = HistoryEvent {
                seq: next_seq,
                ts_ms,
                kind,
            };
            next_seq += 1;
            let line = serde_json::to_string(&e)
                .map_err(|err| StoreError::permanent("append", err.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
            appended.push(e);
        }

        if loaded.torn_tail {
            // Rewrite the log without the torn line so it cannot merge with
            // the new batch.
            tracing::warn!(instance, "discarding torn final history line");
            let mut content = String::with_capacity(buf.len());
            for e in &loaded.events {
                let line = serde_json::to_string(e)
                    .map_err(|err| StoreError::permanent("append", err.to_string()))?;
                content.push_str(&line);
                content.push('\n');
            }
            content.push_str(&buf);
            tokio::fs::write(&path, content)
                .await
                .map_err(|err| StoreError::retryable("append", err.to_string()))?;
        } else {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await
                .map_err(|err| StoreError::retryable("append", err.to_string()))?;
            file.write_all(buf.as_bytes())
                .await
                .map_err(|err| StoreError::retryable("append", err.to_string()))?;
            file.flush()
                .await
                .map_err(|err| StoreError::retryable("append", err.to_string()))?;
        }
        Ok(appended)
    }

    async fn create_instance(&self, instance: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.instance_path(instance);
        if path.exists() {
            return Ok(false);
        }
        tokio::fs::File::create(&path)
            .await
            .map_err(|err| StoreError::retryable("create_instance", err.to_string()))?;
        Ok(true)
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.root).await else {
            return out;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                out.push(stem.to_string());
            }
        }
        out
    }

    async fn reset(&self) {
        let _guard = self.write_lock.lock().await;
        let _ = tokio::fs::remove_dir_all(&self.root).await;
        let _ = tokio::fs::create_dir_all(&self.root).await;
    }
}
