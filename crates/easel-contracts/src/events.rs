use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL log for one batch session.
///
/// Every line is a compact JSON object carrying `type`, `batch_id` and `ts`
/// defaults; the caller payload is merged last and may override them. The
/// handle is cheap to clone and safe to share between the worker thread and
/// the control thread.
#[derive(Debug, Clone)]
pub struct EventLog {
    shared: Arc<LogShared>,
}

#[derive(Debug)]
struct LogShared {
    path: PathBuf,
    batch_id: String,
    append: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(LogShared {
                path: path.into(),
                batch_id: batch_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn batch_id(&self) -> &str {
        &self.shared.batch_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "batch_id".to_string(),
            Value::String(self.shared.batch_id.clone()),
        );
        event.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.shared.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .shared
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}
