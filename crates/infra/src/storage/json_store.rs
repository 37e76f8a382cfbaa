//! Preset store persisted as one JSON object file
//!
//! Keys map to top-level fields of the object. Writes go to a sibling temp
//! file which is then renamed over the original, so a crash mid-write never
//! leaves a truncated store behind.

use async_trait::async_trait;
use ethereal_core::domain::preset::{PresetStore, StoreError};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct JsonFilePresetStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl JsonFilePresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_object(&self) -> Result<Map<String, Value>, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Backend(format!(
                "expected a JSON object in {}, found {}",
                self.path.display(),
                json_kind(&other)
            ))),
        }
    }

    async fn write_object(&self, map: Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(&Value::Object(map))?;
        let tmp = self.temp_path();
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl PresetStore for JsonFilePresetStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut map = self.read_object().await?;
        Ok(map.remove(key))
    }

    async fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut map = match self.read_object().await {
            Ok(map) => map,
            Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
            Err(e) => {
                // Keep the unreadable file for inspection and start over
                let backup = self.corrupt_path();
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Preset store unreadable, starting fresh"
                );
                fs::rename(&self.path, &backup).await?;
                Map::new()
            }
        };
        map.insert(key.to_string(), value);
        self.write_object(map).await?;
        debug!(key, path = %self.path.display(), "Preset store saved");
        Ok(())
    }
}
