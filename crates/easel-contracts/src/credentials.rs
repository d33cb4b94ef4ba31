use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// One opaque credential string per provider id, persisted as a flat JSON
/// object. Reads reload from disk so two handles on the same file see each
/// other's writes; flushes merge only the keys this handle changed, so a
/// concurrent writer's providers survive.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    entries: Option<IndexMap<String, String>>,
    dirty_providers: Vec<String>,
    removed_providers: Vec<String>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: None,
            dirty_providers: Vec::new(),
            removed_providers: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, provider: &str) -> Option<String> {
        self.reload();
        self.entries
            .as_ref()
            .and_then(|entries| entries.get(provider))
            .cloned()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn set(&mut self, provider: &str, credential: impl Into<String>) -> anyhow::Result<()> {
        self.reload();
        let entries = self.entries.get_or_insert_with(IndexMap::new);
        entries.insert(provider.to_string(), credential.into());
        if !self.dirty_providers.iter().any(|name| name == provider) {
            self.dirty_providers.push(provider.to_string());
        }
        self.removed_providers.retain(|name| name != provider);
        self.flush()
    }

    pub fn remove(&mut self, provider: &str) -> anyhow::Result<()> {
        self.reload();
        if let Some(entries) = self.entries.as_mut() {
            entries.shift_remove(provider);
        }
        self.dirty_providers.retain(|name| name != provider);
        if !self.removed_providers.iter().any(|name| name == provider) {
            self.removed_providers.push(provider.to_string());
        }
        self.flush()
    }

    pub fn providers(&mut self) -> Vec<String> {
        self.reload();
        self.entries
            .as_ref()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn reload(&mut self) {
        let mut on_disk = read_entries(&self.path);
        if let Some(entries) = &self.entries {
            for provider in &self.dirty_providers {
                if let Some(value) = entries.get(provider) {
                    on_disk.insert(provider.clone(), value.clone());
                }
            }
        }
        for provider in &self.removed_providers {
            on_disk.shift_remove(provider);
        }
        self.entries = Some(on_disk);
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        let mut on_disk = read_entries(&self.path);
        if let Some(entries) = &self.entries {
            for provider in &self.dirty_providers {
                if let Some(value) = entries.get(provider) {
                    on_disk.insert(provider.clone(), value.clone());
                }
            }
        }
        for provider in &self.removed_providers {
            on_disk.shift_remove(provider);
        }

        let mut payload = Map::new();
        for (provider, value) in &on_disk {
            payload.insert(provider.clone(), Value::String(value.clone()));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(payload))?,
        )?;
        self.entries = Some(on_disk);
        Ok(())
    }
}

/// Short digest prefix safe to put in logs instead of the credential itself.
pub fn credential_fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

fn read_entries(path: &Path) -> IndexMap<String, String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return IndexMap::new();
    };
    let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
        return IndexMap::new();
    };
    let mut entries = IndexMap::new();
    if let Some(obj) = parsed.as_object() {
        for (provider, value) in obj {
            if let Some(text) = value.as_str() {
                entries.insert(provider.clone(), text.to_string());
            }
        }
    }
    entries
}
