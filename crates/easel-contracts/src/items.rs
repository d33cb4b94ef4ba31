use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::names::derive_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Ok,
    Fail,
}

/// One tracked prompt: source text, the filename assigned at batch build,
/// and the outcome of its most recent generation attempt.
///
/// `image_data` and `error` are mutually exclusive and both absent while
/// the item is pending; all mutation goes through `mark_ok`, `mark_fail`
/// and `reset_pending` so that stays true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptItem {
    pub prompt: String,
    pub name: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PromptItem {
    pub fn new(prompt: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            name: name.into(),
            status: ItemStatus::Pending,
            image_data: None,
            error: None,
        }
    }

    pub fn mark_ok(&mut self, bytes: Vec<u8>) {
        self.status = ItemStatus::Ok;
        self.image_data = Some(bytes);
        self.error = None;
    }

    pub fn mark_fail(&mut self, message: impl Into<String>) {
        self.status = ItemStatus::Fail;
        self.image_data = None;
        self.error = Some(message.into());
    }

    pub fn reset_pending(&mut self) {
        self.status = ItemStatus::Pending;
        self.image_data = None;
        self.error = None;
    }
}

/// Splits raw prompt text into the ordered list of non-blank, trimmed lines
/// that becomes the batch.
pub fn split_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// In-memory state for one generation session. Not persisted; rebuilt from
/// the prompt text between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueState {
    pub items: Vec<PromptItem>,
    pub cursor: usize,
    pub running: bool,
    pub paused: bool,
    pub active_provider: String,
}

impl QueueState {
    pub fn new(active_provider: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            cursor: 0,
            running: false,
            paused: false,
            active_provider: active_provider.into(),
        }
    }

    /// Rebuilds the batch from prompt text: one pending item per non-blank
    /// line, names derived up front, cursor back to zero. Rejected while a
    /// run is in progress (input edits are ignored mid-run).
    pub fn rebuild(&mut self, text: &str) -> bool {
        if self.running {
            return false;
        }
        let mut taken: HashSet<String> = HashSet::new();
        let mut items = Vec::new();
        for prompt in split_prompts(text) {
            let name = derive_name(&prompt, &taken);
            taken.insert(name.clone());
            items.push(PromptItem::new(prompt, name));
        }
        self.items = items;
        self.cursor = 0;
        self.paused = false;
        true
    }

    /// Stop keeps items and cursor so partial results stay visible.
    pub fn stop(&mut self) {
        self.running = false;
        self.paused = false;
    }

    /// Clear is the only full reset.
    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = 0;
        self.running = false;
        self.paused = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.items.len()
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Ok)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Fail)
            .count()
    }
}
