use crate::error::Result;
use crate::types::{Entry, Role};
use std::path::Path;

/// Ordered, append-only conversation log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageLog {
    entries: Vec<Entry>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the log with one system entry when a non-blank prompt is given.
    pub fn with_system_prompt(prompt: Option<&str>) -> Self {
        let mut log = Self::new();
        if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
            log.push(Entry::system(prompt));
        }
        log
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = Entry>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Content of the most recent assistant entry that carries text.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.role == Role::Assistant && !entry.issues_tool_calls())
            .map(|entry| entry.content.as_str())
    }

    pub fn has_tool_result(&self, tool_call_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.is_tool_result_for(tool_call_id))
    }

    /// The most recent `max_entries` non-system entries, with the start moved
    /// forward to a user entry. Leading system entries are always kept.
    ///
    /// If no user entry lies inside the window the start moves back to the
    /// nearest earlier user entry instead, so a long tool loop is never cut
    /// off from the request that started it.
    pub fn context_window(&self, max_entries: usize) -> Vec<Entry> {
        let system_len = self
            .entries
            .iter()
            .take_while(|entry| entry.role == Role::System)
            .count();
        let (system, rest) = self.entries.split_at(system_len);

        if rest.len() <= max_entries {
            return self.entries.clone();
        }

        let target = rest.len() - max_entries;
        let keep_start = rest[target..]
            .iter()
            .position(|entry| entry.role == Role::User)
            .map(|offset| target + offset)
            .or_else(|| rest[..target].iter().rposition(|entry| entry.role == Role::User))
            .unwrap_or(0);

        let mut window = Vec::with_capacity(system_len + rest.len() - keep_start);
        window.extend_from_slice(system);
        window.extend_from_slice(&rest[keep_start..]);
        window
    }

    /// Writes the entries as a pretty JSON array, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<Entry> = serde_json::from_str(&raw)?;
        Ok(Self { entries })
    }
}

impl From<Vec<Entry>> for MessageLog {
    fn from(entries: Vec<Entry>) -> Self {
        Self { entries }
    }
}
