//! Conversation history.
//!
//! Transcript fragments are appended as they stream in. A fragment from the
//! same role as the last message, arriving within the merge window, extends
//! that message instead of starting a new one.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default maximum number of messages kept.
pub const DEFAULT_HISTORY_CAP: usize = 50;

/// Default window for merging same-role fragments.
pub const DEFAULT_MERGE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Time of the latest fragment merged into this message
    pub timestamp: DateTime<Utc>,
}

/// Errors reading or writing the history file.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to access history file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse history file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Bounded, ordered message list with the merge rule.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: VecDeque<Message>,
    cap: usize,
    merge_window: Duration,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP, DEFAULT_MERGE_WINDOW)
    }
}

impl ConversationHistory {
    pub fn new(cap: usize, merge_window: Duration) -> Self {
        Self {
            messages: VecDeque::new(),
            cap: cap.max(1),
            merge_window,
        }
    }

    /// Append a fragment stamped now.
    pub fn append(&mut self, role: Role, content: &str) {
        self.append_at(role, content, Utc::now());
    }

    /// Append a fragment with an explicit timestamp.
    pub fn append_at(&mut self, role: Role, content: &str, at: DateTime<Utc>) {
        if content.is_empty() {
            return;
        }

        if let Some(last) = self.messages.back_mut() {
            let within_window = at
                .signed_duration_since(last.timestamp)
                .to_std()
                .map(|elapsed| elapsed < self.merge_window)
                // Clock went backwards; treat as immediate
                .unwrap_or(true);
            if last.role == role && within_window {
                last.content.push_str(content);
                last.timestamp = at;
                return;
            }
        }

        self.messages.push_back(Message {
            role,
            content: content.to_string(),
            timestamp: at,
        });
        while self.messages.len() > self.cap {
            self.messages.pop_front();
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Load a saved history. A missing file yields an empty history.
    pub fn load(path: &Path, cap: usize, merge_window: Duration) -> Result<Self, HistoryError> {
        let mut history = Self::new(cap, merge_window);
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(history),
            Err(source) => {
                return Err(HistoryError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let messages: Vec<Message> =
            serde_json::from_str(&contents).map_err(|source| HistoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let skip = messages.len().saturating_sub(history.cap);
        history.messages = messages.into_iter().skip(skip).collect();
        Ok(history)
    }

    /// Write the history as a JSON array.
    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        let json = serde_json::to_string_pretty(&self.messages).map_err(|source| {
            HistoryError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, json).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Remove a saved history file if present.
    pub fn delete_file(path: &Path) -> Result<(), HistoryError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HistoryError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-10-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_consecutive_same_role_deltas_merge() {
        let mut history = ConversationHistory::default();
        history.append_at(Role::Assistant, "Hello", t0());
        history.append_at(Role::Assistant, " there", t0() + TimeDelta::seconds(2));

        assert_eq!(history.len(), 1);
        let last = history.last().unwrap();
        assert_eq!(last.content, "Hello there");
        assert_eq!(last.timestamp, t0() + TimeDelta::seconds(2));
    }

    #[test]
    fn test_other_role_between_splits() {
        let mut history = ConversationHistory::default();
        history.append_at(Role::Assistant, "Hi", t0());
        history.append_at(Role::User, "What is two plus two?", t0() + TimeDelta::seconds(1));
        history.append_at(Role::Assistant, "Four!", t0() + TimeDelta::seconds(2));

        let roles: Vec<Role> = history.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::User, Role::Assistant]);
    }

    #[test]
    fn test_outside_window_starts_new_message() {
        let mut history = ConversationHistory::default();
        history.append_at(Role::User, "one", t0());
        history.append_at(Role::User, "two", t0() + TimeDelta::seconds(10));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_window_slides_with_each_merge() {
        let mut history = ConversationHistory::default();
        for i in 0..5 {
            history.append_at(Role::Assistant, "x", t0() + TimeDelta::seconds(8 * i));
        }
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().content, "xxxxx");
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut history = ConversationHistory::new(3, DEFAULT_MERGE_WINDOW);
        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            history.append_at(role, &i.to_string(), t0() + TimeDelta::seconds(i));
        }
        let contents: Vec<String> = history.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_empty_fragment_ignored() {
        let mut history = ConversationHistory::default();
        history.append_at(Role::User, "", t0());
        assert!(history.is_empty());
    }

    #[test]
    fn test_save_load_and_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.json");

        let mut history = ConversationHistory::default();
        history.append_at(Role::User, "Hi Learnie", t0());
        history.append_at(Role::Assistant, "Hello!", t0() + TimeDelta::seconds(1));
        history.save(&path).unwrap();

        let loaded = ConversationHistory::load(&path, 50, DEFAULT_MERGE_WINDOW).unwrap();
        assert_eq!(loaded.messages(), history.messages());

        let truncated = ConversationHistory::load(&path, 1, DEFAULT_MERGE_WINDOW).unwrap();
        assert_eq!(truncated.messages()[0].content, "Hello!");

        ConversationHistory::delete_file(&path).unwrap();
        ConversationHistory::delete_file(&path).unwrap();
        assert!(ConversationHistory::load(&path, 50, DEFAULT_MERGE_WINDOW)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ConversationHistory::load(&path, 50, DEFAULT_MERGE_WINDOW),
            Err(HistoryError::Parse { .. })
        ));
    }
}
