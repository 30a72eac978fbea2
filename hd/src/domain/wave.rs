//! Waves - batches of runs launched together
//!
//! Waves are closed: the next wave for a list is only emitted once every run
//! in the current wave has reached a terminal status.

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    #[default]
    Open,
    Closed,
    /// Closed early by a pause or degradation signal
    Truncated,
}

impl std::fmt::Display for WaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Truncated => "truncated",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub id: String,
    pub list_id: String,
    /// 1-based position within the list's wave history
    pub sequence_no: u32,
    pub task_ids: Vec<String>,
    pub status: WaveStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub updated_at: i64,
}

impl Wave {
    pub fn new(list_id: impl Into<String>, sequence_no: u32, task_ids: Vec<String>) -> Self {
        let list_id = list_id.into();
        let now = now_ms();
        Self {
            id: generate_id("wave", &format!("{list_id}-{sequence_no}")),
            list_id,
            sequence_no,
            task_ids,
            status: WaveStatus::Open,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn close(&mut self, truncated: bool) {
        let now = now_ms();
        self.status = if truncated { WaveStatus::Truncated } else { WaveStatus::Closed };
        self.ended_at = Some(now);
        self.updated_at = now;
    }
}

impl Record for Wave {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "waves"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("list".to_string(), IndexValue::String(self.list_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("sequence".to_string(), IndexValue::Integer(self.sequence_no as i64));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wave_lifecycle() {
        let mut wave = Wave::new("list-1", 1, vec!["task-a".to_string()]);
        assert_eq!(wave.status, WaveStatus::Open);
        assert!(wave.ended_at.is_none());

        wave.close(false);
        assert_eq!(wave.status, WaveStatus::Closed);
        assert!(wave.ended_at.is_some());
    }

    #[test]
    fn test_wave_truncation() {
        let mut wave = Wave::new("list-1", 2, vec![]);
        wave.close(true);
        assert_eq!(wave.status, WaveStatus::Truncated);
    }
}
