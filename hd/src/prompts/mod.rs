//! Agent context packs and prompt templates

pub mod embedded;
pub mod loader;

pub use loader::PromptLoader;

use serde::{Deserialize, Serialize};

use crate::domain::Task;

/// Everything an agent worker needs to start: the task record, ranked
/// knowledge, and retry hints. Written as JSON into the run's worktree and
/// rendered into the opening prompt by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub affected_files: Vec<String>,
    pub codebase_tests: Vec<String>,
    pub api_tests: Vec<String>,
    pub ui_tests: Vec<String>,
    pub attempt_no: u32,
    /// Rendered knowledge summary, empty when nothing is relevant
    pub knowledge: String,
    /// Present from attempt 2 on: what went wrong last time
    pub retry_hint: Option<String>,
}

impl ContextPack {
    pub fn build(task: &Task, attempt_no: u32, knowledge: &str) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            affected_files: task.affected_files.clone(),
            codebase_tests: task.codebase_tests.clone(),
            api_tests: task.api_tests.clone(),
            ui_tests: task.ui_tests.clone(),
            attempt_no,
            knowledge: knowledge.to_string(),
            retry_hint: None,
        }
    }

    pub fn with_retry_hint(mut self, hint: impl Into<String>) -> Self {
        self.retry_hint = Some(hint.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }

    /// Render the opening prompt through the loader
    pub fn render(&self, loader: &PromptLoader) -> eyre::Result<String> {
        loader.render("agent_context", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskCategory;

    #[test]
    fn test_pack_roundtrip_and_render() {
        let task = Task::new(TaskCategory::Feature, "Add search")
            .with_description("Implement the /search endpoint")
            .with_criteria(vec!["query returns ranked hits".to_string()])
            .with_codebase_tests(vec!["cargo check".to_string()]);

        let pack = ContextPack::build(&task, 1, "").to_json();
        let parsed = ContextPack::from_json(&pack).unwrap();
        assert_eq!(parsed.title, "Add search");
        assert_eq!(parsed.codebase_tests, vec!["cargo check".to_string()]);

        let loader = PromptLoader::new().unwrap();
        let prompt = parsed.render(&loader).unwrap();
        assert!(prompt.contains("Add search"));
        assert!(prompt.contains("ranked hits"));
    }
}
