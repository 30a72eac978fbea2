//! Knowledge base - cross-agent facts, decisions, patterns, warnings
//!
//! Write path deduplicates by content similarity; duplicates strengthen the
//! existing item instead of multiplying it. Read path ranks live items by
//! relevance to a task's affected files and renders a bounded context
//! summary for prompt injection.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{Filter, KnowledgeItem, KnowledgeKind, Task};
use crate::events::{BusEvent, EventBus};
use crate::state::StateResult;

/// How a submission landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored as a new item
    Added { id: String },
    /// Merged into an existing near-duplicate
    Absorbed { existing_id: String },
}

#[derive(Clone)]
pub struct KnowledgeBase {
    bus: Arc<EventBus>,
    /// Jaccard similarity at or above this is a duplicate
    similarity_threshold: f64,
    /// Bound on items injected into one prompt
    max_items_per_prompt: usize,
}

impl KnowledgeBase {
    pub fn new(bus: Arc<EventBus>, similarity_threshold: f64, max_items_per_prompt: usize) -> Self {
        Self {
            bus,
            similarity_threshold,
            max_items_per_prompt,
        }
    }

    /// Submit an item. Near-duplicates of a live item of the same kind are
    /// absorbed into it.
    pub async fn add(&self, item: KnowledgeItem) -> StateResult<AddOutcome> {
        let live = self.live_items().await?;

        for existing in &live {
            if existing.kind == item.kind
                && similarity(&existing.content, &item.content) >= self.similarity_threshold
            {
                let mut merged = existing.clone();
                merged.absorb_duplicate(item.confidence);
                self.bus.state().update_knowledge(merged).await?;
                debug!(existing = %existing.id, "Absorbed duplicate knowledge");
                return Ok(AddOutcome::Absorbed {
                    existing_id: existing.id.clone(),
                });
            }
        }

        let id = self.bus.state().put_knowledge(item.clone()).await?;
        self.bus
            .publish(
                "knowledge",
                BusEvent::KnowledgeAdded {
                    item_id: id.clone(),
                    kind: item.kind.to_string(),
                },
            )
            .await?;
        info!(%id, kind = %item.kind, "Knowledge added");
        Ok(AddOutcome::Added { id })
    }

    /// Replace an old item with a new one, keeping the history chain
    pub async fn supersede(&self, old_id: &str, replacement: KnowledgeItem) -> StateResult<String> {
        let new_id = self.bus.state().put_knowledge(replacement).await?;

        let state = self.bus.state();
        if let Some(mut old) = state
            .list_knowledge(vec![])
            .await?
            .into_iter()
            .find(|i| i.id == old_id)
        {
            old.supersede(&new_id);
            state.update_knowledge(old).await?;
        }

        self.bus
            .publish(
                "knowledge",
                BusEvent::KnowledgeSuperseded {
                    old_item: old_id.to_string(),
                    new_item: new_id.clone(),
                },
            )
            .await?;
        Ok(new_id)
    }

    /// An agent wants to override a live decision: escalate instead of
    /// silently replacing it.
    pub async fn propose_override(&self, old_id: &str, proposal: &str, proposer: &str) -> StateResult<String> {
        let decision_id = crate::domain::generate_id("dec", old_id);
        self.bus
            .publish(
                proposer,
                BusEvent::DecisionNeeded {
                    decision_id: decision_id.clone(),
                    question: format!("Override decision {old_id}? Proposal: {proposal}"),
                    options: vec!["keep".to_string(), "replace".to_string()],
                    default_choice: "keep".to_string(),
                    timeout_ms: 60_000,
                },
            )
            .await?;
        Ok(decision_id)
    }

    /// Live items only, unless history is requested
    pub async fn items(&self, include_history: bool) -> StateResult<Vec<KnowledgeItem>> {
        if include_history {
            self.bus.state().list_knowledge(vec![]).await
        } else {
            self.live_items().await
        }
    }

    async fn live_items(&self) -> StateResult<Vec<KnowledgeItem>> {
        self.bus.state().list_knowledge(vec![Filter::eq("live", true)]).await
    }

    /// Relevance-ranked, bounded context for a task
    pub async fn context_for_task(&self, task: &Task) -> StateResult<String> {
        let mut scored: Vec<(f64, KnowledgeItem)> = self
            .live_items()
            .await?
            .into_iter()
            .map(|item| (score_item(&item, &task.affected_files), item))
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_items_per_prompt);

        if scored.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::from("Relevant knowledge from prior runs:\n");
        for (_, item) in &scored {
            out.push_str(&format!(
                "- [{}] {} (confidence {:.2})\n",
                item.kind, item.content, item.confidence
            ));
        }
        Ok(out)
    }

    /// Record a verification failure hint for the next attempt at a task
    pub async fn record_failure_hint(&self, task: &Task, summary: &str) -> StateResult<AddOutcome> {
        let item = KnowledgeItem::new(
            KnowledgeKind::Warning,
            format!("Previous attempt at '{}' failed: {summary}", task.title),
        )
        .with_confidence(0.9)
        .with_areas(task.affected_files.clone());
        self.add(item).await
    }
}

/// Jaccard similarity over lowercase word sets
fn similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<String> = a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let words_b: HashSet<String> = b.split_whitespace().map(|w| w.to_lowercase()).collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}

/// Area overlap weighted by confidence. Items with no overlap score zero;
/// items with no declared areas apply everywhere at low weight.
fn score_item(item: &KnowledgeItem, affected_files: &[String]) -> f64 {
    let overlap = if item.affected_areas.is_empty() {
        0.25
    } else {
        let hits = item
            .affected_areas
            .iter()
            .filter(|area| {
                affected_files
                    .iter()
                    .any(|f| f.contains(area.as_str()) || area.contains(f.as_str()))
            })
            .count();
        if hits == 0 {
            return 0.0;
        }
        hits as f64 / item.affected_areas.len() as f64
    };
    overlap * (0.5 + item.confidence)
}
