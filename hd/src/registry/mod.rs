//! Resource registry - single-owner coordination for hot shared artifacts
//!
//! Aggregator files (type re-exports, route mounts, dependency manifests)
//! and migration numbering are not modified by arbitrary agents. The first
//! writer claims ownership; everyone else submits a change request as an
//! event addressed to the owner. Migration numbers are allocated through
//! the store's transactional slot allocator so they stay monotone.

use std::collections::HashMap;
use std::sync::Arc;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::generate_id;
use crate::events::EventBus;
use crate::state::{EventDraft, StateResult};

/// Allocation scope for workspace schema migration numbers
const MIGRATION_SCOPE: &str = "workspace-migrations";

/// Ownership of one hot artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// The artifact path; doubles as the record id
    pub resource: String,
    /// Task that owns writes to this artifact
    pub owner_task: String,
    /// Run that registered the claim
    pub claimed_by_run: String,
    pub claimed_at: i64,
    pub updated_at: i64,
}

impl ResourceClaim {
    fn new(resource: &str, owner_task: &str, run_id: &str) -> Self {
        let now = now_ms();
        Self {
            resource: resource.to_string(),
            owner_task: owner_task.to_string(),
            claimed_by_run: run_id.to_string(),
            claimed_at: now,
            updated_at: now,
        }
    }
}

impl Record for ResourceClaim {
    fn id(&self) -> &str {
        &self.resource
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "resource_claims"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("owner_task".to_string(), IndexValue::String(self.owner_task.clone()));
        fields.insert("run".to_string(), IndexValue::String(self.claimed_by_run.clone()));
        fields
    }
}

/// Outcome of an ownership claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller is now (or already was) the owner
    Owner,
    /// Someone else owns it; a change request was filed instead
    ChangeRequested { owner_task: String, request_id: String },
}

#[derive(Clone)]
pub struct ResourceRegistry {
    bus: Arc<EventBus>,
}

impl ResourceRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Claim first-writer ownership of a hot artifact, or file a change
    /// request with the current owner.
    pub async fn claim_or_request(
        &self,
        resource: &str,
        task_id: &str,
        run_id: &str,
        change_summary: &str,
    ) -> StateResult<ClaimOutcome> {
        let state = self.bus.state();

        if let Some(existing) = self.owner_of(resource).await? {
            if existing.owner_task == task_id {
                return Ok(ClaimOutcome::Owner);
            }
            // File the change as an event; the owner applies it
            let request_id = generate_id("chg", resource);
            state
                .publish_event(
                    EventDraft::new(
                        run_id,
                        "change_requested",
                        serde_json::json!({
                            "request_id": request_id,
                            "resource": resource,
                            "owner_task": existing.owner_task,
                            "requested_by": task_id,
                            "summary": change_summary,
                        }),
                    )
                    .with_correlation(request_id.clone()),
                )
                .await?;
            debug!(resource, owner = %existing.owner_task, requester = task_id, "Change request filed");
            return Ok(ClaimOutcome::ChangeRequested {
                owner_task: existing.owner_task,
                request_id,
            });
        }

        // First writer wins. The state actor serializes these, so two
        // simultaneous claims cannot both create.
        let claim = ResourceClaim::new(resource, task_id, run_id);
        match state.create_claim(claim).await {
            Ok(_) => {
                info!(resource, task_id, "Resource ownership claimed");
                Ok(ClaimOutcome::Owner)
            }
            Err(_) => {
                // Lost the race; re-read and file a request
                let owner = self
                    .owner_of(resource)
                    .await?
                    .map(|c| c.owner_task)
                    .unwrap_or_default();
                let request_id = generate_id("chg", resource);
                Ok(ClaimOutcome::ChangeRequested {
                    owner_task: owner,
                    request_id,
                })
            }
        }
    }

    /// Current owner of an artifact, if any
    pub async fn owner_of(&self, resource: &str) -> StateResult<Option<ResourceClaim>> {
        self.bus.state().get_claim(resource).await
    }

    /// Release every claim registered by a run (rollback or crash cleanup)
    pub async fn release_run(&self, run_id: &str) -> StateResult<usize> {
        self.bus.state().release_claims_for_run(run_id).await
    }

    /// Allocate the next workspace migration number. Serialized through the
    /// store, so concurrent requesters never collide.
    pub async fn next_migration_number(&self, label: &str) -> StateResult<u32> {
        let number = self.bus.state().allocate_slot(MIGRATION_SCOPE, label).await?;
        info!(number, label, "Migration number allocated");
        Ok(number)
    }
}
