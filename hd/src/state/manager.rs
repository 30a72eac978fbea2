//! StateManager - actor that owns the store
//!
//! All persistence flows through one task that processes commands in order.
//! That gives serialized writes, and lets compound commands run their whole
//! logical step inside a single store transaction.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use hivestore::{Filter, Store, StoreTxn, now_ms};

use crate::domain::{
    AssertionChain, Checkpoint, CriterionResult, EventRecord, ExecutionRun, KnowledgeItem, ListMember,
    LockRecord, Relationship, RelationKind, RunStatus, SkillTrace, Subscription, Task, TaskList,
    TaskStatus, ToolUseEntry, TranscriptEntry, Wave,
};

use super::messages::{EventDraft, StateCommand, StateError, StateResult, TimelineQuery};

/// Broadcast when state changes consumers should react to
#[derive(Debug, Clone)]
pub enum StateEvent {
    TaskUpdated { id: String },
    RunUpdated { id: String },
    EventPublished { id: String, event_type: String },
}

/// Clone-able handle to the state actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    notify_tx: broadcast::Sender<StateEvent>,
}

macro_rules! request {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(StateCommand::$variant { $($field: $value,)* reply })
            .await
            .map_err(|_| StateError::ChannelClosed)?;
        rx.await.map_err(|_| StateError::ChannelClosed)??
    }};
}

impl StateManager {
    /// Open the store and spawn the actor
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        let store = Store::open(store_path.as_ref())?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn the actor over an already-open store
    pub fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (notify_tx, _) = broadcast::channel(256);

        tokio::spawn(actor_loop(store, rx, notify_tx.clone()));
        info!("StateManager spawned");

        Self { tx, notify_tx }
    }

    /// Subscribe to change notifications
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateEvent> {
        self.notify_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }

    // === Tasks ===

    pub async fn create_task(&self, task: Task) -> StateResult<String> {
        Ok(request!(self, CreateTask { task: task }))
    }

    pub async fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        Ok(request!(self, GetTask { id: id.to_string() }))
    }

    pub async fn get_task_required(&self, id: &str) -> StateResult<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("task {id}")))
    }

    pub async fn update_task(&self, task: Task) -> StateResult<()> {
        Ok(request!(self, UpdateTask { task: task }))
    }

    pub async fn list_tasks(&self, filters: Vec<Filter>) -> StateResult<Vec<Task>> {
        Ok(request!(self, ListTasks { filters: filters }))
    }

    pub async fn submit_task(&self, id: &str) -> StateResult<()> {
        Ok(request!(self, SubmitTask { id: id.to_string() }))
    }

    pub async fn transition_task(&self, id: &str, to: TaskStatus, event: Option<EventDraft>) -> StateResult<()> {
        Ok(request!(self, TransitionTask { id: id.to_string(), to: to, event: event }))
    }

    // === Relationships ===

    pub async fn add_relationship(&self, relationship: Relationship) -> StateResult<String> {
        Ok(request!(self, AddRelationship { relationship: relationship }))
    }

    pub async fn list_relationships(&self, task_id: Option<String>) -> StateResult<Vec<Relationship>> {
        Ok(request!(self, ListRelationships { task_id: task_id }))
    }

    // === Task lists ===

    pub async fn create_list(&self, list: TaskList) -> StateResult<String> {
        Ok(request!(self, CreateList { list: list }))
    }

    pub async fn get_list(&self, id: &str) -> StateResult<Option<TaskList>> {
        Ok(request!(self, GetList { id: id.to_string() }))
    }

    pub async fn update_list(&self, list: TaskList) -> StateResult<()> {
        Ok(request!(self, UpdateList { list: list }))
    }

    pub async fn list_lists(&self, filters: Vec<Filter>) -> StateResult<Vec<TaskList>> {
        Ok(request!(self, ListLists { filters: filters }))
    }

    pub async fn add_list_member(&self, member: ListMember) -> StateResult<String> {
        Ok(request!(self, AddListMember { member: member }))
    }

    pub async fn list_members(&self, list_id: &str) -> StateResult<Vec<ListMember>> {
        Ok(request!(self, ListMembers { list_id: list_id.to_string() }))
    }

    pub async fn update_list_member(&self, member: ListMember) -> StateResult<()> {
        Ok(request!(self, UpdateListMember { member: member }))
    }

    // === Runs ===

    pub async fn start_run(&self, run: ExecutionRun, event: EventDraft) -> StateResult<String> {
        Ok(request!(self, StartRun { run: run, event: event }))
    }

    pub async fn create_run(&self, run: ExecutionRun) -> StateResult<String> {
        Ok(request!(self, CreateRun { run: run }))
    }

    pub async fn get_run(&self, id: &str) -> StateResult<Option<ExecutionRun>> {
        Ok(request!(self, GetRun { id: id.to_string() }))
    }

    pub async fn get_run_required(&self, id: &str) -> StateResult<ExecutionRun> {
        self.get_run(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("run {id}")))
    }

    pub async fn update_run(&self, run: ExecutionRun) -> StateResult<()> {
        Ok(request!(self, UpdateRun { run: run }))
    }

    pub async fn list_runs(&self, filters: Vec<Filter>) -> StateResult<Vec<ExecutionRun>> {
        Ok(request!(self, ListRuns { filters: filters }))
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        run_status: RunStatus,
        task_to: Option<TaskStatus>,
        event: EventDraft,
    ) -> StateResult<()> {
        Ok(request!(self, FinishRun {
            run_id: run_id.to_string(),
            run_status: run_status,
            task_to: task_to,
            event: event,
        }))
    }

    pub async fn record_verification(
        &self,
        run_id: &str,
        verified: bool,
        criteria: Vec<CriterionResult>,
        event: EventDraft,
    ) -> StateResult<()> {
        Ok(request!(self, RecordVerification {
            run_id: run_id.to_string(),
            verified: verified,
            criteria: criteria,
            event: event,
        }))
    }

    // === Waves ===

    pub async fn create_wave(&self, wave: Wave, event: EventDraft) -> StateResult<String> {
        Ok(request!(self, CreateWave { wave: wave, event: event }))
    }

    pub async fn update_wave(&self, wave: Wave) -> StateResult<()> {
        Ok(request!(self, UpdateWave { wave: wave }))
    }

    pub async fn list_waves(&self, filters: Vec<Filter>) -> StateResult<Vec<Wave>> {
        Ok(request!(self, ListWaves { filters: filters }))
    }

    // === Locks ===

    pub async fn try_lock(&self, path: &str, holder: &str, reason: &str, ttl_ms: i64) -> StateResult<bool> {
        Ok(request!(self, TryLock {
            path: path.to_string(),
            holder: holder.to_string(),
            reason: reason.to_string(),
            ttl_ms: ttl_ms,
        }))
    }

    pub async fn unlock(&self, path: &str, holder: &str) -> StateResult<bool> {
        Ok(request!(self, Unlock { path: path.to_string(), holder: holder.to_string() }))
    }

    pub async fn check_lock(&self, path: &str) -> StateResult<Option<LockRecord>> {
        Ok(request!(self, CheckLock { path: path.to_string() }))
    }

    pub async fn list_locks(&self) -> StateResult<Vec<LockRecord>> {
        Ok(request!(self, ListLocks {}))
    }

    pub async fn release_holder(&self, holder: &str) -> StateResult<usize> {
        Ok(request!(self, ReleaseHolder { holder: holder.to_string() }))
    }

    // === Events ===

    pub async fn publish_event(&self, draft: EventDraft) -> StateResult<String> {
        Ok(request!(self, PublishEvent { draft: draft }))
    }

    pub async fn get_event(&self, id: &str) -> StateResult<Option<EventRecord>> {
        Ok(request!(self, GetEvent { id: id.to_string() }))
    }

    pub async fn subscribe_events(&self, subscription: Subscription) -> StateResult<String> {
        Ok(request!(self, Subscribe { subscription: subscription }))
    }

    pub async fn poll_events(&self, subscriber: &str, max: usize) -> StateResult<Vec<EventRecord>> {
        Ok(request!(self, PollEvents { subscriber: subscriber.to_string(), max: max }))
    }

    pub async fn ack_event(&self, subscriber: &str, event_id: &str) -> StateResult<()> {
        Ok(request!(self, AckEvent {
            subscriber: subscriber.to_string(),
            event_id: event_id.to_string(),
        }))
    }

    pub async fn timeline(&self, query: TimelineQuery) -> StateResult<Vec<EventRecord>> {
        Ok(request!(self, Timeline { query: query }))
    }

    // === Knowledge ===

    pub async fn put_knowledge(&self, item: KnowledgeItem) -> StateResult<String> {
        Ok(request!(self, PutKnowledge { item: item }))
    }

    pub async fn update_knowledge(&self, item: KnowledgeItem) -> StateResult<()> {
        Ok(request!(self, UpdateKnowledge { item: item }))
    }

    pub async fn list_knowledge(&self, filters: Vec<Filter>) -> StateResult<Vec<KnowledgeItem>> {
        Ok(request!(self, ListKnowledge { filters: filters }))
    }

    // === Checkpoints ===

    pub async fn create_checkpoint(&self, checkpoint: Checkpoint) -> StateResult<String> {
        Ok(request!(self, CreateCheckpoint { checkpoint: checkpoint }))
    }

    pub async fn get_checkpoint(&self, id: &str) -> StateResult<Option<Checkpoint>> {
        Ok(request!(self, GetCheckpoint { id: id.to_string() }))
    }

    pub async fn update_checkpoint(&self, checkpoint: Checkpoint) -> StateResult<()> {
        Ok(request!(self, UpdateCheckpoint { checkpoint: checkpoint }))
    }

    pub async fn delete_checkpoint(&self, id: &str) -> StateResult<()> {
        Ok(request!(self, DeleteCheckpoint { id: id.to_string() }))
    }

    pub async fn list_checkpoints(&self) -> StateResult<Vec<Checkpoint>> {
        Ok(request!(self, ListCheckpoints {}))
    }

    // === Criteria and observability ===

    pub async fn list_criteria(&self, task_id: &str) -> StateResult<Vec<CriterionResult>> {
        Ok(request!(self, ListCriteria { task_id: task_id.to_string() }))
    }

    pub async fn append_transcript(&self, entry: TranscriptEntry) -> StateResult<()> {
        Ok(request!(self, AppendTranscript { entry: entry }))
    }

    pub async fn append_tool_use(&self, entry: ToolUseEntry) -> StateResult<()> {
        Ok(request!(self, AppendToolUse { entry: entry }))
    }

    pub async fn append_assertion(&self, chain: AssertionChain) -> StateResult<()> {
        Ok(request!(self, AppendAssertion { chain: chain }))
    }

    pub async fn append_skill_trace(&self, trace: SkillTrace) -> StateResult<()> {
        Ok(request!(self, AppendSkillTrace { trace: trace }))
    }

    pub async fn list_transcript(&self, run_id: &str) -> StateResult<Vec<TranscriptEntry>> {
        Ok(request!(self, ListTranscript { run_id: run_id.to_string() }))
    }

    pub async fn list_tool_uses(&self, run_id: &str) -> StateResult<Vec<ToolUseEntry>> {
        Ok(request!(self, ListToolUses { run_id: run_id.to_string() }))
    }

    pub async fn list_assertions(&self, run_id: &str) -> StateResult<Vec<AssertionChain>> {
        Ok(request!(self, ListAssertions { run_id: run_id.to_string() }))
    }

    pub async fn list_skill_traces(&self, run_id: &str) -> StateResult<Vec<SkillTrace>> {
        Ok(request!(self, ListSkillTraces { run_id: run_id.to_string() }))
    }

    pub async fn allocate_slot(&self, scope: &str, label: &str) -> StateResult<u32> {
        Ok(request!(self, AllocateSlot { scope: scope.to_string(), label: label.to_string() }))
    }

    // === Resource claims ===

    pub async fn create_claim(&self, claim: crate::registry::ResourceClaim) -> StateResult<String> {
        Ok(request!(self, CreateClaim { claim: claim }))
    }

    pub async fn get_claim(&self, resource: &str) -> StateResult<Option<crate::registry::ResourceClaim>> {
        Ok(request!(self, GetClaim { resource: resource.to_string() }))
    }

    pub async fn release_claims_for_run(&self, run_id: &str) -> StateResult<usize> {
        Ok(request!(self, ReleaseClaimsForRun { run_id: run_id.to_string() }))
    }
}

/// Per-source publish counters, seeded lazily from the store
struct SourceSeqs(HashMap<String, u64>);

impl SourceSeqs {
    /// Make sure the counter for `source` reflects the store. Only scans
    /// events the first time a source publishes after startup.
    fn ensure_seeded(&mut self, store: &Store, source: &str) -> StateResult<()> {
        if !self.0.contains_key(source) {
            let max = store
                .list::<EventRecord>(&[Filter::eq("source", source)])?
                .iter()
                .map(|e| e.source_seq)
                .max()
                .unwrap_or(0);
            self.0.insert(source.to_string(), max);
        }
        Ok(())
    }

    fn next(&mut self, source: &str) -> u64 {
        let counter = self.0.entry(source.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

async fn actor_loop(
    mut store: Store,
    mut rx: mpsc::Receiver<StateCommand>,
    notify_tx: broadcast::Sender<StateEvent>,
) {
    let mut seqs = SourceSeqs(HashMap::new());

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateTask { task, reply } => {
                let result = store.create(&task).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get(&id).map_err(StateError::from));
            }
            StateCommand::UpdateTask { task, reply } => {
                let id = task.id.clone();
                let result = store.update(&task).map_err(StateError::from);
                if result.is_ok() {
                    let _ = notify_tx.send(StateEvent::TaskUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::ListTasks { filters, reply } => {
                let _ = reply.send(store.list(&filters).map_err(StateError::from));
            }
            StateCommand::SubmitTask { id, reply } => {
                let _ = reply.send(submit_task(&mut store, &id));
            }
            StateCommand::TransitionTask { id, to, event, reply } => {
                let result = transition_task(&mut store, &mut seqs, &id, to, event);
                if result.is_ok() {
                    let _ = notify_tx.send(StateEvent::TaskUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::AddRelationship { relationship, reply } => {
                let _ = reply.send(add_relationship(&mut store, relationship));
            }
            StateCommand::ListRelationships { task_id, reply } => {
                let result = match task_id {
                    Some(id) => store
                        .list::<Relationship>(&[])
                        .map(|rels| {
                            rels.into_iter()
                                .filter(|r| r.from_task == id || r.to_task == id)
                                .collect()
                        })
                        .map_err(StateError::from),
                    None => store.list(&[]).map_err(StateError::from),
                };
                let _ = reply.send(result);
            }
            StateCommand::CreateList { list, reply } => {
                let _ = reply.send(store.create(&list).map_err(StateError::from));
            }
            StateCommand::GetList { id, reply } => {
                let _ = reply.send(store.get(&id).map_err(StateError::from));
            }
            StateCommand::UpdateList { list, reply } => {
                let _ = reply.send(store.update(&list).map_err(StateError::from));
            }
            StateCommand::ListLists { filters, reply } => {
                let _ = reply.send(store.list(&filters).map_err(StateError::from));
            }
            StateCommand::AddListMember { member, reply } => {
                let result = store.transaction(|txn| {
                    txn.create(&member)?;
                    let mut list: TaskList = txn.get_required(&member.list_id)?;
                    list.total += 1;
                    list.updated_at = now_ms();
                    txn.update(&list)?;
                    Ok(member.id.clone())
                });
                let _ = reply.send(result.map_err(StateError::from));
            }
            StateCommand::ListMembers { list_id, reply } => {
                let result = store
                    .list::<ListMember>(&[Filter::eq("list", list_id)])
                    .map(|mut members| {
                        members.sort_by_key(|m| m.position);
                        members
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::UpdateListMember { member, reply } => {
                let _ = reply.send(store.update(&member).map_err(StateError::from));
            }
            StateCommand::StartRun { run, event, reply } => {
                let result = start_run(&mut store, &mut seqs, run, event);
                if let Ok(ref id) = result {
                    let _ = notify_tx.send(StateEvent::RunUpdated { id: id.clone() });
                }
                let _ = reply.send(result);
            }
            StateCommand::CreateRun { run, reply } => {
                let _ = reply.send(store.create(&run).map_err(StateError::from));
            }
            StateCommand::GetRun { id, reply } => {
                let _ = reply.send(store.get(&id).map_err(StateError::from));
            }
            StateCommand::UpdateRun { run, reply } => {
                let id = run.id.clone();
                let result = store.update(&run).map_err(StateError::from);
                if result.is_ok() {
                    let _ = notify_tx.send(StateEvent::RunUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::ListRuns { filters, reply } => {
                let _ = reply.send(store.list(&filters).map_err(StateError::from));
            }
            StateCommand::FinishRun { run_id, run_status, task_to, event, reply } => {
                let result = finish_run(&mut store, &mut seqs, &run_id, run_status, task_to, event);
                if result.is_ok() {
                    let _ = notify_tx.send(StateEvent::RunUpdated { id: run_id });
                }
                let _ = reply.send(result);
            }
            StateCommand::RecordVerification { run_id, verified, criteria, event, reply } => {
                let result = record_verification(&mut store, &mut seqs, &run_id, verified, criteria, event);
                if result.is_ok() {
                    let _ = notify_tx.send(StateEvent::RunUpdated { id: run_id });
                }
                let _ = reply.send(result);
            }
            StateCommand::CreateWave { wave, event, reply } => {
                let result = create_with_event(&mut store, &mut seqs, &wave, event);
                let _ = reply.send(result.map(|_| wave_id(&wave)));
            }
            StateCommand::UpdateWave { wave, reply } => {
                let _ = reply.send(store.update(&wave).map_err(StateError::from));
            }
            StateCommand::ListWaves { filters, reply } => {
                let _ = reply.send(store.list(&filters).map_err(StateError::from));
            }
            StateCommand::TryLock { path, holder, reason, ttl_ms, reply } => {
                let _ = reply.send(try_lock(&mut store, &path, &holder, &reason, ttl_ms));
            }
            StateCommand::Unlock { path, holder, reply } => {
                let _ = reply.send(unlock(&mut store, &path, &holder));
            }
            StateCommand::CheckLock { path, reply } => {
                let _ = reply.send(store.get(&path).map_err(StateError::from));
            }
            StateCommand::ListLocks { reply } => {
                let _ = reply.send(store.list(&[]).map_err(StateError::from));
            }
            StateCommand::ReleaseHolder { holder, reply } => {
                let result = store
                    .transaction(|txn| {
                        let locks: Vec<LockRecord> = txn.list(&[Filter::eq("holder", holder.clone())])?;
                        for lock in &locks {
                            txn.delete::<LockRecord>(&lock.resource_path)?;
                        }
                        Ok(locks.len())
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::PublishEvent { draft, reply } => {
                let result = publish_event(&mut store, &mut seqs, draft);
                if let Ok((ref id, ref event_type)) = result {
                    let _ = notify_tx.send(StateEvent::EventPublished {
                        id: id.clone(),
                        event_type: event_type.clone(),
                    });
                }
                let _ = reply.send(result.map(|(id, _)| id));
            }
            StateCommand::GetEvent { id, reply } => {
                let _ = reply.send(store.get(&id).map_err(StateError::from));
            }
            StateCommand::Subscribe { subscription, reply } => {
                // Replace an existing registration for the same subscriber
                let result = store
                    .transaction(|txn| {
                        let existing: Vec<Subscription> =
                            txn.list(&[Filter::eq("subscriber", subscription.subscriber.clone())])?;
                        for old in existing {
                            txn.delete::<Subscription>(&old.id)?;
                        }
                        txn.create(&subscription)?;
                        Ok(subscription.id.clone())
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::PollEvents { subscriber, max, reply } => {
                let _ = reply.send(poll_events(&store, &subscriber, max));
            }
            StateCommand::AckEvent { subscriber, event_id, reply } => {
                let result = store
                    .transaction(|txn| {
                        let mut event: EventRecord = txn.get_required(&event_id)?;
                        event.ack(&subscriber);
                        txn.update(&event)
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::Timeline { query, reply } => {
                let _ = reply.send(timeline(&store, &query));
            }
            StateCommand::PutKnowledge { item, reply } => {
                let _ = reply.send(store.create(&item).map_err(StateError::from));
            }
            StateCommand::UpdateKnowledge { item, reply } => {
                let _ = reply.send(store.update(&item).map_err(StateError::from));
            }
            StateCommand::ListKnowledge { filters, reply } => {
                let _ = reply.send(store.list(&filters).map_err(StateError::from));
            }
            StateCommand::CreateCheckpoint { checkpoint, reply } => {
                let _ = reply.send(store.create(&checkpoint).map_err(StateError::from));
            }
            StateCommand::GetCheckpoint { id, reply } => {
                let _ = reply.send(store.get(&id).map_err(StateError::from));
            }
            StateCommand::UpdateCheckpoint { checkpoint, reply } => {
                let _ = reply.send(store.update(&checkpoint).map_err(StateError::from));
            }
            StateCommand::DeleteCheckpoint { id, reply } => {
                let _ = reply.send(store.delete::<Checkpoint>(&id).map_err(StateError::from));
            }
            StateCommand::ListCheckpoints { reply } => {
                let _ = reply.send(store.list(&[]).map_err(StateError::from));
            }
            StateCommand::ListCriteria { task_id, reply } => {
                let _ = reply.send(
                    store
                        .list::<CriterionResult>(&[Filter::eq("task", task_id)])
                        .map_err(StateError::from),
                );
            }
            StateCommand::AppendTranscript { entry, reply } => {
                let _ = reply.send(store.create(&entry).map(|_| ()).map_err(StateError::from));
            }
            StateCommand::AppendToolUse { entry, reply } => {
                let _ = reply.send(store.create(&entry).map(|_| ()).map_err(StateError::from));
            }
            StateCommand::AppendAssertion { chain, reply } => {
                let _ = reply.send(store.create(&chain).map(|_| ()).map_err(StateError::from));
            }
            StateCommand::AppendSkillTrace { trace, reply } => {
                let _ = reply.send(store.create(&trace).map(|_| ()).map_err(StateError::from));
            }
            StateCommand::ListTranscript { run_id, reply } => {
                let result = store
                    .list::<TranscriptEntry>(&[Filter::eq("run", run_id)])
                    .map(|mut entries| {
                        entries.sort_by_key(|e| e.seq);
                        entries
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListToolUses { run_id, reply } => {
                let result = store
                    .list::<ToolUseEntry>(&[Filter::eq("run", run_id)])
                    .map(|mut entries| {
                        entries.sort_by_key(|e| e.seq);
                        entries
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListAssertions { run_id, reply } => {
                let result = store
                    .list::<AssertionChain>(&[Filter::eq("run", run_id)])
                    .map(|mut chains| {
                        chains.sort_by_key(|c| c.seq);
                        chains
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListSkillTraces { run_id, reply } => {
                let result = store
                    .list::<SkillTrace>(&[Filter::eq("run", run_id)])
                    .map(|mut traces| {
                        traces.sort_by_key(|t| t.seq);
                        traces
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::CreateClaim { claim, reply } => {
                let _ = reply.send(store.create(&claim).map_err(StateError::from));
            }
            StateCommand::GetClaim { resource, reply } => {
                let _ = reply.send(store.get(&resource).map_err(StateError::from));
            }
            StateCommand::ReleaseClaimsForRun { run_id, reply } => {
                let result = store
                    .transaction(|txn| {
                        let claims: Vec<crate::registry::ResourceClaim> =
                            txn.list(&[Filter::eq("run", run_id.clone())])?;
                        for claim in &claims {
                            txn.delete::<crate::registry::ResourceClaim>(&claim.resource)?;
                        }
                        Ok(claims.len())
                    })
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::AllocateSlot { scope, label, reply } => {
                let _ = reply.send(store.allocate_slot(&scope, &label).map_err(StateError::from));
            }
            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

fn wave_id(wave: &Wave) -> String {
    wave.id.clone()
}

fn insert_event(
    txn: &mut StoreTxn<'_>,
    seqs: &mut SourceSeqs,
    draft: EventDraft,
) -> hivestore::error::Result<EventRecord> {
    let seq = seqs.next(&draft.source);
    let event = EventRecord::new(
        draft.source,
        draft.event_type,
        draft.payload,
        draft.priority,
        draft.correlation_id,
        seq,
    );
    txn.create(&event)?;
    Ok(event)
}

fn publish_event(store: &mut Store, seqs: &mut SourceSeqs, draft: EventDraft) -> StateResult<(String, String)> {
    seqs.ensure_seeded(store, &draft.source)?;
    let result = store.transaction(|txn| insert_event(txn, seqs, draft))?;
    Ok((result.id, result.event_type))
}

fn submit_task(store: &mut Store, id: &str) -> StateResult<()> {
    enum Outcome {
        Ok,
        Invalid(String),
        Illegal(TaskStatus),
    }

    let outcome = store.transaction(|txn| {
        let mut task: Task = txn.get_required(id)?;
        let rejections = task.draft_rejections();
        if !rejections.is_empty() {
            let reasons = rejections.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ");
            return Ok(Outcome::Invalid(reasons));
        }
        if !task.set_status(TaskStatus::Pending) {
            return Ok(Outcome::Illegal(task.status));
        }
        txn.update(&task)?;
        Ok(Outcome::Ok)
    })?;

    match outcome {
        Outcome::Ok => Ok(()),
        Outcome::Invalid(reasons) => Err(StateError::DraftInvalid {
            id: id.to_string(),
            reasons,
        }),
        Outcome::Illegal(from) => Err(StateError::IllegalTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: TaskStatus::Pending.to_string(),
        }),
    }
}

fn transition_task(
    store: &mut Store,
    seqs: &mut SourceSeqs,
    id: &str,
    to: TaskStatus,
    event: Option<EventDraft>,
) -> StateResult<()> {
    if let Some(ref draft) = event {
        seqs.ensure_seeded(store, &draft.source)?;
    }
    let outcome = store.transaction(|txn| {
        let mut task: Task = txn.get_required(id)?;
        let from = task.status;
        if !from.can_transition(to) {
            return Ok(Some((from, to)));
        }

        if to == TaskStatus::Completed {
            let runs: Vec<ExecutionRun> = txn.list(&[Filter::eq("task", id)])?;
            if !runs.iter().any(|r| r.status == RunStatus::Verified) {
                return Ok(Some((from, to)));
            }
            let criteria: Vec<CriterionResult> = txn.list(&[Filter::eq("task", id)])?;
            if criteria.is_empty() {
                return Ok(Some((from, to)));
            }
        }

        task.set_status(to);
        txn.update(&task)?;

        if let Some(draft) = event {
            insert_event(txn, seqs, draft)?;
        }
        Ok(None)
    })?;

    match outcome {
        Some((from, to)) => Err(StateError::IllegalTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }),
        None => Ok(()),
    }
}

fn add_relationship(store: &mut Store, relationship: Relationship) -> StateResult<String> {
    if relationship.from_task == relationship.to_task {
        return Err(StateError::BadRelationship("self-edge".to_string()));
    }

    // Inserting from -> to creates a cycle iff `from` is already reachable
    // from `to` along depends_on edges.
    if relationship.kind == RelationKind::DependsOn {
        let existing: Vec<Relationship> = store.list(&[])?;
        let deps: Vec<(&str, &str)> = existing
            .iter()
            .filter(|r| r.kind == RelationKind::DependsOn)
            .map(|r| (r.from_task.as_str(), r.to_task.as_str()))
            .collect();
        if reachable(&deps, &relationship.to_task, &relationship.from_task) {
            return Err(StateError::DependencyCycle(format!(
                "{} -> {} closes a dependency loop",
                relationship.from_task, relationship.to_task
            )));
        }
    }

    let result = store.transaction(|txn| {
        txn.create(&relationship)?;
        // Maintain the derived blocks_count on the dependency target
        if relationship.kind == RelationKind::DependsOn
            && let Some(mut target) = txn.get::<Task>(&relationship.to_task)?
        {
            target.blocks_count += 1;
            target.updated_at = now_ms();
            txn.update(&target)?;
        }
        Ok(relationship.id.clone())
    })?;
    Ok(result)
}

fn reachable(edges: &[(&str, &str)], from: &str, target: &str) -> bool {
    let mut stack = vec![from];
    let mut seen = std::collections::HashSet::new();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !seen.insert(node.to_string()) {
            continue;
        }
        for &(a, b) in edges {
            if a == node {
                stack.push(b);
            }
        }
    }
    false
}

fn start_run(
    store: &mut Store,
    seqs: &mut SourceSeqs,
    run: ExecutionRun,
    event: EventDraft,
) -> StateResult<String> {
    seqs.ensure_seeded(store, &event.source)?;
    let outcome = store.transaction(|txn| {
        let mut task: Task = txn.get_required(&run.task_id)?;

        // Exactly one live run per in_progress task
        let runs: Vec<ExecutionRun> = txn.list(&[Filter::eq("task", run.task_id.clone())])?;
        if runs.iter().any(|r| !r.status.is_terminal()) {
            return Ok(Err(StateError::Invariant(format!(
                "task {} already has a live run",
                run.task_id
            ))));
        }

        if !task.status.can_transition(TaskStatus::InProgress) {
            return Ok(Err(StateError::IllegalTransition {
                id: task.id.clone(),
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            }));
        }

        txn.create(&run)?;
        task.set_status(TaskStatus::InProgress);
        txn.update(&task)?;
        insert_event(txn, seqs, event)?;
        Ok(Ok(run.id.clone()))
    })?;
    outcome
}

fn finish_run(
    store: &mut Store,
    seqs: &mut SourceSeqs,
    run_id: &str,
    run_status: RunStatus,
    task_to: Option<TaskStatus>,
    event: EventDraft,
) -> StateResult<()> {
    seqs.ensure_seeded(store, &event.source)?;
    let outcome = store.transaction(|txn| {
        let mut run: ExecutionRun = txn.get_required(run_id)?;
        run.set_status(run_status);
        txn.update(&run)?;

        // Locks die with the run
        if !run_status.may_hold_locks() {
            let locks: Vec<LockRecord> = txn.list(&[Filter::eq("holder", run_id.to_string())])?;
            for lock in locks {
                txn.delete::<LockRecord>(&lock.resource_path)?;
            }
        }

        if let Some(to) = task_to {
            let mut task: Task = txn.get_required(&run.task_id)?;
            if !task.status.can_transition(to) {
                return Ok(Err(StateError::IllegalTransition {
                    id: task.id.clone(),
                    from: task.status.to_string(),
                    to: to.to_string(),
                }));
            }
            task.set_status(to);
            txn.update(&task)?;
        }

        insert_event(txn, seqs, event)?;
        Ok(Ok(()))
    })?;
    outcome
}

fn record_verification(
    store: &mut Store,
    seqs: &mut SourceSeqs,
    run_id: &str,
    verified: bool,
    criteria: Vec<CriterionResult>,
    event: EventDraft,
) -> StateResult<()> {
    if verified && criteria.is_empty() {
        return Err(StateError::Invariant(
            "verified completion requires at least one criterion result".to_string(),
        ));
    }

    seqs.ensure_seeded(store, &event.source)?;
    let outcome = store.transaction(|txn| {
        let mut run: ExecutionRun = txn.get_required(run_id)?;
        run.set_status(if verified { RunStatus::Verified } else { RunStatus::Rejected });
        txn.update(&run)?;

        for criterion in &criteria {
            txn.create(criterion)?;
        }

        // Locks die with the terminal run
        let locks: Vec<LockRecord> = txn.list(&[Filter::eq("holder", run_id.to_string())])?;
        for lock in locks {
            txn.delete::<LockRecord>(&lock.resource_path)?;
        }

        let mut task: Task = txn.get_required(&run.task_id)?;
        let to = if verified { TaskStatus::Completed } else { TaskStatus::Failed };
        if !task.status.can_transition(to) {
            return Ok(Err(StateError::IllegalTransition {
                id: task.id.clone(),
                from: task.status.to_string(),
                to: to.to_string(),
            }));
        }
        task.set_status(to);
        if !verified {
            task.record_attempt();
        }
        txn.update(&task)?;

        // Roll the task's list memberships forward. Counters account for
        // the previous item status so a retried task is not double-counted.
        use crate::domain::ItemStatus;
        let members: Vec<ListMember> = txn.list(&[Filter::eq("task", task.id.clone())])?;
        for mut member in members {
            let previous = member.item_status;
            let next = if verified { ItemStatus::Done } else { ItemStatus::Failed };
            member.set_item_status(next);
            txn.update(&member)?;

            let mut list: TaskList = txn.get_required(&member.list_id)?;
            match previous {
                ItemStatus::Done => list.completed = list.completed.saturating_sub(1),
                ItemStatus::Failed => list.failed = list.failed.saturating_sub(1),
                _ => {}
            }
            match next {
                ItemStatus::Done => list.completed += 1,
                ItemStatus::Failed => list.failed += 1,
                _ => {}
            }
            list.updated_at = now_ms();
            txn.update(&list)?;
        }

        insert_event(txn, seqs, event)?;
        Ok(Ok(()))
    })?;
    outcome
}

fn create_with_event<R: hivestore::Record>(
    store: &mut Store,
    seqs: &mut SourceSeqs,
    record: &R,
    event: EventDraft,
) -> StateResult<()> {
    seqs.ensure_seeded(store, &event.source)?;
    store.transaction(|txn| {
        txn.create(record)?;
        insert_event(txn, seqs, event)?;
        Ok(())
    })?;
    Ok(())
}

fn try_lock(store: &mut Store, path: &str, holder: &str, reason: &str, ttl_ms: i64) -> StateResult<bool> {
    let now = now_ms();
    let granted = store.transaction(|txn| {
        match txn.get::<LockRecord>(path)? {
            Some(existing) if !existing.is_expired(now) => {
                if existing.held_by == holder {
                    // Re-lock by the holder renews the TTL
                    let renewed = LockRecord::new(path, holder, reason, ttl_ms);
                    txn.update(&renewed)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(_expired) => {
                let lock = LockRecord::new(path, holder, reason, ttl_ms);
                txn.update(&lock)?;
                Ok(true)
            }
            None => {
                let lock = LockRecord::new(path, holder, reason, ttl_ms);
                txn.create(&lock)?;
                Ok(true)
            }
        }
    })?;
    if granted {
        debug!(path, holder, "Lock granted");
    } else {
        debug!(path, holder, "Lock contended");
    }
    Ok(granted)
}

fn unlock(store: &mut Store, path: &str, holder: &str) -> StateResult<bool> {
    let released = store.transaction(|txn| match txn.get::<LockRecord>(path)? {
        Some(lock) if lock.held_by == holder => {
            txn.delete::<LockRecord>(path)?;
            Ok(true)
        }
        Some(lock) => {
            warn!(path, holder, held_by = %lock.held_by, "Unlock by non-holder refused");
            Ok(false)
        }
        None => Ok(false),
    })?;
    Ok(released)
}

fn poll_events(store: &Store, subscriber: &str, max: usize) -> StateResult<Vec<EventRecord>> {
    let subscriptions: Vec<Subscription> = store.list(&[Filter::eq("subscriber", subscriber)])?;
    if subscriptions.is_empty() {
        return Ok(Vec::new());
    }

    let mut events: Vec<EventRecord> = store
        .list::<EventRecord>(&[])?
        .into_iter()
        .filter(|e| !e.is_acked_by(subscriber))
        .filter(|e| subscriptions.iter().any(|s| s.matches(e)))
        .collect();
    events.sort_by_key(|e| (e.timestamp, e.source_seq));
    events.truncate(max);
    Ok(events)
}

fn timeline(store: &Store, query: &TimelineQuery) -> StateResult<Vec<EventRecord>> {
    let mut events: Vec<EventRecord> = store
        .list::<EventRecord>(&[])?
        .into_iter()
        .filter(|e| query.since.is_none_or(|s| e.timestamp >= s))
        .filter(|e| query.until.is_none_or(|u| e.timestamp <= u))
        .filter(|e| query.sources.is_empty() || query.sources.contains(&e.source))
        .filter(|e| query.event_types.is_empty() || query.event_types.contains(&e.event_type))
        .collect();
    events.sort_by_key(|e| (e.timestamp, e.source_seq));
    if query.limit > 0 {
        events.truncate(query.limit);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentRole, RelationKind, TaskCategory, VerifiedBy};
    use tempfile::TempDir;

    fn ready_task(title: &str) -> Task {
        Task::new(TaskCategory::Feature, title)
            .with_description("d")
            .with_criteria(vec!["works".to_string()])
            .with_codebase_tests(vec!["true".to_string()])
    }

    async fn spawn_manager() -> (TempDir, StateManager) {
        let temp = TempDir::new().unwrap();
        let manager = StateManager::spawn(temp.path().join("store")).unwrap();
        (temp, manager)
    }

    #[tokio::test]
    async fn test_task_crud_and_submit() {
        let (_temp, state) = spawn_manager().await;

        let task = ready_task("build the thing");
        let id = state.create_task(task).await.unwrap();

        state.submit_task(&id).await.unwrap();
        let task = state.get_task_required(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_draft() {
        let (_temp, state) = spawn_manager().await;

        let task = Task::new(TaskCategory::Feature, "incomplete");
        let id = state.create_task(task).await.unwrap();

        let err = state.submit_task(&id).await.unwrap_err();
        assert!(matches!(err, StateError::DraftInvalid { .. }));
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected() {
        let (_temp, state) = spawn_manager().await;

        let a = state.create_task(ready_task("a")).await.unwrap();
        let b = state.create_task(ready_task("b")).await.unwrap();
        let c = state.create_task(ready_task("c")).await.unwrap();

        state
            .add_relationship(Relationship::new(&a, &b, RelationKind::DependsOn).unwrap())
            .await
            .unwrap();
        state
            .add_relationship(Relationship::new(&b, &c, RelationKind::DependsOn).unwrap())
            .await
            .unwrap();

        // c -> a would close the loop a -> b -> c -> a
        let err = state
            .add_relationship(Relationship::new(&c, &a, RelationKind::DependsOn).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::DependencyCycle(_)));

        // Non-dependency kinds may form cycles freely
        state
            .add_relationship(Relationship::new(&c, &a, RelationKind::RelatedTo).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocks_count_derived() {
        let (_temp, state) = spawn_manager().await;

        let a = state.create_task(ready_task("a")).await.unwrap();
        let b = state.create_task(ready_task("b")).await.unwrap();
        state
            .add_relationship(Relationship::new(&a, &b, RelationKind::DependsOn).unwrap())
            .await
            .unwrap();

        let target = state.get_task_required(&b).await.unwrap();
        assert_eq!(target.blocks_count, 1);
    }

    #[tokio::test]
    async fn test_start_run_enforces_single_live_run() {
        let (_temp, state) = spawn_manager().await;

        let id = state.create_task(ready_task("t")).await.unwrap();
        state.submit_task(&id).await.unwrap();

        let run = ExecutionRun::new(&id, AgentRole::Builder, 1);
        state
            .start_run(run, EventDraft::new("lifecycle", "run_started", serde_json::json!({})))
            .await
            .unwrap();

        let task = state.get_task_required(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        // A second live run for the same task violates the invariant
        // (and the task is no longer pending anyway)
        let run2 = ExecutionRun::new(&id, AgentRole::Builder, 2);
        let err = state
            .start_run(run2, EventDraft::new("lifecycle", "run_started", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Invariant(_) | StateError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_verification_completes_task_and_releases_locks() {
        let (_temp, state) = spawn_manager().await;

        let id = state.create_task(ready_task("t")).await.unwrap();
        state.submit_task(&id).await.unwrap();

        let run = ExecutionRun::new(&id, AgentRole::Builder, 1);
        let run_id = state
            .start_run(run, EventDraft::new("lifecycle", "run_started", serde_json::json!({})))
            .await
            .unwrap();

        assert!(state.try_lock("src/a.rs", &run_id, "edit", 60_000).await.unwrap());

        state
            .transition_task(&id, TaskStatus::Validating, None)
            .await
            .unwrap();

        let criteria = vec![CriterionResult::new(&id, &run_id, "works", true, VerifiedBy::System)];
        state
            .record_verification(
                &run_id,
                true,
                criteria,
                EventDraft::new("gate", "verification_succeeded", serde_json::json!({})),
            )
            .await
            .unwrap();

        let task = state.get_task_required(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let run = state.get_run_required(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Verified);

        // Lock released atomically with the verdict
        assert!(state.check_lock("src/a.rs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejection_increments_attempts() {
        let (_temp, state) = spawn_manager().await;

        let id = state.create_task(ready_task("t")).await.unwrap();
        state.submit_task(&id).await.unwrap();

        let run = ExecutionRun::new(&id, AgentRole::Builder, 1);
        let run_id = state
            .start_run(run, EventDraft::new("lifecycle", "run_started", serde_json::json!({})))
            .await
            .unwrap();
        state
            .transition_task(&id, TaskStatus::Validating, None)
            .await
            .unwrap();

        state
            .record_verification(
                &run_id,
                false,
                vec![],
                EventDraft::new("gate", "verification_failed", serde_json::json!({})),
            )
            .await
            .unwrap();

        let task = state.get_task_required(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_completed_requires_verified_run() {
        let (_temp, state) = spawn_manager().await;

        let id = state.create_task(ready_task("t")).await.unwrap();
        state.submit_task(&id).await.unwrap();
        let run = ExecutionRun::new(&id, AgentRole::Builder, 1);
        state
            .start_run(run, EventDraft::new("lifecycle", "run_started", serde_json::json!({})))
            .await
            .unwrap();
        state
            .transition_task(&id, TaskStatus::Validating, None)
            .await
            .unwrap();

        // Direct transition to completed without a verified run must fail
        let err = state
            .transition_task(&id, TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_lock_contention_and_renewal() {
        let (_temp, state) = spawn_manager().await;

        assert!(state.try_lock("x", "run-1", "edit", 60_000).await.unwrap());
        assert!(!state.try_lock("x", "run-2", "edit", 60_000).await.unwrap());
        // Holder re-lock renews
        assert!(state.try_lock("x", "run-1", "edit", 60_000).await.unwrap());

        assert!(!state.unlock("x", "run-2").await.unwrap());
        assert!(state.unlock("x", "run-1").await.unwrap());
        assert!(state.try_lock("x", "run-2", "edit", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_reacquirable() {
        let (_temp, state) = spawn_manager().await;

        assert!(state.try_lock("y", "run-1", "edit", -1).await.unwrap()); // already expired
        assert!(state.try_lock("y", "run-2", "edit", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_poll_ack_law() {
        let (_temp, state) = spawn_manager().await;

        state
            .subscribe_events(Subscription::new("mon", vec!["wave_created".to_string()], None))
            .await
            .unwrap();

        let event_id = state
            .publish_event(EventDraft::new("scheduler", "wave_created", serde_json::json!({"n": 1})))
            .await
            .unwrap();
        state
            .publish_event(EventDraft::new("scheduler", "run_started", serde_json::json!({})))
            .await
            .unwrap();

        let polled = state.poll_events("mon", 10).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].id, event_id);

        state.ack_event("mon", &event_id).await.unwrap();
        // Idempotent
        state.ack_event("mon", &event_id).await.unwrap();

        let polled = state.poll_events("mon", 10).await.unwrap();
        assert!(polled.is_empty());
    }

    #[tokio::test]
    async fn test_per_source_sequence_monotone() {
        let (_temp, state) = spawn_manager().await;

        for _ in 0..3 {
            state
                .publish_event(EventDraft::new("scheduler", "wave_created", serde_json::json!({})))
                .await
                .unwrap();
        }
        let events = state.timeline(TimelineQuery::default()).await.unwrap();
        let seqs: Vec<u64> = events
            .iter()
            .filter(|e| e.source == "scheduler")
            .map(|e| e.source_seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_timeline_filters() {
        let (_temp, state) = spawn_manager().await;

        state
            .publish_event(EventDraft::new("a", "run_started", serde_json::json!({})))
            .await
            .unwrap();
        state
            .publish_event(EventDraft::new("b", "run_crashed", serde_json::json!({})))
            .await
            .unwrap();

        let query = TimelineQuery {
            event_types: vec!["run_crashed".to_string()],
            ..Default::default()
        };
        let events = state.timeline(query).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "b");
    }
}
