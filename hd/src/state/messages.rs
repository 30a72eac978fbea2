//! State manager command and error types
//!
//! Every command carries a oneshot reply channel; the actor owns the store
//! and processes commands strictly in order, which serializes all writes.

use tokio::sync::oneshot;

use crate::domain::{
    AssertionChain, Checkpoint, CriterionResult, EventPriority, EventRecord, ExecutionRun, Filter,
    KnowledgeItem, ListMember, LockRecord, Relationship, RunStatus, SkillTrace, Subscription, Task,
    TaskList, TaskStatus, ToolUseEntry, TranscriptEntry, Wave,
};

/// Errors surfaced by state operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },

    #[error("draft validation failed for {id}: {reasons}")]
    DraftInvalid { id: String, reasons: String },

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("relationship rejected: {0}")]
    BadRelationship(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("state manager channel closed")]
    ChannelClosed,
}

impl From<hivestore::StoreError> for StateError {
    fn from(e: hivestore::StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

pub type StateResult<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResult<T>>;

/// Draft of an event to publish, possibly inside a compound transaction
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub source: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub priority: EventPriority,
    pub correlation_id: Option<String>,
}

impl EventDraft {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            payload,
            priority: EventPriority::Normal,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Timeline query bounds
#[derive(Debug, Clone, Default)]
pub struct TimelineQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub sources: Vec<String>,
    pub event_types: Vec<String>,
    pub limit: usize,
}

/// Commands processed by the state actor
pub enum StateCommand {
    // === Tasks ===
    CreateTask { task: Task, reply: Reply<String> },
    GetTask { id: String, reply: Reply<Option<Task>> },
    UpdateTask { task: Task, reply: Reply<()> },
    ListTasks { filters: Vec<Filter>, reply: Reply<Vec<Task>> },
    /// Validate a draft and move it to pending
    SubmitTask { id: String, reply: Reply<()> },
    /// Apply a status transition, enforcing the state machine and the
    /// completion invariants, and emit the given event atomically
    TransitionTask {
        id: String,
        to: TaskStatus,
        event: Option<EventDraft>,
        reply: Reply<()>,
    },

    // === Relationships ===
    AddRelationship { relationship: Relationship, reply: Reply<String> },
    ListRelationships { task_id: Option<String>, reply: Reply<Vec<Relationship>> },

    // === Task lists ===
    CreateList { list: TaskList, reply: Reply<String> },
    GetList { id: String, reply: Reply<Option<TaskList>> },
    UpdateList { list: TaskList, reply: Reply<()> },
    ListLists { filters: Vec<Filter>, reply: Reply<Vec<TaskList>> },
    AddListMember { member: ListMember, reply: Reply<String> },
    ListMembers { list_id: String, reply: Reply<Vec<ListMember>> },
    UpdateListMember { member: ListMember, reply: Reply<()> },

    // === Runs ===
    /// Create the run and move its task to in_progress in one transaction
    StartRun { run: ExecutionRun, event: EventDraft, reply: Reply<String> },
    /// Bare insert, used by recovery paths and tests
    CreateRun { run: ExecutionRun, reply: Reply<String> },
    GetRun { id: String, reply: Reply<Option<ExecutionRun>> },
    UpdateRun { run: ExecutionRun, reply: Reply<()> },
    ListRuns { filters: Vec<Filter>, reply: Reply<Vec<ExecutionRun>> },
    /// Terminal bookkeeping for a run: new run status, optional task
    /// transition, lock release, event - one transaction
    FinishRun {
        run_id: String,
        run_status: RunStatus,
        task_to: Option<TaskStatus>,
        event: EventDraft,
        reply: Reply<()>,
    },
    /// The gate's verdict: run verified/rejected, task completed/failed,
    /// criterion results recorded, locks released, event emitted - atomic
    RecordVerification {
        run_id: String,
        verified: bool,
        criteria: Vec<CriterionResult>,
        event: EventDraft,
        reply: Reply<()>,
    },

    // === Waves ===
    CreateWave { wave: Wave, event: EventDraft, reply: Reply<String> },
    UpdateWave { wave: Wave, reply: Reply<()> },
    ListWaves { filters: Vec<Filter>, reply: Reply<Vec<Wave>> },

    // === Locks ===
    TryLock {
        path: String,
        holder: String,
        reason: String,
        ttl_ms: i64,
        reply: Reply<bool>,
    },
    Unlock { path: String, holder: String, reply: Reply<bool> },
    CheckLock { path: String, reply: Reply<Option<LockRecord>> },
    ListLocks { reply: Reply<Vec<LockRecord>> },
    /// Drop every lock held by a run (rollback, crash, force-release)
    ReleaseHolder { holder: String, reply: Reply<usize> },

    // === Events ===
    PublishEvent { draft: EventDraft, reply: Reply<String> },
    GetEvent { id: String, reply: Reply<Option<EventRecord>> },
    Subscribe { subscription: Subscription, reply: Reply<String> },
    PollEvents { subscriber: String, max: usize, reply: Reply<Vec<EventRecord>> },
    AckEvent { subscriber: String, event_id: String, reply: Reply<()> },
    Timeline { query: TimelineQuery, reply: Reply<Vec<EventRecord>> },

    // === Knowledge ===
    PutKnowledge { item: KnowledgeItem, reply: Reply<String> },
    UpdateKnowledge { item: KnowledgeItem, reply: Reply<()> },
    ListKnowledge { filters: Vec<Filter>, reply: Reply<Vec<KnowledgeItem>> },

    // === Checkpoints ===
    CreateCheckpoint { checkpoint: Checkpoint, reply: Reply<String> },
    GetCheckpoint { id: String, reply: Reply<Option<Checkpoint>> },
    UpdateCheckpoint { checkpoint: Checkpoint, reply: Reply<()> },
    DeleteCheckpoint { id: String, reply: Reply<()> },
    ListCheckpoints { reply: Reply<Vec<Checkpoint>> },

    // === Criterion results ===
    ListCriteria { task_id: String, reply: Reply<Vec<CriterionResult>> },

    // === Observability rows ===
    AppendTranscript { entry: TranscriptEntry, reply: Reply<()> },
    AppendToolUse { entry: ToolUseEntry, reply: Reply<()> },
    AppendAssertion { chain: AssertionChain, reply: Reply<()> },
    AppendSkillTrace { trace: SkillTrace, reply: Reply<()> },
    ListTranscript { run_id: String, reply: Reply<Vec<TranscriptEntry>> },
    ListToolUses { run_id: String, reply: Reply<Vec<ToolUseEntry>> },
    ListAssertions { run_id: String, reply: Reply<Vec<AssertionChain>> },
    ListSkillTraces { run_id: String, reply: Reply<Vec<SkillTrace>> },

    // === Resource claims ===
    CreateClaim { claim: crate::registry::ResourceClaim, reply: Reply<String> },
    GetClaim { resource: String, reply: Reply<Option<crate::registry::ResourceClaim>> },
    ReleaseClaimsForRun { run_id: String, reply: Reply<usize> },

    // === Misc ===
    AllocateSlot { scope: String, label: String, reply: Reply<u32> },
    Shutdown,
}
