//! `MultiUserCRDT`: per-document replica combining operation history,
//! vector clock, content, and event emission (spec §4.3).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::operation::{Operation, OperationType};
use crate::transform::OperationTransformer;
use crate::vector_clock::VectorClock;

/// Configuration knobs enumerated in spec §4.3.
#[derive(Debug, Clone)]
pub struct CrdtConfig {
    pub initial_content: String,
    pub max_operations_history: usize,
    pub enable_conflict_resolution: bool,
    pub user_priority: i64,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            initial_content: String::new(),
            max_operations_history: 1000,
            enable_conflict_resolution: true,
            user_priority: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentState {
    pub content: String,
    pub operations: Vec<Operation>,
    pub vector_clock: VectorClock,
    pub version: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub operations: Vec<Operation>,
    pub position: usize,
    pub resolution: ConflictResolution,
    pub resolved_operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Timestamp,
    UserPriority,
    Manual,
}

/// Payload delivered to `change` subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operations: Vec<Operation>,
    pub content: String,
}

/// Payload delivered to `cursor` subscribers.
#[derive(Debug, Clone)]
pub struct CursorEvent {
    pub user_id: String,
    pub position: usize,
}

type ChangeHandler = Box<dyn Fn(&ChangeEvent) + Send + Sync>;
type ConflictHandler = Box<dyn Fn(&Conflict) + Send + Sync>;
type CursorHandler = Box<dyn Fn(&CursorEvent) + Send + Sync>;

/// Handle returned from `on_change`/`on_conflict`/`on_cursor`; pass it to
/// the matching `remove_*_handler` to deregister (the disposer pattern
/// from spec §4.3, expressed without shared interior mutability).
pub type SubscriptionId = Uuid;

/// Per-document replica. Single-threaded cooperative ownership: callers
/// must not mutate the same instance from two threads concurrently
/// (spec §5).
pub struct MultiUserCRDT {
    user_id: String,
    config: CrdtConfig,
    content: String,
    /// Content as of the oldest operation still retained in `history`.
    /// Advanced forward whenever `trim_history` drops a prefix, so
    /// rebuilds never need the trimmed operations again.
    base_content: String,
    history: Vec<Operation>,
    operation_ids: HashSet<String>,
    pending: VecDeque<Operation>,
    clock: VectorClock,
    next_timestamp: u64,

    change_handlers: Vec<(Uuid, ChangeHandler)>,
    conflict_handlers: Vec<(Uuid, ConflictHandler)>,
    cursor_handlers: Vec<(Uuid, CursorHandler)>,
    metrics: Option<Arc<Metrics>>,
}

impl MultiUserCRDT {
    pub fn new(user_id: impl Into<String>, config: CrdtConfig) -> Self {
        let content = config.initial_content.clone();
        let base_content = content.clone();
        Self {
            user_id: user_id.into(),
            config,
            content,
            base_content,
            history: Vec::new(),
            operation_ids: HashSet::new(),
            pending: VecDeque::new(),
            clock: VectorClock::new(),
            next_timestamp: 1,
            change_handlers: Vec::new(),
            conflict_handlers: Vec::new(),
            cursor_handlers: Vec::new(),
            metrics: None,
        }
    }

    /// Attaches a shared `Metrics` sink so every detected conflict is also
    /// counted there, in addition to being delivered to `conflict`
    /// subscribers. Optional: a replica with no embedder-supplied sink
    /// just emits events as before.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Stamp, append, resort, rebuild, advance the local clock, trim,
    /// and emit `change`. Idempotent on a known id.
    pub fn apply_local_operation(&mut self, mut op: Operation) {
        op.user_id = self.user_id.clone();
        if op.id.is_empty() {
            op.id = Uuid::new_v4().to_string();
        }
        if op.timestamp == 0 {
            op.timestamp = self.next_timestamp;
        }
        self.next_timestamp = self.next_timestamp.max(op.timestamp) + 1;

        if self.operation_ids.contains(&op.id) {
            return;
        }

        self.operation_ids.insert(op.id.clone());
        self.history.push(op.clone());
        self.pending.push_back(op.clone());

        self.sort_history();
        self.rebuild_content();
        self.clock.increment(&self.user_id);
        self.trim_history();

        self.emit_change(vec![op]);
    }

    /// Append a remote operation if unknown. Returns `false` if the id
    /// was already applied (idempotent no-op).
    pub fn apply_remote_operation(&mut self, op: Operation) -> bool {
        if self.operation_ids.contains(&op.id) {
            return false;
        }

        self.operation_ids.insert(op.id.clone());
        self.history.push(op.clone());

        self.sort_history();
        self.rebuild_content();
        self.clock.increment(&op.user_id);

        if self.config.enable_conflict_resolution {
            self.detect_conflicts(&op);
        }

        self.trim_history();
        self.emit_change(vec![op]);
        true
    }

    pub fn get_content(&self) -> &str {
        &self.content
    }

    pub fn get_operations(&self) -> &[Operation] {
        &self.history
    }

    pub fn get_vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn get_pending_operations(&self) -> Vec<Operation> {
        self.pending.iter().cloned().collect()
    }

    pub fn clear_pending_operations(&mut self) {
        self.pending.clear();
    }

    /// Operations whose timestamp exceeds `other`'s recorded count for
    /// their originating user.
    pub fn generate_diff(&self, other: &VectorClock) -> Vec<Operation> {
        self.history
            .iter()
            .filter(|op| op.timestamp > other.get(&op.user_id))
            .cloned()
            .collect()
    }

    /// Merge clocks, then apply every operation from `other` not yet
    /// known locally.
    pub fn merge(&mut self, other_operations: &[Operation], other_clock: &VectorClock) {
        self.clock.merge(other_clock);
        for op in other_operations {
            if !self.operation_ids.contains(&op.id) {
                self.apply_remote_operation(op.clone());
            }
        }
    }

    /// Fold a cursor position through every operation from a different
    /// user, in history order.
    pub fn transform_cursor(&self, position: usize, from_user_id: &str) -> usize {
        let mut pos = position;
        for op in &self.history {
            if op.user_id != from_user_id {
                pos = OperationTransformer::transform_cursor_position(pos, op);
            }
        }
        pos
    }

    pub fn get_state(&self) -> DocumentState {
        DocumentState {
            content: self.content.clone(),
            operations: self.history.clone(),
            vector_clock: self.clock.clone(),
            version: self.history.len(),
        }
    }

    pub fn set_state(&mut self, state: DocumentState) {
        self.content = state.content;
        self.base_content = self.config.initial_content.clone();
        self.operation_ids = state.operations.iter().map(|op| op.id.clone()).collect();
        self.history = state.operations;
        self.clock = state.vector_clock;
        self.sort_history();
        self.rebuild_content();
    }

    pub fn on_change<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.change_handlers.push((id, Box::new(handler)));
        id
    }

    pub fn remove_change_handler(&mut self, id: SubscriptionId) {
        self.change_handlers.retain(|(hid, _)| *hid != id);
    }

    pub fn on_conflict<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&Conflict) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.conflict_handlers.push((id, Box::new(handler)));
        id
    }

    pub fn remove_conflict_handler(&mut self, id: SubscriptionId) {
        self.conflict_handlers.retain(|(hid, _)| *hid != id);
    }

    pub fn on_cursor<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&CursorEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.cursor_handlers.push((id, Box::new(handler)));
        id
    }

    pub fn remove_cursor_handler(&mut self, id: SubscriptionId) {
        self.cursor_handlers.retain(|(hid, _)| *hid != id);
    }

    pub fn emit_cursor(&self, event: CursorEvent) {
        for (_, handler) in &self.cursor_handlers {
            call_handler_safely(handler, &event);
        }
    }

    fn emit_change(&self, operations: Vec<Operation>) {
        let event = ChangeEvent {
            operations,
            content: self.content.clone(),
        };
        for (_, handler) in &self.change_handlers {
            call_handler_safely(handler, &event);
        }
    }

    fn emit_conflict(&self, conflict: Conflict) {
        if let Some(metrics) = &self.metrics {
            metrics.record_conflict();
        }
        for (_, handler) in &self.conflict_handlers {
            call_handler_safely(handler, &conflict);
        }
    }

    /// Canonical order: (timestamp ascending, user_id ascending). Stable
    /// sort so equal keys preserve arrival order.
    fn sort_history(&mut self) {
        self.history
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.user_id.cmp(&b.user_id)));
    }

    /// Rebuild content from scratch: walk the sorted history, transform
    /// each operation against everything already applied, then apply it.
    /// Deterministic on every replica that has seen the same operations.
    fn rebuild_content(&mut self) {
        let mut content = self.base_content.clone();
        let mut applied: Vec<Operation> = Vec::with_capacity(self.history.len());

        for op in &self.history {
            match OperationTransformer::transform_operation_against_operations(op, &applied) {
                Some(transformed) => {
                    apply_to_content(&mut content, &transformed);
                    applied.push(transformed);
                }
                None => {
                    // DELETE collapsed to zero length: skip application,
                    // but it still occupies a slot other operations must
                    // transform against.
                    applied.push(op.clone());
                }
            }
        }

        self.content = content;
    }

    fn detect_conflicts(&self, new_op: &Operation) {
        for prior in &self.history {
            if prior.id == new_op.id || prior.user_id == new_op.user_id {
                continue;
            }
            if operations_overlap(prior, new_op) {
                let winner = if prior.timestamp != new_op.timestamp {
                    if prior.timestamp < new_op.timestamp {
                        prior
                    } else {
                        new_op
                    }
                } else if prior.user_id < new_op.user_id {
                    prior
                } else {
                    new_op
                };

                self.emit_conflict(Conflict {
                    operations: vec![prior.clone(), new_op.clone()],
                    position: new_op.position(),
                    resolution: ConflictResolution::Timestamp,
                    resolved_operation: winner.clone(),
                });
            }
        }
    }

    /// Fold the oldest operations into `base_content` and forget their
    /// ids once history exceeds the configured window. The dropped
    /// prefix is exactly the start of the canonical sort order, so
    /// transforming each against only the ones already folded reproduces
    /// what `rebuild_content` would have done with them in place.
    fn trim_history(&mut self) {
        let max = self.config.max_operations_history;
        if self.history.len() <= max {
            return;
        }

        let overflow = self.history.len() - max;
        let drained: Vec<Operation> = self.history.drain(0..overflow).collect();
        let mut applied: Vec<Operation> = Vec::with_capacity(drained.len());

        for op in drained {
            match OperationTransformer::transform_operation_against_operations(&op, &applied) {
                Some(transformed) => {
                    apply_to_content(&mut self.base_content, &transformed);
                    self.operation_ids.remove(&op.id);
                    applied.push(transformed);
                }
                None => {
                    self.operation_ids.remove(&op.id);
                    applied.push(op);
                }
            }
        }
    }
}

/// Invoke a handler, logging and swallowing a panic instead of letting
/// it abort delivery to the remaining handlers (spec §4.3: "exceptions
/// in a handler are logged but do not abort delivery to other handlers").
fn call_handler_safely<T>(handler: &(dyn Fn(&T) + Send + Sync), event: &T) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("event handler panicked: {}", message);
    }
}

fn operations_overlap(a: &Operation, b: &Operation) -> bool {
    match (&a.operation_type, &b.operation_type) {
        (OperationType::Delete { position: p1, length: l1 }, OperationType::Delete { position: p2, length: l2 }) => {
            p1 < &(p2 + l2) && p2 < &(p1 + l1)
        }
        (OperationType::Insert { position: ip, .. }, OperationType::Delete { position: dp, length: dl })
        | (OperationType::Delete { position: dp, length: dl }, OperationType::Insert { position: ip, .. }) => {
            *ip > *dp && *ip < dp + dl
        }
        _ => false,
    }
}

fn apply_to_content(content: &mut String, op: &Operation) {
    match &op.operation_type {
        OperationType::Insert { position, content: text } => {
            let byte_idx = char_to_byte_index(content, *position);
            content.insert_str(byte_idx, text);
        }
        OperationType::Delete { position, length } => {
            let start = char_to_byte_index(content, *position);
            let end = char_to_byte_index(content, position + length);
            content.replace_range(start..end, "");
        }
        OperationType::Retain { .. } | OperationType::Format { .. } => {}
    }
}

fn char_to_byte_index(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}
