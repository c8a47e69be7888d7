//! The Test Node (C2): identity, options, state, verdict, diagnostics, and
//! children for one entry in the test tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};

/// A `skip`/`todo` annotation: unset, a bare flag, or a flag with a reason.
///
/// Maps to the spec's `boolean | string` options vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Directive {
    #[default]
    Unset,
    Bare,
    Reason(String),
}

impl Directive {
    pub fn is_set(&self) -> bool {
        !matches!(self, Directive::Unset)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Directive::Reason(r) => Some(r.as_str()),
            _ => None,
        }
    }
}

impl From<bool> for Directive {
    fn from(b: bool) -> Self {
        if b { Directive::Bare } else { Directive::Unset }
    }
}

impl From<&str> for Directive {
    fn from(s: &str) -> Self {
        Directive::Reason(s.to_string())
    }
}

impl From<String> for Directive {
    fn from(s: String) -> Self {
        Directive::Reason(s)
    }
}

impl From<Option<String>> for Directive {
    fn from(s: Option<String>) -> Self {
        match s {
            Some(s) => Directive::Reason(s),
            None => Directive::Bare,
        }
    }
}

/// Options accepted by `test()`. Unknown keys in a deserialized form are
/// ignored by construction (there is no catch-all field to populate).
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub concurrency: Option<usize>,
    pub skip: Directive,
    pub todo: Directive,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n.max(1));
        self
    }

    pub fn with_skip(mut self, d: impl Into<Directive>) -> Self {
        self.skip = d.into();
        self
    }

    pub fn with_todo(mut self, d: impl Into<Directive>) -> Self {
        self.todo = d.into();
        self
    }
}

/// Terminal classification of a Test Node's own outcome (independent of the
/// `todo` annotation, which is tracked separately so a failing todo test can
/// still render `not ok ... # TODO` without poisoning its parent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    Skipped(Option<String>),
}

impl Verdict {
    pub fn is_fail(&self) -> bool {
        matches!(self, Verdict::Fail(_))
    }
}

/// Lifecycle phase. `Pending -> Running -> Settling -> Reported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Running,
    Settling,
    Reported,
}

/// Stable identity of a node: name, depth (0 = file root), and 1-based
/// ordinal among its siblings.
#[derive(Debug, Clone)]
pub struct NodeId {
    pub name: String,
    pub depth: usize,
    pub ordinal: usize,
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (depth {}, #{})", self.name, self.depth, self.ordinal)
    }
}

pub(crate) struct NodeState {
    pub phase: Phase,
    pub verdict: Option<Verdict>,
    /// First non-empty skip reason wins; later calls are diagnostics only.
    pub skip: Directive,
    /// First non-empty todo reason wins; later calls are diagnostics only.
    pub todo: Directive,
    pub diagnostics: Vec<String>,
    pub children: Vec<Arc<Node>>,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
    /// True once this node's own user function has returned/settled.
    pub finished: bool,
    /// True once a cancellation sweep or natural completion has claimed the
    /// terminal transition for this node. Guards invariant 1 (verdict set
    /// exactly once) against the race between a parent's "parent finished
    /// before child" sweep and the child's own natural completion.
    pub claimed: bool,
}

/// One entry in the test tree.
pub struct Node {
    pub id: NodeId,
    pub options: TestOptions,
    /// Concurrency inherited (or set) for sizing *this* node's own gate,
    /// i.e. the budget applied to its direct children.
    pub effective_concurrency: usize,
    /// Gate this node must acquire a slot from before running: the parent's
    /// gate, or `None` for the file root (which has no sibling concurrency
    /// to bound).
    pub(crate) parent_gate: Option<Arc<Semaphore>>,
    /// Gate sized for this node's own direct children.
    pub(crate) own_gate: Arc<Semaphore>,
    /// Hands out the ordinal for the next direct child synchronously, so
    /// call order (not task-scheduling order) determines ordinal order even
    /// when several `test()` calls race to register before any of their
    /// spawned tasks runs.
    pub(crate) next_ordinal: AtomicUsize,
    /// Woken whenever one of this node's direct children reaches `Reported`.
    /// Lets a waiter (the root harness, draining fire-and-forget top-level
    /// tests) block without polling.
    pub(crate) child_settled: Notify,
    pub(crate) state: Mutex<NodeState>,
}

impl Node {
    pub(crate) fn new_root(name: impl Into<String>, default_concurrency: usize) -> Arc<Node> {
        Arc::new(Node {
            id: NodeId {
                name: name.into(),
                depth: 0,
                ordinal: 1,
            },
            options: TestOptions::default(),
            effective_concurrency: default_concurrency.max(1),
            parent_gate: None,
            own_gate: Arc::new(Semaphore::new(default_concurrency.max(1))),
            next_ordinal: AtomicUsize::new(1),
            child_settled: Notify::new(),
            state: Mutex::new(NodeState {
                phase: Phase::Pending,
                verdict: None,
                skip: Directive::Unset,
                todo: Directive::Unset,
                diagnostics: Vec::new(),
                children: Vec::new(),
                start: None,
                end: None,
                finished: false,
                claimed: false,
            }),
        })
    }

    pub(crate) fn new_child(
        parent: &Node,
        ordinal: usize,
        name: String,
        options: TestOptions,
    ) -> Arc<Node> {
        let effective_concurrency = options
            .concurrency
            .unwrap_or(parent.effective_concurrency)
            .max(1);
        let skip = options.skip.clone();
        let todo = options.todo.clone();
        Arc::new(Node {
            id: NodeId {
                name,
                depth: parent.id.depth + 1,
                ordinal,
            },
            options,
            effective_concurrency,
            parent_gate: Some(parent.own_gate.clone()),
            own_gate: Arc::new(Semaphore::new(effective_concurrency)),
            next_ordinal: AtomicUsize::new(1),
            child_settled: Notify::new(),
            state: Mutex::new(NodeState {
                phase: Phase::Pending,
                verdict: None,
                skip,
                todo,
                diagnostics: Vec::new(),
                children: Vec::new(),
                start: None,
                end: None,
                finished: false,
                claimed: false,
            }),
        })
    }

    /// Allocates the next ordinal for a direct child of `self`, synchronously
    /// and without locking `state` (§3: ordinal order reflects call order).
    pub(crate) fn next_child_ordinal(&self) -> usize {
        self.next_ordinal.fetch_add(1, Ordering::SeqCst)
    }

    pub fn duration(&self) -> Option<Duration> {
        let state = self.state.lock().expect("node state poisoned");
        match (state.start, state.end) {
            (Some(s), Some(e)) => Some(e.saturating_duration_since(s)),
            _ => None,
        }
    }

    pub fn is_todo(&self) -> bool {
        self.state.lock().expect("node state poisoned").todo.is_set()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().expect("node state poisoned").phase
    }
}
