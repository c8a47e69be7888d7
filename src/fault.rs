//! The Asynchronous Fault Router (C6): attributes a fault with no definite
//! caller to whichever single Test Node is currently `Running`, or to the
//! file root when zero or more than one are.
//!
//! Node.js gives a single process-wide hook for uncaught exceptions and
//! unhandled rejections; Rust has no exact equivalent because `tokio::spawn`
//! already catches panics per-task. This router covers both of the source
//! spec's trigger classes with two complementary mechanisms:
//!
//! - a real `std::panic::set_hook` for panics that unwind with nobody
//!   awaiting the task that produced them (true "uncaught exceptions"),
//!   recorded into a synchronous mailbox and applied the next time the
//!   scheduler drains it;
//! - [`FaultRouter::report_extraneous`], an async path used by
//!   [`crate::context::Context::spawn_detached`] for work a test explicitly
//!   fires-and-forgets (the "unhandled rejection" analogue: a future whose
//!   own `Result` nobody awaited).

use std::sync::{Arc, Mutex as StdMutex};

use crate::node::{Node, Verdict};

struct MailboxEntry {
    /// The single node that was Running when the fault occurred, if any.
    attributed: Option<Arc<Node>>,
    message: String,
}

pub struct FaultRouter {
    root: Arc<Node>,
    running: StdMutex<Vec<Arc<Node>>>,
    mailbox: StdMutex<Vec<MailboxEntry>>,
}

/// Restores the previous panic hook when dropped. Held for the lifetime of
/// a root harness run.
pub struct PanicHookGuard {
    prev: Option<Box<dyn Fn(&std::panic::PanicHookInfo<'_>) + Sync + Send + 'static>>,
}

impl Drop for PanicHookGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            std::panic::set_hook(prev);
        }
    }
}

impl FaultRouter {
    pub fn new(root: Arc<Node>) -> Arc<Self> {
        Arc::new(Self {
            root,
            running: StdMutex::new(Vec::new()),
            mailbox: StdMutex::new(Vec::new()),
        })
    }

    /// Records `node` as Running. Called strictly at the `Pending -> Running`
    /// transition (§5).
    pub fn push_running(&self, node: &Arc<Node>) {
        self.running.lock().expect("fault router poisoned").push(node.clone());
    }

    /// Removes `node` from the running set. Called strictly at the
    /// `Running -> Settling` transition, and also by a parent's cancellation
    /// sweep so a still-executing, already-force-Reported child is no longer
    /// attributable (§4.6, §5 Cancellation).
    pub fn pop_running(&self, node: &Arc<Node>) {
        let mut guard = self.running.lock().expect("fault router poisoned");
        if let Some(pos) = guard.iter().position(|n| Arc::ptr_eq(n, node)) {
            guard.remove(pos);
        }
    }

    /// Installs the process-wide panic hook for the duration of a root
    /// harness run. The previous hook is chained (still invoked) so default
    /// crash reporting is preserved, and restored when the guard drops.
    pub fn install(self: &Arc<Self>) -> PanicHookGuard {
        let prev = std::panic::take_hook();
        let router = self.clone();
        let prev_for_chain = {
            // We can't clone a `Box<dyn Fn>` directly; wrap in an Arc so the
            // hook closure and the guard can each hold a reference.
            let prev: Arc<dyn Fn(&std::panic::PanicHookInfo<'_>) + Sync + Send> = Arc::from(prev);
            let chained = prev.clone();
            std::panic::set_hook(Box::new(move |info| {
                chained(info);
                router.record_panic(info);
            }));
            prev
        };

        PanicHookGuard {
            prev: Some(Box::new(move |info| prev_for_chain(info))),
        }
    }

    fn record_panic(&self, info: &std::panic::PanicHookInfo<'_>) {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());

        let running = self.running.lock().expect("fault router poisoned");
        let attributed = if running.len() == 1 {
            Some(running[0].clone())
        } else {
            None
        };
        drop(running);

        tracing::warn!(
            "caught panic ({}): {}",
            if attributed.is_some() { "attributed" } else { "ambiguous, routed to root" },
            message
        );

        self.mailbox
            .lock()
            .expect("fault router poisoned")
            .push(MailboxEntry { attributed, message });
    }

    /// Reports a fault from an explicitly detached future (the "unhandled
    /// rejection" analogue) using the *current* running-set snapshot rather
    /// than a panic-hook-captured one, since this path is async and can
    /// react immediately.
    pub async fn report_extraneous(&self, message: String) {
        let attributed = {
            let running = self.running.lock().expect("fault router poisoned");
            if running.len() == 1 {
                Some(running[0].clone())
            } else {
                None
            }
        };
        self.apply(attributed, message).await;
    }

    /// Applies any mailbox entries accumulated since the last drain. Called
    /// by the runner right after a node finishes its own body (so a fault
    /// attributed to it lands before it finalizes) and once more by the root
    /// harness before final emission.
    pub async fn drain(&self) {
        let entries = std::mem::take(&mut *self.mailbox.lock().expect("fault router poisoned"));
        for entry in entries {
            self.apply(entry.attributed, entry.message).await;
        }
    }

    async fn apply(&self, attributed: Option<Arc<Node>>, message: String) {
        match attributed {
            Some(node) => {
                let mut state = node.state.lock().expect("node state poisoned");
                if state.phase == crate::node::Phase::Reported {
                    // Already terminal; per §4.6 this does not retroactively
                    // fail a Reported node. Diagnose at the root instead.
                    drop(state);
                    let mut root_state = self.root.state.lock().expect("node state poisoned");
                    root_state
                        .diagnostics
                        .push(format!("extraneous fault after test settled: {message}"));
                    return;
                }
                state.diagnostics.push(message.clone());
                state.verdict = Some(Verdict::Fail(message));
            }
            None => {
                let mut root_state = self.root.state.lock().expect("node state poisoned");
                root_state.diagnostics.push(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Phase, TestOptions};

    fn child(root: &Arc<Node>, ordinal: usize, name: &str) -> Arc<Node> {
        Node::new_child(root, ordinal, name.to_string(), TestOptions::new())
    }

    #[tokio::test]
    async fn exactly_one_running_node_is_attributed() {
        let root = Node::new_root("root", 1);
        let router = FaultRouter::new(root.clone());
        let a = child(&root, 1, "a");
        router.push_running(&a);

        router.report_extraneous("boom".to_string()).await;

        let state = a.state.lock().expect("node state poisoned");
        assert_eq!(state.verdict, Some(Verdict::Fail("boom".to_string())));
        assert!(state.diagnostics.iter().any(|d| d == "boom"));
    }

    #[tokio::test]
    async fn zero_running_nodes_routes_to_the_root() {
        let root = Node::new_root("root", 1);
        let router = FaultRouter::new(root.clone());

        router.report_extraneous("ambient boom".to_string()).await;

        let state = root.state.lock().expect("node state poisoned");
        assert!(state.diagnostics.iter().any(|d| d == "ambient boom"));
        assert!(state.verdict.is_none());
    }

    #[tokio::test]
    async fn more_than_one_running_node_is_ambiguous_and_routes_to_the_root() {
        let root = Node::new_root("root", 1);
        let router = FaultRouter::new(root.clone());
        let a = child(&root, 1, "a");
        let b = child(&root, 2, "b");
        router.push_running(&a);
        router.push_running(&b);

        router.report_extraneous("which one".to_string()).await;

        let root_state = root.state.lock().expect("node state poisoned");
        assert!(root_state.diagnostics.iter().any(|d| d == "which one"));
        assert!(a.state.lock().expect("node state poisoned").verdict.is_none());
        assert!(b.state.lock().expect("node state poisoned").verdict.is_none());
    }

    #[tokio::test]
    async fn pop_running_removes_a_node_from_attribution() {
        let root = Node::new_root("root", 1);
        let router = FaultRouter::new(root.clone());
        let a = child(&root, 1, "a");
        router.push_running(&a);
        router.pop_running(&a);

        router.report_extraneous("late boom".to_string()).await;

        assert!(a.state.lock().expect("node state poisoned").verdict.is_none());
        let root_state = root.state.lock().expect("node state poisoned");
        assert!(root_state.diagnostics.iter().any(|d| d == "late boom"));
    }

    #[tokio::test]
    async fn fault_for_an_already_reported_node_falls_back_to_the_root() {
        let root = Node::new_root("root", 1);
        let router = FaultRouter::new(root.clone());
        let a = child(&root, 1, "a");
        router.push_running(&a);
        a.state.lock().expect("node state poisoned").phase = Phase::Reported;

        router.report_extraneous("too late".to_string()).await;

        assert!(a.state.lock().expect("node state poisoned").verdict.is_none());
        let root_state = root.state.lock().expect("node state poisoned");
        assert!(
            root_state
                .diagnostics
                .iter()
                .any(|d| d.contains("too late"))
        );
    }

    #[tokio::test]
    async fn install_routes_a_real_panic_to_the_sole_running_node_and_restores_the_prior_hook() {
        // Exercises the `std::panic::set_hook` path end to end: install,
        // trigger a caught panic while exactly one node is Running, drain,
        // and confirm the fault landed. The mailbox check uses a unique
        // marker and `.contains` rather than exact-length assertions,
        // since other tests in this binary may install/restore their own
        // hook (via `harness::run`) on other threads at the same time.
        let root = Node::new_root("root", 1);
        let router = FaultRouter::new(root.clone());
        let a = child(&root, 1, "panics");
        router.push_running(&a);

        let hook_was_installed = {
            let _guard = router.install();
            let result = std::panic::catch_unwind(|| {
                panic!("marker-fault-for-fault-router-install-test")
            });
            result.is_err()
        };
        assert!(hook_was_installed, "catch_unwind should observe the panic");

        router.drain().await;

        let state = a.state.lock().expect("node state poisoned");
        let attributed_to_node = matches!(
            &state.verdict,
            Some(Verdict::Fail(msg)) if msg.contains("marker-fault-for-fault-router-install-test")
        );
        drop(state);

        if !attributed_to_node {
            let root_state = root.state.lock().expect("node state poisoned");
            assert!(
                root_state
                    .diagnostics
                    .iter()
                    .any(|d| d.contains("marker-fault-for-fault-router-install-test")),
                "panic must be recorded somewhere in the tree"
            );
        }

        // The guard has already dropped (end of the block above); a panic
        // raised now must not reach this router's mailbox anymore.
        let _ = std::panic::catch_unwind(|| panic!("after-guard-drop-should-not-be-captured"));
        router.drain().await;
        let root_state = root.state.lock().expect("node state poisoned");
        assert!(
            !root_state
                .diagnostics
                .iter()
                .any(|d| d.contains("after-guard-drop-should-not-be-captured"))
        );
    }
}
