//! The context handle (part of C2) passed as the first argument to a test
//! function, and the `TestHandle` returned by `test()`.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::engine::Engine;
use crate::node::{Directive, Node, TestOptions};
use crate::testfn::{TestFailure, TestFn};

/// Handle returned by `test()`. Settles with no value once the test reaches
/// `Reported`; per §6 it never rejects — failures are surfaced via TAP, not
/// via this handle.
pub struct TestHandle {
    rx: oneshot::Receiver<()>,
}

impl std::future::Future for TestHandle {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::future::Future;
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            std::task::Poll::Ready(_) => std::task::Poll::Ready(()),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

pub(crate) fn reported_channel() -> (oneshot::Sender<()>, TestHandle) {
    let (tx, rx) = oneshot::channel();
    (tx, TestHandle { rx })
}

/// The handle passed to every user test function.
///
/// Cloneable so a test body can move it into a spawned detached future
/// (see [`Context::spawn_detached`]) while still calling `diagnostic`/`test`
/// from its own synchronous continuation.
#[derive(Clone)]
pub struct Context {
    pub(crate) node: Arc<Node>,
    pub(crate) root: Arc<Node>,
    pub(crate) engine: Arc<Engine>,
}

impl Context {
    pub(crate) fn new(node: Arc<Node>, root: Arc<Node>, engine: Arc<Engine>) -> Self {
        Self { node, root, engine }
    }

    /// Appends a diagnostic line to this node. Never fails; silently
    /// dropped (with a router-fed note at the root) if this node has
    /// already been Reported.
    pub async fn diagnostic(&self, msg: impl Into<String>) {
        let mut state = self.node.state.lock().expect("node state poisoned");
        if state.phase == crate::node::Phase::Reported {
            drop(state);
            let mut root_state = self.root.state.lock().expect("node state poisoned");
            root_state
                .diagnostics
                .push(format!("diagnostic() after report: {}", msg.into()));
            return;
        }
        state.diagnostics.push(msg.into());
    }

    /// Marks this test Skipped, if it's still Pending or Running. Does not
    /// interrupt the user function (§4.2). The first non-empty reason
    /// across repeated calls wins (§8 idempotence); later calls are
    /// recorded as diagnostics only.
    pub async fn skip(&self, reason: impl Into<Directive>) {
        self.set_directive_once(reason.into(), true).await;
    }

    /// Marks this test Todo. A later failure will not fail the parent, but
    /// is still annotated in TAP (§4.2).
    pub async fn todo(&self, reason: impl Into<Directive>) {
        self.set_directive_once(reason.into(), false).await;
    }

    async fn set_directive_once(&self, reason: Directive, is_skip: bool) {
        let mut state = self.node.state.lock().expect("node state poisoned");
        if state.phase == crate::node::Phase::Reported {
            drop(state);
            let mut root_state = self.root.state.lock().expect("node state poisoned");
            root_state
                .diagnostics
                .push("skip()/todo() called after report; ignored".to_string());
            return;
        }

        // Per §9: once a thrown/rejected/callback-signalled failure has set
        // this node's verdict, a later skip()/todo() is recorded only as a
        // diagnostic — it does not retroactively turn a fail into an ok.
        if matches!(state.verdict, Some(crate::node::Verdict::Fail(_))) {
            let label = if is_skip { "skip" } else { "todo" };
            state
                .diagnostics
                .push(format!("{label}() called after failure was recorded; ignored"));
            return;
        }

        // Only a slot that already carries a reason blocks a later call: a
        // bare `skip(true)`/`todo(true)` with no reason string yet is still
        // open to being upgraded by a later `skip("actual reason")` — the
        // first *non-empty* reason wins, not merely the first call (§9).
        let slot = if is_skip { &mut state.skip } else { &mut state.todo };
        if matches!(slot, Directive::Reason(_)) {
            let label = if is_skip { "skip" } else { "todo" };
            state
                .diagnostics
                .push(format!("{label}() called again; first reason kept"));
        } else {
            *slot = reason;
        }
    }

    /// Creates a child test. Returns a handle that settles once the child
    /// reaches Reported.
    ///
    /// If this node has already finished its own body (`finished == true`,
    /// i.e. it is Settling or Reported), the child is *late*: it is
    /// immediately forced to `Fail("created too late")` and reparented to
    /// the file root for emission (§3 invariant 3, §4.5 late-arrival
    /// policy). Its body is not invoked.
    pub fn test(
        &self,
        name: impl Into<String>,
        options: TestOptions,
        body: TestFn,
    ) -> TestHandle {
        crate::runner::spawn_child(self, name.into(), options, body)
    }

    /// Fires-and-forgets a future the owning test does not intend to await.
    ///
    /// Models the "unhandled rejection" side of C6: if `fut` later produces
    /// an error (or panics), the failure is routed by
    /// [`crate::fault::FaultRouter`] to whichever single test is currently
    /// Running, or to the file root if that's ambiguous or this test has
    /// already settled.
    pub fn spawn_detached<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => engine.fault.report_extraneous(failure.0).await,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "detached task panicked".to_string());
                    engine.fault.report_extraneous(message).await
                }
            }
        });
    }

    pub fn name(&self) -> &str {
        &self.node.id.name
    }
}

// Re-exported so callers can name the boxed-future type this module's
// operations return without reaching into `futures` directly.
pub type Boxed<T> = BoxFuture<'static, T>;
