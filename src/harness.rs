//! The Root Harness (C7): the explicit entry point a binary or test driver
//! calls to run a file's test tree to completion and render it as TAP.
//!
//! Node gives every script an implicit top-level `describe` scope for free;
//! Rust has no such ambient root, so callers construct one explicitly with
//! [`run`].

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::fault::FaultRouter;
use crate::node::{Node, Phase};

/// Outcome of a completed root run: the rendered TAP document plus enough
/// of a summary to decide a process exit code.
#[derive(Debug, Clone)]
pub struct Summary {
    pub tap: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    /// `0` if every test passed (or was skipped/todo), `1` otherwise —
    /// mirroring the conventional TAP harness exit code contract.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 { 0 } else { 1 }
    }

    /// Writes the rendered TAP document to `out`, e.g. a process's stdout.
    pub fn write_tap<W: std::io::Write>(&self, out: &mut W) -> EngineResult<()> {
        out.write_all(self.tap.as_bytes())
            .map_err(crate::error::EngineError::Io)
    }
}

/// Runs one file's worth of tests to completion.
///
/// `name` identifies the file root in diagnostics. `register` is handed the
/// root [`Context`] and is expected to call `ctx.test(...)` some number of
/// times; once it returns, this function waits for every test it registered
/// (whether or not `register` itself awaited their handles) to reach
/// `Reported` before rendering TAP — this is the harness draining the event
/// loop the way a real process would, not the cancellation sweep applied to
/// ordinary parents (§4.5: the file root never force-fails an outstanding
/// child just because registration finished).
pub async fn run<F>(name: impl Into<String>, config: EngineConfig, register: F) -> Summary
where
    F: FnOnce(Context) -> BoxFuture<'static, ()>,
{
    let root = Node::new_root(name, config.default_concurrency);
    let fault = FaultRouter::new(root.clone());
    let _hook_guard = fault.install();
    let engine = Engine::new(config, fault.clone());

    let root_ctx = Context::new(root.clone(), root.clone(), engine.clone());
    tracing::info!("running {}", root.id.name);
    register(root_ctx).await;

    root.state.lock().expect("node state poisoned").finished = true;

    loop {
        let notified = root.child_settled.notified();
        let children = root.state.lock().expect("node state poisoned").children.clone();
        if all_reported(&children).await {
            break;
        }
        notified.await;
    }

    fault.drain().await;

    {
        let mut state = root.state.lock().expect("node state poisoned");
        state.phase = Phase::Reported;
    }

    let mut buf = Vec::new();
    crate::tap::emit(&root, &mut buf, engine.config())
        .await
        .expect("writing to an in-memory buffer cannot fail");
    let tap = String::from_utf8(buf).expect("TAP output is always valid UTF-8");

    let summary = summarize(&root, tap).await;
    tracing::info!(
        "{}: {} passed, {} failed, {} skipped ({} total)",
        root.id.name,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.total
    );
    summary
}

async fn all_reported(children: &[Arc<Node>]) -> bool {
    for child in children {
        if child.state.lock().expect("node state poisoned").phase != Phase::Reported {
            return false;
        }
    }
    true
}

async fn summarize(root: &Node, tap: String) -> Summary {
    let mut total = 0;
    let mut passed = 0;
    let mut failed = 0;
    let mut skipped = 0;

    let children = root.state.lock().expect("node state poisoned").children.clone();
    for child in &children {
        tally(child, &mut total, &mut passed, &mut failed, &mut skipped).await;
    }

    Summary {
        tap,
        total,
        passed,
        failed,
        skipped,
    }
}

fn tally<'a>(
    node: &'a Node,
    total: &'a mut usize,
    passed: &'a mut usize,
    failed: &'a mut usize,
    skipped: &'a mut usize,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        use crate::node::Verdict;

        let state = node.state.lock().expect("node state poisoned");
        *total += 1;
        let counts_as_failure =
            matches!(&state.verdict, Some(Verdict::Fail(_))) && !state.todo.is_set() && !state.skip.is_set();
        if state.skip.is_set() || matches!(state.verdict, Some(Verdict::Skipped(_))) {
            *skipped += 1;
        } else if counts_as_failure {
            *failed += 1;
        } else {
            *passed += 1;
        }

        let children = state.children.clone();
        drop(state);
        for child in &children {
            tally(child, total, passed, failed, skipped).await;
        }
    })
}
