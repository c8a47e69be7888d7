//! The Runner/Scheduler (C5): drives a single Test Node's lifecycle —
//! concurrency gate, phase transitions, completion detection, child
//! cancellation, and verdict aggregation.

use std::sync::Arc;

use crate::context::{Context, TestHandle, reported_channel};
use crate::node::{Node, Phase, TestOptions, Verdict};
use crate::testfn::TestFn;

/// Spawns `body` as a child of `ctx.node`, applying the late-arrival policy
/// from §3 invariant 3 / §4.5 when the parent has already finished its own
/// body.
pub(crate) fn spawn_child(
    ctx: &Context,
    name: String,
    options: TestOptions,
    body: TestFn,
) -> TestHandle {
    let parent = ctx.node.clone();
    let root = ctx.root.clone();
    let engine = ctx.engine.clone();
    let (tx, handle) = reported_channel();

    // Registration (late-arrival check, ordinal allocation, and linking
    // into the parent's `children`) happens synchronously, right here,
    // rather than inside the spawned task below. Both `finished` and the
    // ordinal counter are reachable without an `.await`, so two `test()`
    // calls made back to back without awaiting either handle still
    // register in call order rather than in whatever order the Tokio
    // scheduler happens to start their tasks.
    let late = parent.state.lock().expect("node state poisoned").finished;

    if late {
        let ordinal = root.next_child_ordinal();
        let child = Node::new_child(&root, ordinal, name, options);
        {
            let mut cs = child.state.lock().expect("node state poisoned");
            cs.phase = Phase::Reported;
            cs.claimed = true;
            cs.verdict = Some(Verdict::Fail("created too late".to_string()));
            cs.diagnostics.push(format!(
                "test '{}' was created after its intended parent had already finished; reparented to the file root",
                child.id.name
            ));
        }
        root.state.lock().expect("node state poisoned").children.push(child);
        root.child_settled.notify_waiters();
        let _ = tx.send(());
        return handle;
    }

    let ordinal = parent.next_child_ordinal();
    let child = Node::new_child(&parent, ordinal, name, options);
    parent
        .state
        .lock()
        .expect("node state poisoned")
        .children
        .push(child.clone());

    tokio::spawn(async move {
        run_node(engine, root, child.clone(), body).await;
        parent.child_settled.notify_waiters();
        let _ = tx.send(());
    });

    handle
}

/// Drives a single node from `Pending` through `Reported`.
async fn run_node(
    engine: Arc<crate::engine::Engine>,
    root: Arc<Node>,
    node: Arc<Node>,
    body: TestFn,
) {
    let _permit = match node.parent_gate.clone() {
        Some(gate) => Some(gate.acquire_owned().await.expect("gate semaphore closed")),
        None => None,
    };

    let skip_without_running = {
        let mut state = node.state.lock().expect("node state poisoned");
        state.phase = Phase::Running;
        state.start = Some(std::time::Instant::now());
        state.skip.is_set()
    };
    engine.fault.push_running(&node);
    tracing::debug!("{} started (ordinal {})", node.id.name, node.id.ordinal);

    let (verdict, mut extra_diags) = if skip_without_running {
        let reason = node.state.lock().expect("node state poisoned").skip.reason().map(str::to_string);
        (Verdict::Skipped(reason), Vec::new())
    } else {
        let child_ctx = Context::new(node.clone(), root.clone(), engine.clone());
        crate::testfn::complete(child_ctx, body).await
    };

    // Own body has settled: Running -> Settling. No longer attributable by
    // the fault router, and late children created from here on are routed
    // to the root instead of this node (§4.5).
    {
        let mut state = node.state.lock().expect("node state poisoned");
        state.phase = Phase::Settling;
        state.finished = true;
    }
    tracing::debug!("{} settling", node.id.name);
    engine.fault.pop_running(&node);
    engine.fault.drain().await;

    // Cooperative cancellation: any child still outstanding is force-failed
    // for bookkeeping/emission purposes without interrupting its own task
    // (§4.6, §5 Cancellation). `claimed` arbitrates the race against that
    // child's own natural completion.
    let outstanding = node.state.lock().expect("node state poisoned").children.clone();
    for child in &outstanding {
        let mut cs = child.state.lock().expect("node state poisoned");
        if cs.claimed {
            continue;
        }
        cs.claimed = true;
        if cs.verdict.is_none() {
            cs.verdict = Some(Verdict::Fail("parent finished before child".to_string()));
        }
        cs.phase = Phase::Reported;
        cs.end.get_or_insert_with(std::time::Instant::now);
    }

    let failed_child_count = count_failed_children(&outstanding).await;

    let mut state = node.state.lock().expect("node state poisoned");
    state.diagnostics.append(&mut extra_diags);

    let own_verdict = if failed_child_count > 0 && !verdict.is_fail() {
        let noun = if failed_child_count == 1 { "subtest" } else { "subtests" };
        Verdict::Fail(format!("{failed_child_count} {noun} failed"))
    } else {
        verdict
    };

    if !state.claimed {
        state.claimed = true;
        match &own_verdict {
            Verdict::Fail(msg) => tracing::warn!("{} failed: {}", node.id.name, msg),
            _ => tracing::debug!("{} settled: {:?}", node.id.name, own_verdict),
        }
        state.verdict = Some(own_verdict);
        state.end = Some(std::time::Instant::now());
    }
    state.phase = Phase::Reported;
}

async fn count_failed_children(children: &[Arc<Node>]) -> usize {
    let mut count = 0;
    for child in children {
        let cs = child.state.lock().expect("node state poisoned");
        let counts_against_parent = !cs.todo.is_set() && !cs.skip.is_set();
        if counts_against_parent && matches!(cs.verdict, Some(Verdict::Fail(_))) {
            count += 1;
        }
    }
    count
}
