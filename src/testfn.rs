//! The Completion Detector (C3): classifies a user function's completion as
//! a synchronous throw, a promise settlement, or a callback invocation, and
//! yields a single [`Verdict`](crate::node::Verdict).
//!
//! Rust has no runtime arity inspection, so per §9 of the spec this crate
//! exposes three explicit constructors instead of reflecting on a function's
//! declared parameters: [`TestFn::sync`], [`TestFn::async_fn`], and
//! [`TestFn::callback`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::context::Context;
use crate::node::Verdict;

/// The reason a test failed. The engine only observes this value — it never
/// interprets assertion internals, matching the "assertion libraries are an
/// external collaborator" non-goal.
#[derive(Debug, Clone)]
pub struct TestFailure(pub String);

impl TestFailure {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestFailure {}

impl From<&str> for TestFailure {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TestFailure {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub type SyncResult = Result<(), TestFailure>;
pub type AsyncResult = Result<(), TestFailure>;

/// A single-shot completion callback, passed as the second argument to a
/// callback-mode test function.
///
/// Only the first invocation settles the test; later invocations are
/// recorded as a diagnostic on the owning node rather than causing a panic,
/// matching the spec's "subsequent invocations are ignored" rule.
#[derive(Clone)]
pub struct Done {
    tx: Arc<std::sync::Mutex<Option<oneshot::Sender<Option<TestFailure>>>>>,
    extra_calls: Arc<AtomicUsize>,
}

impl Done {
    fn new() -> (Self, oneshot::Receiver<Option<TestFailure>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(std::sync::Mutex::new(Some(tx))),
                extra_calls: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Invokes the callback. A falsy/`None` error means the test passed; a
    /// `Some` error means it failed. Only the first call has any effect.
    pub fn call(&self, err: Option<TestFailure>) {
        let mut guard = self.tx.lock().expect("Done mutex poisoned");
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(err);
            }
            None => {
                self.extra_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn extra_call_count(&self) -> usize {
        self.extra_calls.load(Ordering::SeqCst)
    }
}

/// The user function supplied to `test()`, in one of three completion
/// protocols.
pub enum TestFn {
    /// No body was supplied; verdict is `Pass` (§4.3.6).
    None,
    /// Plain synchronous body. A panic inside it is caught and treated as a
    /// synchronous throw.
    Sync(Box<dyn FnOnce(Context) -> SyncResult + Send>),
    /// A body that returns a future (the promise-mode protocol).
    Async(Box<dyn FnOnce(Context) -> BoxFuture<'static, AsyncResult> + Send>),
    /// A body that receives a [`Done`] callback. It may *also* return a
    /// future — doing so is the hard protocol-misuse contract in §4.3.5,
    /// modeled explicitly here since Rust's type system would otherwise
    /// rule it out entirely.
    Callback(
        Box<dyn FnOnce(Context, Done) -> Option<BoxFuture<'static, ()>> + Send>,
    ),
}

impl TestFn {
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(Context) -> SyncResult + Send + 'static,
    {
        TestFn::Sync(Box::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = AsyncResult> + Send + 'static,
    {
        TestFn::Async(Box::new(move |ctx| f(ctx).boxed()))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Context, Done) + Send + 'static,
    {
        TestFn::Callback(Box::new(move |ctx, done| {
            f(ctx, done);
            None
        }))
    }

    /// Constructs the hazard described in §4.3.5 directly: a callback-mode
    /// body that *also* returns a future. Exists so P7 is exercisable
    /// without relying on runtime reflection.
    pub fn callback_returning_future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Context, Done) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        TestFn::Callback(Box::new(move |ctx, done| Some(f(ctx, done).boxed())))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked with a non-string payload".to_string()
    }
}

/// Drives a user function to completion and classifies the result. Returns
/// the verdict plus any extra diagnostics the detector itself generated
/// (e.g. a callback invoked more than once).
pub(crate) async fn complete(ctx: Context, body: TestFn) -> (Verdict, Vec<String>) {
    match body {
        TestFn::None => (Verdict::Pass, Vec::new()),

        TestFn::Sync(f) => {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx))) {
                Ok(Ok(())) => (Verdict::Pass, Vec::new()),
                Ok(Err(failure)) => (Verdict::Fail(failure.0), Vec::new()),
                Err(panic) => (Verdict::Fail(panic_message(panic)), Vec::new()),
            }
        }

        TestFn::Async(f) => {
            let fut = std::panic::AssertUnwindSafe(f(ctx)).catch_unwind();
            match fut.await {
                Ok(Ok(())) => (Verdict::Pass, Vec::new()),
                Ok(Err(failure)) => (Verdict::Fail(failure.0), Vec::new()),
                Err(panic) => (Verdict::Fail(panic_message(panic)), Vec::new()),
            }
        }

        TestFn::Callback(f) => {
            let (done, rx) = Done::new();
            let invoke = {
                let done = done.clone();
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || f(ctx, done)))
            };

            let maybe_future = match invoke {
                Ok(v) => v,
                Err(panic) => return (Verdict::Fail(panic_message(panic)), Vec::new()),
            };

            if let Some(future) = maybe_future {
                // §4.3.5: declaring a callback parameter *and* returning a
                // promise-like value is a hard contract violation. Run the
                // future to completion (it may still call `done`, which we
                // discard) so we don't leak a detached task, then fail.
                let _ = std::panic::AssertUnwindSafe(future).catch_unwind().await;
                return (
                    Verdict::Fail(
                        "test returned a Promise and also used a callback".to_string(),
                    ),
                    Vec::new(),
                );
            }

            let verdict = match rx.await {
                Ok(None) => Verdict::Pass,
                Ok(Some(failure)) => Verdict::Fail(failure.0),
                Err(_) => Verdict::Fail("completion callback was never invoked".to_string()),
            };

            let extra = done.extra_call_count();
            let diagnostics = if extra > 0 {
                vec![format!(
                    "completion callback invoked {extra} additional time(s) after settling; ignored"
                )]
            } else {
                Vec::new()
            };

            (verdict, diagnostics)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::fault::FaultRouter;
    use crate::node::Node;

    fn ctx_for_test() -> Context {
        let node = Node::new_root("t", 1);
        let router = FaultRouter::new(node.clone());
        let engine = Engine::new(EngineConfig::default(), router);
        Context::new(node.clone(), node, engine)
    }

    #[tokio::test]
    async fn no_body_passes() {
        let (verdict, diags) = complete(ctx_for_test(), TestFn::None).await;
        assert_eq!(verdict, Verdict::Pass);
        assert!(diags.is_empty());
    }

    #[tokio::test]
    async fn sync_throw_fails() {
        let body = TestFn::sync(|_ctx| Err(TestFailure::new("boom")));
        let (verdict, _) = complete(ctx_for_test(), body).await;
        assert_eq!(verdict, Verdict::Fail("boom".to_string()));
    }

    #[tokio::test]
    async fn sync_panic_is_caught_as_a_throw() {
        let body = TestFn::sync(|_ctx| -> SyncResult { panic!("kaboom") });
        let (verdict, _) = complete(ctx_for_test(), body).await;
        assert!(matches!(verdict, Verdict::Fail(msg) if msg.contains("kaboom")));
    }

    #[tokio::test]
    async fn async_rejection_fails() {
        let body = TestFn::async_fn(|_ctx| async { Err(TestFailure::new("rejected")) });
        let (verdict, _) = complete(ctx_for_test(), body).await;
        assert_eq!(verdict, Verdict::Fail("rejected".to_string()));
    }

    #[tokio::test]
    async fn callback_pass() {
        let body = TestFn::callback(|_ctx, done| done.call(None));
        let (verdict, _) = complete(ctx_for_test(), body).await;
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn callback_fail() {
        let body = TestFn::callback(|_ctx, done| done.call(Some(TestFailure::new("e"))));
        let (verdict, _) = complete(ctx_for_test(), body).await;
        assert_eq!(verdict, Verdict::Fail("e".to_string()));
    }

    #[tokio::test]
    async fn repeated_callback_invocation_is_a_diagnostic_not_an_error() {
        let body = TestFn::callback(|_ctx, done| {
            done.call(None);
            done.call(Some(TestFailure::new("too late")));
        });
        let (verdict, diags) = complete(ctx_for_test(), body).await;
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(diags.len(), 1);
    }

    #[tokio::test]
    async fn callback_and_promise_is_a_hard_failure() {
        let body = TestFn::callback_returning_future(|_ctx, done| async move {
            done.call(None);
        });
        let (verdict, _) = complete(ctx_for_test(), body).await;
        assert!(matches!(verdict, Verdict::Fail(msg) if msg.contains("Promise and also used a callback")));
    }
}
