//! An embedded, hierarchical test runner that emits TAP version 13.
//!
//! A single file root owns a tree of [`Node`](node::Node)s. Each node is a
//! test with its own identity, options, and outcome; tests register further
//! tests as children of the [`Context`](context::Context) they're handed,
//! and a child's own concurrency budget is governed by its nearest ancestor
//! unless overridden. The pieces:
//!
//! - [`node`] — identity, options, lifecycle phase, and verdict for one
//!   test.
//! - [`testfn`] — the Completion Detector: classifies how a test function
//!   finished (synchronous return, future, or callback) into a verdict.
//! - [`context`] — the handle passed into every test body: diagnostics,
//!   `skip`/`todo`, and registering children.
//! - [`runner`] — drives a node's lifecycle: the concurrency gate,
//!   phase transitions, and cooperative cancellation of children still
//!   outstanding when their parent finishes.
//! - [`fault`] — attributes a panic or unhandled future failure with no
//!   definite caller to whichever test is running, or to the file root.
//! - [`tap`] — walks a finished tree and renders it as TAP.
//! - [`harness`] — the explicit entry point: registers a file's top-level
//!   tests, drains them, and returns a [`harness::Summary`].
//! - [`config`] — engine-wide defaults and how they're loaded.
//! - [`error`] — errors raised by the scaffolding around the test tree,
//!   as distinct from a test's own (normal, TAP-reportable) failure.
//!
//! # Example
//!
//! ```no_run
//! use tapestry::{config::EngineConfig, context::Context, node::TestOptions, testfn::TestFn};
//!
//! # async fn run() {
//! let summary = tapestry::harness::run("arithmetic.rs", EngineConfig::default(), |ctx: Context| {
//!     Box::pin(async move {
//!         ctx.test("adds", TestOptions::new(), TestFn::sync(|_ctx| {
//!             assert_eq!(2 + 2, 4);
//!             Ok(())
//!         }))
//!         .await;
//!     })
//! })
//! .await;
//!
//! summary.write_tap(&mut std::io::stdout()).unwrap();
//! std::process::exit(summary.exit_code());
//! # }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fault;
pub mod harness;
pub mod node;
pub mod runner;
pub mod tap;
pub mod testfn;

pub use config::EngineConfig;
pub use context::Context;
pub use error::{EngineError, EngineResult};
pub use harness::Summary;
pub use node::{Directive, TestOptions, Verdict};
pub use testfn::{Done, TestFailure, TestFn};
