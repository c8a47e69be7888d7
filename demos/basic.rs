//! Minimal standalone runner demonstrating `tapestry` end to end: a small
//! tree of tests (one passing, one failing, one with bounded-concurrency
//! subtests), rendered as TAP on stdout with the process exit code set to
//! match the aggregate verdict.
//!
//! Run with `cargo run --example basic`.

use tracing_subscriber::FmtSubscriber;

use tapestry::{EngineConfig, context::Context, node::TestOptions, testfn::TestFn};

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("no subscriber installed yet");

    let summary = tapestry::harness::run("basic.rs", EngineConfig::default(), |ctx: Context| {
        Box::pin(async move {
            ctx.test(
                "adds numbers",
                TestOptions::new(),
                TestFn::sync(|_ctx| {
                    assert_eq!(2 + 2, 4);
                    Ok(())
                }),
            )
            .await;

            ctx.test(
                "known broken",
                TestOptions::new().with_todo("tracked in TICKET-1"),
                TestFn::sync(|_ctx| Err("not implemented yet".into())),
            )
            .await;

            ctx.test(
                "subtests",
                TestOptions::new().with_concurrency(2),
                TestFn::async_fn(|ctx| async move {
                    let a = ctx.test("a", TestOptions::new(), TestFn::sync(|_ctx| Ok(())));
                    let b = ctx.test("b", TestOptions::new(), TestFn::sync(|_ctx| Ok(())));
                    a.await;
                    b.await;
                    Ok(())
                }),
            )
            .await;
        })
    })
    .await;

    summary
        .write_tap(&mut std::io::stdout())
        .expect("stdout is writable");
    std::process::exit(summary.exit_code());
}
