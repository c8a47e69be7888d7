//! The TAP Emitter (C1): renders a completed test tree as TAP version 13.
//!
//! Per §4.1 the tree is fully buffered before anything is written: children
//! settle in whatever order their own work finishes, but emission always
//! walks the tree in ordinal order, parents after every one of their
//! children. A [`Node`]'s `children` vector is already in ordinal order
//! (insertion order at creation time), so this module only has to walk it.

use std::io::Write;

use crate::config::{EngineConfig, TapVersion};
use crate::node::{Directive, Node, Verdict};

/// Writes the full TAP document for `root` to `out`, per the dialect and
/// diagnostic-buffering mode in `config` (A1).
///
/// `root` (and, transitively, every node in its subtree) must already be in
/// `Phase::Reported` — the runner guarantees this before calling the
/// emitter, since indentation and ordinal plans require the whole shape of
/// the tree to be known.
pub async fn emit<W: Write>(root: &Node, out: &mut W, config: &EngineConfig) -> std::io::Result<()> {
    writeln!(out, "{}", header_line(config.tap_dialect))?;
    let mut children = root.state.lock().expect("node state poisoned").children.clone();
    children.sort_by_key(|c| c.id.ordinal);
    write_plan(out, children.len(), 0)?;
    for child in &children {
        write_node(child, 0, out, config).await?;
    }
    write_root_diagnostics(root, out).await?;
    Ok(())
}

fn header_line(dialect: TapVersion) -> &'static str {
    match dialect {
        TapVersion::V13 => "TAP version 13",
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

fn write_plan<W: Write>(out: &mut W, count: usize, depth: usize) -> std::io::Result<()> {
    if count == 0 {
        writeln!(out, "{}1..0", indent(depth))
    } else {
        writeln!(out, "{}1..{count}", indent(depth))
    }
}

async fn write_node<W: Write>(
    node: &Node,
    depth: usize,
    out: &mut W,
    config: &EngineConfig,
) -> std::io::Result<()> {
    let state = node.state.lock().expect("node state poisoned");
    let pad = indent(depth);

    if !state.children.is_empty() {
        writeln!(out, "{pad}# Subtest: {}", node.id.name)?;
        write_plan(out, state.children.len(), depth + 1)?;
        let mut children = state.children.clone();
        children.sort_by_key(|c| c.id.ordinal);
        drop(state);
        for child in &children {
            Box::pin(write_node(child, depth + 1, out, config)).await?;
        }
    } else {
        drop(state);
    }

    let state = node.state.lock().expect("node state poisoned");
    let ok = state.skip.is_set()
        || matches!(state.verdict, Some(Verdict::Pass) | Some(Verdict::Skipped(_)))
        || (matches!(&state.verdict, Some(Verdict::Fail(_))) && state.todo.is_set());
    let status = if ok { "ok" } else { "not ok" };

    let mut directive = String::new();
    if let Some(reason) = state.skip.reason() {
        directive = format!(" # SKIP {reason}");
    } else if matches!(state.skip, Directive::Bare) {
        directive = " # SKIP".to_string();
    } else if state.todo.is_set() {
        match state.todo.reason() {
            Some(reason) => directive = format!(" # TODO {reason}"),
            None => directive = " # TODO".to_string(),
        }
    }

    writeln!(
        out,
        "{pad}{status} {} - {}{directive}",
        node.id.ordinal, node.id.name
    )?;

    let needs_diagnostics =
        matches!(&state.verdict, Some(Verdict::Fail(_))) || !state.diagnostics.is_empty();
    if needs_diagnostics && config.buffer_diagnostics {
        // Batched: one YAML block per result line, holding the duration,
        // the failure (if any), and every diagnostic gathered for this node.
        let duration_ms = match (state.start, state.end) {
            (Some(s), Some(e)) => e.saturating_duration_since(s).as_secs_f64() * 1000.0,
            _ => 0.0,
        };
        writeln!(out, "{pad}  ---")?;
        writeln!(out, "{pad}  duration_ms: {duration_ms:.3}")?;
        if let Some(Verdict::Fail(message)) = &state.verdict {
            writeln!(out, "{pad}  error: {}", yaml_escape(message))?;
        }
        for diag in &state.diagnostics {
            for line in diag.lines() {
                writeln!(out, "{pad}  # {line}")?;
            }
        }
        writeln!(out, "{pad}  ...")?;
    } else if needs_diagnostics {
        // Unbuffered: plain comment lines, no YAML framing, as if each had
        // been flushed the moment it was recorded.
        if let Some(Verdict::Fail(message)) = &state.verdict {
            writeln!(out, "{pad}  # error: {message}")?;
        }
        for diag in &state.diagnostics {
            for line in diag.lines() {
                writeln!(out, "{pad}  # {line}")?;
            }
        }
    }

    Ok(())
}

async fn write_root_diagnostics<W: Write>(root: &Node, out: &mut W) -> std::io::Result<()> {
    let state = root.state.lock().expect("node state poisoned");
    for diag in &state.diagnostics {
        writeln!(out, "# {diag}")?;
    }
    Ok(())
}

fn yaml_escape(s: &str) -> String {
    if s.contains(['\n', ':', '#']) || s.is_empty() {
        format!("{:?}", s)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Phase as NodePhase;

    #[tokio::test]
    async fn empty_tree_emits_header_and_zero_plan() {
        let root = Node::new_root("file", 1);
        root.state.lock().expect("node state poisoned").phase = NodePhase::Reported;
        let mut buf = Vec::new();
        emit(&root, &mut buf, &EngineConfig::default()).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("TAP version 13\n"));
        assert!(text.contains("1..0"));
    }

    #[tokio::test]
    async fn passing_child_renders_ok_line() {
        let root = Node::new_root("file", 1);
        let child = crate::node::Node::new_child(
            &root,
            1,
            "adds numbers".to_string(),
            crate::node::TestOptions::new(),
        );
        {
            let mut cs = child.state.lock().expect("node state poisoned");
            cs.phase = NodePhase::Reported;
            cs.verdict = Some(Verdict::Pass);
        }
        root.state.lock().expect("node state poisoned").children.push(child);
        root.state.lock().expect("node state poisoned").phase = NodePhase::Reported;

        let mut buf = Vec::new();
        emit(&root, &mut buf, &EngineConfig::default()).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("ok 1 - adds numbers"));
        assert!(text.contains("1..1"));
    }

    #[tokio::test]
    async fn failing_child_renders_not_ok_with_yaml_block() {
        let root = Node::new_root("file", 1);
        let child = crate::node::Node::new_child(
            &root,
            1,
            "breaks".to_string(),
            crate::node::TestOptions::new(),
        );
        {
            let mut cs = child.state.lock().expect("node state poisoned");
            cs.phase = NodePhase::Reported;
            cs.verdict = Some(Verdict::Fail("assertion failed".to_string()));
        }
        root.state.lock().expect("node state poisoned").children.push(child);

        let mut buf = Vec::new();
        emit(&root, &mut buf, &EngineConfig::default()).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("not ok 1 - breaks"));
        assert!(text.contains("error: assertion failed"));
        assert!(text.contains("---"));
    }

    #[tokio::test]
    async fn failing_todo_child_still_renders_ok() {
        let root = Node::new_root("file", 1);
        let child = crate::node::Node::new_child(
            &root,
            1,
            "known broken".to_string(),
            crate::node::TestOptions::new().with_todo("tracked in TICKET-1"),
        );
        {
            let mut cs = child.state.lock().expect("node state poisoned");
            cs.phase = NodePhase::Reported;
            cs.verdict = Some(Verdict::Fail("still broken".to_string()));
        }
        root.state.lock().expect("node state poisoned").children.push(child);

        let mut buf = Vec::new();
        emit(&root, &mut buf, &EngineConfig::default()).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("ok 1 - known broken # TODO tracked in TICKET-1"));
    }

    #[tokio::test]
    async fn unbuffered_diagnostics_skip_the_yaml_block() {
        let root = Node::new_root("file", 1);
        let child = crate::node::Node::new_child(
            &root,
            1,
            "breaks".to_string(),
            crate::node::TestOptions::new(),
        );
        {
            let mut cs = child.state.lock().expect("node state poisoned");
            cs.phase = NodePhase::Reported;
            cs.verdict = Some(Verdict::Fail("assertion failed".to_string()));
            cs.diagnostics.push("extra context".to_string());
        }
        root.state.lock().expect("node state poisoned").children.push(child);

        let config = EngineConfig {
            buffer_diagnostics: false,
            ..EngineConfig::default()
        };
        let mut buf = Vec::new();
        emit(&root, &mut buf, &config).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("not ok 1 - breaks"));
        assert!(text.contains("# error: assertion failed"));
        assert!(text.contains("# extra context"));
        assert!(!text.contains("---"));
        assert!(!text.contains("duration_ms"));
    }
}
