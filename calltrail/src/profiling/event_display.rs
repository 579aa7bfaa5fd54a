//! Console output for the headless run loop

use std::fmt::Write as _;
use std::sync::Arc;

use super::stack_watcher::{StackFrame, WatchEvent};
use crate::analysis::GraphNode;

/// Counters the run loop keeps between stats lines
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    /// Distinct methods reported by the target
    pub functions: u64,
    /// Records the target has written
    pub calls: u64,
    pub generation: u64,
    /// Enter/leave records consumed by the stack watcher
    pub records_read: u64,
    /// Completed calls folded into the graph
    pub aggregated: u64,
    pub watch_events: u64,
}

/// Print one stats line to stderr
pub fn display_statistics(stats: &WatchStats) {
    eprintln!(
        "stats: functions={} calls={} generation={} read={} aggregated={} watch_events={}",
        stats.functions,
        stats.calls,
        stats.generation,
        stats.records_read,
        stats.aggregated,
        stats.watch_events
    );
}

/// Print a watch notification
pub fn display_watch_event(event: &WatchEvent) {
    println!("{}", format_watch_event(event));
}

#[must_use]
pub fn format_watch_event(event: &WatchEvent) -> String {
    match event {
        WatchEvent::ShowStack(frames) => {
            let mut out = format!("[STACK] depth={}", frames.len());
            for frame in frames {
                let _ = write!(out, "\n  {}", frame.method.full_name());
            }
            out
        }
        WatchEvent::Enter { caller, callee } => {
            format!("[ENTER] {} -> {}", frame_name(caller.as_ref()), callee.method.full_name())
        }
        WatchEvent::Exit { exiting, back_to } => format!(
            "[EXIT] {} ({} ticks) -> {}",
            frame_name(exiting.as_ref()),
            exiting.as_ref().map_or(0, |f| f.elapsed),
            frame_name(back_to.as_ref())
        ),
    }
}

fn frame_name(frame: Option<&StackFrame>) -> &str {
    frame.map_or("<root>", |f| f.method.full_name())
}

/// Print the top `limit` nodes by elapsed time
pub fn display_hot_path(nodes: &[Arc<GraphNode>], limit: usize) {
    if nodes.is_empty() {
        eprintln!("hot path: none");
        return;
    }
    let mut sorted: Vec<&Arc<GraphNode>> = nodes.iter().collect();
    sorted.sort_by(|a, b| b.elapsed().cmp(&a.elapsed()).then(b.calls().cmp(&a.calls())));

    eprintln!("hot path:");
    for node in sorted.into_iter().take(limit) {
        eprintln!(
            "  {:<60} calls={:<8} elapsed={}",
            node.method().full_name(),
            node.calls(),
            node.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MethodId, MethodIdentity};

    fn frame(id: u64, name: &str, elapsed: u64) -> StackFrame {
        StackFrame {
            method: Arc::new(MethodIdentity::new(MethodId(id), name)),
            timestamp: 1,
            elapsed,
        }
    }

    #[test]
    fn test_format_enter_from_root() {
        let event = WatchEvent::Enter { caller: None, callee: frame(3, "App.Main.Run", 0) };
        assert_eq!(format_watch_event(&event), "[ENTER] <root> -> App.Main.Run");
    }

    #[test]
    fn test_format_exit() {
        let event = WatchEvent::Exit {
            exiting: Some(frame(4, "App.Worker.Step", 25)),
            back_to: Some(frame(3, "App.Main.Run", 0)),
        };
        assert_eq!(format_watch_event(&event), "[EXIT] App.Worker.Step (25 ticks) -> App.Main.Run");
    }

    #[test]
    fn test_format_stack_lists_frames_top_first() {
        let event = WatchEvent::ShowStack(vec![frame(4, "A.B.top", 0), frame(3, "A.B.bottom", 0)]);
        assert_eq!(format_watch_event(&event), "[STACK] depth=2\n  A.B.top\n  A.B.bottom");
    }
}
