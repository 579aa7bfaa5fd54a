//! # calltrail - Main Entry Point
//!
//! Headless run loop: attach to a target (`calltrail <PROCESS>` or
//! `--pid <PID>`), follow its calls until Ctrl+C, a duration limit or the
//! target exiting, then print a summary and optionally export the graph.

// Main function is intentionally long for clarity; time conversions lose precision for display
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::time::{Duration, Instant};

use calltrail::analysis::CallGraph;
use calltrail::cli::Args;
use calltrail::domain::{MethodId, Pid, SessionError};
use calltrail::export::GraphExporter;
use calltrail::preflight::run_preflight_checks;
use calltrail::process_lookup::find_process_by_name;
use calltrail::profiling::{
    display_hot_path, display_statistics, display_watch_event, StackWatcher, WatchFilter,
    WatchStats,
};
use calltrail::session::{Session, StatusEvent, TargetProcess};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(SessionError::InvalidProcess) = err.downcast_ref::<SessionError>() {
        return EXIT_USAGE;
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Resolve the target PID from CLI arguments.
///
/// - `calltrail my-app` - find process by name
/// - `calltrail --pid 1234` - explicit PID
fn resolve_pid(args: &Args) -> Result<i32> {
    if let Some(ref name) = args.process {
        if args.pid.is_some() {
            anyhow::bail!(
                "Cannot use PROCESS argument with --pid.\n\n\
                 Use either:\n  \
                 calltrail my-app          (auto-detect)\n  \
                 calltrail --pid 1234      (explicit PID)"
            );
        }
        let runtime_dir = args.session_config().runtime_dir;
        return Ok(find_process_by_name(name, &runtime_dir)?.pid);
    }

    if let Some(pid) = args.pid {
        return Ok(pid);
    }

    anyhow::bail!(
        "Missing required argument: PROCESS or --pid\n\n\
         Usage:\n  \
         calltrail my-app          Auto-detect PID\n  \
         calltrail --pid 1234      Explicit PID\n\n\
         Run 'calltrail --help' for more options"
    )
}

/// `--watch 1234` selects a method id, anything else matches by name
fn parse_watch(watch: &str) -> WatchFilter {
    match watch.parse::<u64>() {
        Ok(id) => WatchFilter::Method(MethodId(id)),
        Err(_) => WatchFilter::Named(watch.to_string()),
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let pid = resolve_pid(&args)?;
    let config = args.session_config();
    run_preflight_checks(pid, &config)?;

    let target = TargetProcess::open(Pid(pid)).context("Failed to open target process")?;
    if !quiet {
        println!("calltrail v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {} ({})", target.name(), if target.is_64bit() { "64-bit" } else { "32-bit" });
        println!("pid: {pid}");
    }

    let session = Session::new(config);
    let status_rx = session.subscribe();
    session.attach(Some(target)).context("Failed to attach")?;

    let mut watcher = StackWatcher::start(&session).context("Failed to start stack watcher")?;
    let watch_rx = watcher.watch_events();
    if let Some(ref watch) = args.watch {
        watcher.set_watching(Some(parse_watch(watch)));
        if !quiet {
            println!("watching: {watch}");
        }
    }

    // Aggregated totals, and a second graph fed only by watch events
    let graph = CallGraph::new();
    let watch_graph = CallGraph::new();
    let mut stats = WatchStats::default();
    let mut stats_timer = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let profiling_start = Instant::now();
    let duration_limit = args.duration_limit();
    let poll_interval = args.poll_interval();

    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if profiling_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if !session.is_attached() {
            exit_reason = "process exited";
            break;
        }

        match session.get_counts() {
            Ok(counts) => {
                stats.functions = counts.functions;
                stats.calls = counts.calls;
                stats.generation = counts.generation;
            }
            Err(e) if session.is_attached() => warn!("Failed to get counts: {e}"),
            Err(_) => {
                exit_reason = "process exited";
                break;
            }
        }

        stats.aggregated += watcher.batch_update(&graph) as u64;
        stats.records_read = watcher.calls_read();

        for event in watch_rx.try_iter() {
            watch_graph.apply(&event);
            stats.watch_events += 1;
            if !quiet {
                display_watch_event(&event);
            }
        }

        for event in status_rx.try_iter() {
            if let StatusEvent::Status(status) = event {
                info!("{status}");
            }
        }

        if !quiet && stats_timer.elapsed() > STATS_INTERVAL {
            display_statistics(&stats);
            stats_timer = Instant::now();
        }

        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    watcher.stop();
    stats.aggregated += watcher.batch_update(&graph) as u64;
    stats.records_read = watcher.calls_read();

    if let Err(e) = session.detach() {
        warn!("Detach did not complete cleanly: {e}");
    }

    let elapsed = profiling_start.elapsed();
    eprintln!(
        "\n{}: {:.1}s, {} records read, {} calls aggregated, {} methods, {} links, {} watch events ({} dropped), {} round trips",
        exit_reason,
        elapsed.as_secs_f64(),
        stats.records_read,
        stats.aggregated,
        graph.len(),
        graph.link_count(),
        stats.watch_events,
        watcher.dropped_events(),
        session.round_trips(),
    );

    if args.watch.is_some() {
        eprintln!(
            "watched stacks: {} methods, {} links",
            watch_graph.len(),
            watch_graph.link_count()
        );
    }

    if !quiet {
        let hot = graph.hot_path();
        let shown = if hot.is_empty() { graph.nodes() } else { hot };
        display_hot_path(&shown, args.top);
    }

    if let Some(ref export_path) = args.export {
        GraphExporter::new()
            .export_to_file(&graph, export_path)
            .context("Failed to export call graph")?;
        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}
