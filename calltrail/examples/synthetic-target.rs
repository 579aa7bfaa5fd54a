//! Synthetic instrumented process for trying calltrail end to end
//!
//! Serves the control protocol on its socket and, once a buffer is
//! announced, writes enter/leave records for a small fixed call tree.
//!
//! ## Usage
//!
//! ```bash
//! # Start the target
//! cargo run --example synthetic-target
//!
//! # In another terminal: follow it
//! ./target/debug/calltrail synthetic-target --watch Validate --duration 10
//! ```

use anyhow::{Context, Result};
use calltrail::domain::Pid;
use calltrail::transport::{
    control_socket_path, serve_agent, AgentHandler, ControlListener, RingWriter, SharedRegion,
};
use calltrail_common::{LEAVE_METHOD, TAIL_CALL};
use clap::Parser;
use log::info;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Method table: id, fully qualified name
const METHODS: &[(u64, &str)] = &[
    (100, "Demo.Orders.Service.Run"),
    (101, "Demo.Orders.Service.Handle"),
    (102, "Demo.Orders.Validator.Validate"),
    (103, "Demo.Orders.Validator.CheckLimits"),
    (104, "Demo.Storage.Repository.Save"),
    (105, "Demo.Storage.Repository.Save"),
    (106, "Demo.Storage.Journal.Append"),
    (107, "Formatting.Render"),
];

#[derive(Parser)]
#[command(name = "synthetic-target", about = "Stand-in process for calltrail demos")]
struct Args {
    /// Directory to create the control socket in
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Requests handled per second
    #[arg(long, default_value = "200")]
    rate: u32,
}

enum Producer {
    Narrow(RingWriter<u32>),
    Wide(RingWriter<u64>),
}

impl Producer {
    fn new(region: SharedRegion) -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Wide(RingWriter::new(region))
        } else {
            Self::Narrow(RingWriter::new(region))
        }
    }

    fn append(&mut self, id: u64, timestamp: u64) -> bool {
        match self {
            Self::Narrow(w) => w.append(id, timestamp),
            Self::Wide(w) => w.append(id, timestamp),
        }
    }

    fn calls(&self) -> u64 {
        match self {
            Self::Narrow(w) => w.calls(),
            Self::Wide(w) => w.calls(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Narrow(w) => w.reset(),
            Self::Wide(w) => w.reset(),
        }
    }
}

#[derive(Default)]
struct Recorder {
    producer: Option<Producer>,
    generation: u64,
}

impl Recorder {
    /// Append a record, wrapping to a new generation when the buffer is full.
    fn record(&mut self, id: u64, timestamp: u64) {
        let Some(producer) = self.producer.as_mut() else {
            return;
        };
        if !producer.append(id, timestamp) {
            producer.reset();
            self.generation += 1;
            info!("Buffer full, starting generation {}", self.generation);
            producer.append(id, timestamp);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let pid = Pid(i32::try_from(std::process::id()).context("pid out of range")?);
    let runtime_dir = args.runtime_dir.unwrap_or_else(std::env::temp_dir);
    let listener = ControlListener::bind(control_socket_path(&runtime_dir, pid))
        .context("Failed to bind control socket")?;
    println!("synthetic-target pid {} listening on {}", pid.0, listener.path().display());

    let agent = Arc::new(Agent::default());
    let producer_agent = Arc::clone(&agent);
    let rate = args.rate.max(1);
    thread::spawn(move || produce(&producer_agent, rate));

    loop {
        let channel = listener.accept().context("accept failed")?;
        info!("Profiler connected");
        serve_agent(channel, &*agent);
        info!("Profiler disconnected");
    }
}

#[derive(Default)]
struct Agent {
    recorder: Mutex<Recorder>,
}

impl AgentHandler for Agent {
    fn announce(&self, region: SharedRegion) -> Result<(), u32> {
        let mut recorder = self.recorder.lock();
        recorder.producer = Some(Producer::new(region));
        recorder.generation = 0;
        Ok(())
    }

    fn counts(&self) -> (u64, u64, u64) {
        let recorder = self.recorder.lock();
        let calls = recorder.producer.as_ref().map_or(0, Producer::calls);
        (METHODS.len() as u64, calls, recorder.generation)
    }

    fn function_name(&self, id: u64) -> Option<String> {
        METHODS.iter().find(|(m, _)| *m == id).map(|(_, name)| (*name).to_string())
    }

    fn clear(&self) {
        if let Some(producer) = self.recorder.lock().producer.as_mut() {
            producer.reset();
        }
    }

    fn detach(&self) {
        self.recorder.lock().producer = None;
    }
}

/// One request: Run -> Handle -> Validate (-> CheckLimits) -> Save -> Append,
/// with Handle's last call leaving through a tail call into Render.
fn produce(agent: &Agent, rate: u32) {
    let start = Instant::now();
    let pause = Duration::from_secs(1) / rate;
    let mut request: u64 = 0;

    loop {
        thread::sleep(pause);
        request += 1;

        let mut guard = agent.recorder.lock();
        if guard.producer.is_none() {
            continue;
        }
        let save = if request % 2 == 0 { 104 } else { 105 };
        let mut script = vec![100, 101, 102];
        if request % 10 == 0 {
            script.extend([103, LEAVE_METHOD]);
        }
        script.extend([LEAVE_METHOD, save, 106, LEAVE_METHOD, LEAVE_METHOD]);
        script.extend([107, TAIL_CALL, LEAVE_METHOD, LEAVE_METHOD]);

        for id in script {
            let timestamp = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX).max(1);
            guard.record(id, timestamp);
        }
    }
}
