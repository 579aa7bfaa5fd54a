//! Test helpers: a fake instrumented target serving the control protocol

#![allow(dead_code)]

use calltrail::domain::Pid;
use calltrail::session::{Session, SessionConfig, TargetProcess};
use calltrail::transport::{
    control_socket_path, serve_agent, AgentHandler, ControlListener, RingWriter, SharedRegion,
};
use calltrail_common::LEAVE_METHOD;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Default)]
struct FakeState {
    names: HashMap<u64, String>,
    writer: Option<RingWriter<u64>>,
    generation: u64,
    refusal: Option<u32>,
    name_delay: Duration,
    timestamp: u64,
    name_requests: usize,
    commands: Vec<String>,
}

#[derive(Default)]
struct FakeAgent {
    state: Mutex<FakeState>,
}

impl AgentHandler for FakeAgent {
    fn announce(&self, region: SharedRegion) -> Result<(), u32> {
        let mut state = self.state.lock();
        if let Some(code) = state.refusal {
            return Err(code);
        }
        state.writer = Some(RingWriter::new(region));
        Ok(())
    }

    fn counts(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        let calls = state.writer.as_ref().map_or(0, RingWriter::calls);
        (u64::try_from(state.names.len()).unwrap(), calls, state.generation)
    }

    fn function_name(&self, id: u64) -> Option<String> {
        let (name, delay) = {
            let mut state = self.state.lock();
            state.name_requests += 1;
            (state.names.get(&id).cloned(), state.name_delay)
        };
        thread::sleep(delay);
        name
    }

    fn clear(&self) {
        if let Some(writer) = self.state.lock().writer.as_mut() {
            writer.reset();
        }
    }

    fn detach(&self) {
        self.state.lock().writer = None;
    }

    fn received(&self, message: &str) {
        self.state.lock().commands.push(message.to_string());
    }
}

/// Plays the instrumented process on a socket in a scratch directory.
///
/// Serves connections one after another for the lifetime of the test.
pub struct FakeTarget {
    dir: TempDir,
    target: TargetProcess,
    agent: Arc<FakeAgent>,
}

impl FakeTarget {
    pub fn start() -> Self {
        Self::with_refusal(None)
    }

    /// Answer the buffer announcement with `E:<code>` instead of `ok`.
    pub fn with_refusal(refusal: Option<u32>) -> Self {
        let pid = Pid(i32::try_from(std::process::id()).unwrap());
        let fake = Self::for_target(TargetProcess::from_parts(pid, "fake-target", true));
        fake.agent.state.lock().refusal = refusal;
        fake
    }

    /// Serve the control socket of `target`, which may be another process.
    pub fn for_target(target: TargetProcess) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(FakeAgent::default());

        let listener = ControlListener::bind(control_socket_path(dir.path(), target.pid())).unwrap();
        let shared = Arc::clone(&agent);
        thread::spawn(move || {
            while let Ok(channel) = listener.accept() {
                serve_agent(channel, &*shared);
            }
        });

        Self { dir, target, agent }
    }

    pub fn target(&self) -> TargetProcess {
        self.target.clone()
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig {
            runtime_dir: self.dir.path().to_path_buf(),
            shm_dir: self.dir.path().to_path_buf(),
            buffer_size: 64 * 1024,
            connect_timeout: Duration::from_secs(2),
            reply_timeout: Some(Duration::from_secs(5)),
            idle_backoff: Duration::from_millis(10),
            exit_poll_interval: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    /// A session already attached to this target.
    pub fn attached_session(&self) -> Arc<Session> {
        let session = Session::new(self.config());
        session.attach(Some(self.target())).unwrap();
        session
    }

    pub fn name(&self, id: u64, full_name: &str) {
        self.agent.state.lock().names.insert(id, full_name.to_string());
    }

    /// Hold every `F:` reply back by `delay`.
    pub fn delay_names(&self, delay: Duration) {
        self.agent.state.lock().name_delay = delay;
    }

    pub fn enter(&self, id: u64) {
        self.append(id);
    }

    pub fn leave(&self) {
        self.append(LEAVE_METHOD);
    }

    fn append(&self, id: u64) {
        let mut state = self.agent.state.lock();
        state.timestamp += 10;
        let timestamp = state.timestamp;
        let writer = state.writer.as_mut().expect("no buffer announced");
        assert!(writer.append(id, timestamp), "record buffer full");
    }

    /// Start over at offset 0 under a new generation, as a wrapping target does.
    pub fn wrap(&self) {
        let mut state = self.agent.state.lock();
        state.generation += 1;
        if let Some(writer) = state.writer.as_mut() {
            writer.reset();
        }
    }

    pub fn name_requests(&self) -> usize {
        self.agent.state.lock().name_requests
    }

    pub fn commands(&self) -> Vec<String> {
        self.agent.state.lock().commands.clone()
    }

    pub fn has_buffer(&self) -> bool {
        self.agent.state.lock().writer.is_some()
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
