//! Launching counting jobs and relaying their messages.
//!
//! [`JobRunner`] runs each job in its own worker process (the `worker`
//! subcommand of the `atlas-stats` binary); [`InProcessLauncher`] runs it on
//! a thread of the current process. Both hand back a [`JobHandle`] and give
//! the same guarantees to the [`JobObserver`]:
//!
//! - progress callbacks only while the job is running;
//! - at most one terminal callback (`on_complete` or `on_error`);
//! - no callback at all once [`JobHandle::cancel`] has returned.
//!
//! Job state and observer live behind one mutex, so delivering a message and
//! cancelling are mutually exclusive. Observers must not cancel their own
//! job from inside a callback.

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use geo::LineString;

use crate::config::LayerDescriptor;
use crate::counter::{CountObserver, CountOptions};
use crate::message::{percent, JobKind, JobMessage, JobRequest, JobResult};
use crate::tile::TileRef;
use crate::tile_source::{FsTileSource, TileSource};
use crate::worker::execute;
use crate::{Error, Result};

/// Receives the outcome of one job.
pub trait JobObserver: Send {
    /// Share of tiles processed, 0 to 100.
    fn on_progress(&mut self, _percent: f64) {}

    /// A tile failed; the job continues.
    fn on_tile_error(&mut self, _message: &str) {}

    fn on_complete(&mut self, result: JobResult);

    fn on_error(&mut self, error: Error);
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

struct JobInner {
    state: JobState,
    observer: Box<dyn JobObserver>,
}

/// State shared between a handle and the thread relaying the job.
struct JobCore {
    inner: Mutex<JobInner>,
}

impl JobCore {
    fn new(observer: Box<dyn JobObserver>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JobInner {
                state: JobState::Running,
                observer,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        // A panicking observer must not wedge cancellation
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> JobState {
        self.lock().state
    }

    fn progress(&self, processed: usize, total: usize) {
        let mut inner = self.lock();
        if inner.state == JobState::Running {
            inner.observer.on_progress(percent(processed, total));
        }
    }

    fn tile_error(&self, message: &str) {
        let mut inner = self.lock();
        if inner.state == JobState::Running {
            inner.observer.on_tile_error(message);
        }
    }

    /// Deliver the terminal outcome. Returns false if the job had already
    /// ended (completed, failed or cancelled).
    fn finish(&self, outcome: Result<JobResult>) -> bool {
        let mut inner = self.lock();
        if inner.state != JobState::Running {
            return false;
        }
        match outcome {
            Ok(result) => {
                inner.state = JobState::Completed;
                inner.observer.on_complete(result);
            }
            Err(error) => {
                inner.state = JobState::Failed;
                inner.observer.on_error(error);
            }
        }
        true
    }

    /// Returns true if this call moved the job to `Cancelled`.
    fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != JobState::Running {
            return false;
        }
        inner.state = JobState::Cancelled;
        true
    }
}

/// How a running job is stopped.
enum Terminator {
    Process(Arc<Mutex<Child>>),
    Flag(Arc<AtomicBool>),
}

impl Terminator {
    fn terminate(&self) {
        match self {
            Self::Process(child) => kill(child),
            Self::Flag(flag) => flag.store(true, Ordering::Release),
        }
    }
}

fn kill(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
    // Fails only when the process is already gone
    let _ = child.kill();
}

/// How long a worker that closed its output may take to exit.
const EXIT_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Exit status of a worker, polled for at most `grace`. The lock is only
/// held per poll so `kill` stays available. `None` if the worker is still
/// running or the job ended in the meantime.
fn poll_exit(
    child: &Mutex<Child>,
    core: &JobCore,
    grace: Duration,
) -> Option<io::Result<ExitStatus>> {
    let deadline = Instant::now() + grace;
    loop {
        let status = child.lock().unwrap_or_else(|e| e.into_inner()).try_wait();
        match status {
            Ok(Some(status)) => return Some(Ok(status)),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        if core.state() != JobState::Running || Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(EXIT_POLL);
    }
}

/// Handle to one launched job.
pub struct JobHandle {
    layer: String,
    core: Arc<JobCore>,
    terminator: Terminator,
    threads: Vec<JoinHandle<()>>,
}

impl JobHandle {
    /// Name of the layer the job queries.
    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn state(&self) -> JobState {
        self.core.state()
    }

    /// Stop the job. No observer callback fires after this returns. A no-op
    /// once the job has ended; returns true if this call cancelled it.
    pub fn cancel(&self) -> bool {
        if !self.core.cancel() {
            return false;
        }
        log::info!("Cancelling job for layer '{}'", self.layer);
        self.terminator.terminate();
        true
    }

    /// Block until the job has ended and its threads have exited.
    pub fn wait(mut self) -> JobState {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("Job thread for layer '{}' panicked", self.layer);
                self.core.finish(Err(Error::Worker("job thread panicked".to_string())));
            }
        }
        if let Terminator::Process(child) = &self.terminator {
            let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
            let _ = child.wait();
        }
        self.core.state()
    }
}

/// Starts counting jobs.
pub trait JobLauncher: Send + Sync {
    /// Launch a prepared request. The layer is validated first; an invalid
    /// layer is a configuration error and nothing is started.
    fn launch(&self, request: JobRequest, observer: Box<dyn JobObserver>) -> Result<JobHandle>;

    /// Launch a `kind` job for `layer`, with `polygon` given in reference
    /// coordinates (`None` for the whole layer).
    fn start(
        &self,
        kind: JobKind,
        polygon: Option<&LineString<f64>>,
        layer: &LayerDescriptor,
        reference_size: f64,
        observer: Box<dyn JobObserver>,
    ) -> Result<JobHandle> {
        layer.validate()?;
        let request = JobRequest::prepare(kind, polygon, layer, reference_size)?;
        self.launch(request, observer)
    }
}

/// Program and arguments that start a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable's `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Worker(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })
    }
}

/// Runs every job in a fresh worker process.
#[derive(Debug, Clone)]
pub struct JobRunner {
    command: WorkerCommand,
    timeout: Option<Duration>,
}

impl JobRunner {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            timeout: None,
        }
    }

    /// Kill jobs that have not finished within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl JobLauncher for JobRunner {
    fn launch(&self, request: JobRequest, observer: Box<dyn JobObserver>) -> Result<JobHandle> {
        request.layer.validate()?;
        let layer = request.layer.name.clone();

        let mut child = self.command.spawn()?;
        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Worker("worker pipes unavailable".to_string()));
            }
        };

        let sent = serde_json::to_writer(&stdin, &request)
            .map_err(Error::from)
            .and_then(|_| (&stdin).write_all(b"\n").map_err(Error::from));
        // Closing stdin tells the worker the request is complete
        drop(stdin);
        if let Err(e) = sent {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Worker(format!("failed to send job: {}", e)));
        }

        log::info!(
            "Started worker {} for {:?} job on layer '{}'",
            pid,
            request.kind,
            layer
        );

        let core = JobCore::new(observer);
        let child = Arc::new(Mutex::new(child));
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let mut threads = Vec::with_capacity(2);
        {
            let core = Arc::clone(&core);
            let child = Arc::clone(&child);
            let layer = layer.clone();
            threads.push(std::thread::spawn(move || {
                relay(stdout, &core, &child, &layer);
                drop(done_tx);
            }));
        }

        if let Some(timeout) = self.timeout {
            let core = Arc::clone(&core);
            let child = Arc::clone(&child);
            threads.push(std::thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                    if core.finish(Err(Error::Timeout(timeout))) {
                        log::warn!("Worker {} timed out after {:?}", pid, timeout);
                        kill(&child);
                    }
                }
            }));
        }

        Ok(JobHandle {
            layer,
            core,
            terminator: Terminator::Process(child),
            threads,
        })
    }
}

/// Forward worker output to the job until a terminal message or EOF.
fn relay(stdout: ChildStdout, core: &JobCore, child: &Mutex<Child>, layer: &str) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                core.finish(Err(Error::Io(e)));
                kill(child);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match JobMessage::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Layer '{}': {}", layer, e);
                core.finish(Err(e));
                kill(child);
                return;
            }
        };

        match message {
            JobMessage::Step { progress, total } => core.progress(progress, total),
            JobMessage::TileError { message } => core.tile_error(&message),
            JobMessage::Complete { result } => {
                log::info!(
                    "Layer '{}' completed in {:?}",
                    layer,
                    result.elapsed()
                );
                core.finish(Ok(result));
                kill(child);
                return;
            }
            JobMessage::Error { message } => {
                core.finish(Err(Error::Worker(message)));
                kill(child);
                return;
            }
        }
    }

    if core.state() != JobState::Running {
        return;
    }
    let reason = match poll_exit(child, core, EXIT_GRACE) {
        Some(Ok(status)) => format!("worker exited before completion ({})", status),
        Some(Err(e)) => format!("worker exited before completion ({})", e),
        None if core.state() != JobState::Running => return,
        None => "worker closed its output before completion".to_string(),
    };
    log::warn!("Layer '{}': {}", layer, reason);
    core.finish(Err(Error::Worker(reason)));
    kill(child);
}

/// Runs jobs on threads of the current process.
#[derive(Clone)]
pub struct InProcessLauncher {
    source: Arc<dyn TileSource>,
}

impl InProcessLauncher {
    pub fn new(source: Arc<dyn TileSource>) -> Self {
        Self { source }
    }
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new(Arc::new(FsTileSource))
    }
}

/// Forwards counter events of an in-process job to its core.
struct CoreForwarder<'a> {
    core: &'a JobCore,
}

impl CountObserver for CoreForwarder<'_> {
    fn on_progress(&mut self, processed: usize, total: usize) {
        self.core.progress(processed, total);
    }

    fn on_tile_error(&mut self, _tile: &TileRef, error: &Error) {
        self.core.tile_error(&error.to_string());
    }
}

impl JobLauncher for InProcessLauncher {
    fn launch(&self, request: JobRequest, observer: Box<dyn JobObserver>) -> Result<JobHandle> {
        request.layer.validate()?;
        let layer = request.layer.name.clone();
        let core = JobCore::new(observer);
        let cancel = Arc::new(AtomicBool::new(false));

        let thread = {
            let core = Arc::clone(&core);
            let cancel = Arc::clone(&cancel);
            let source = Arc::clone(&self.source);
            std::thread::spawn(move || {
                let mut forwarder = CoreForwarder { core: &core };
                let options = CountOptions::new().with_cancel(cancel);
                let outcome = execute(&request, source.as_ref(), &options, &mut forwarder);
                // A cancelled job is already terminal; this is then a no-op
                core.finish(outcome);
            })
        };

        Ok(JobHandle {
            layer,
            core,
            terminator: Terminator::Flag(cancel),
            threads: vec![thread],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PixelRole;
    use crossbeam_channel::{Receiver, Sender};
    use geo::line_string;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Progress(f64),
        TileError(String),
        Complete(JobResult),
        Error(String),
    }

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<Event>>>);

    impl Events {
        fn observer(&self) -> Box<dyn JobObserver> {
            Box::new(self.clone())
        }

        fn take(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        fn terminal(&self) -> Vec<Event> {
            self.take()
                .into_iter()
                .filter(|e| matches!(e, Event::Complete(_) | Event::Error(_)))
                .collect()
        }
    }

    impl JobObserver for Events {
        fn on_progress(&mut self, percent: f64) {
            self.0.lock().unwrap().push(Event::Progress(percent));
        }

        fn on_tile_error(&mut self, message: &str) {
            self.0.lock().unwrap().push(Event::TileError(message.to_string()));
        }

        fn on_complete(&mut self, result: JobResult) {
            self.0.lock().unwrap().push(Event::Complete(result));
        }

        fn on_error(&mut self, error: Error) {
            self.0.lock().unwrap().push(Event::Error(error.to_string()));
        }
    }

    /// Tiles served from memory; a tile listed in `gates` blocks until the
    /// test releases it.
    #[derive(Default)]
    struct GatedSource {
        tiles: HashMap<String, String>,
        gates: HashMap<String, Receiver<()>>,
    }

    impl GatedSource {
        fn with(mut self, path: &str, data: &str) -> Self {
            self.tiles.insert(path.to_string(), data.to_string());
            self
        }

        fn gated(mut self, path: &str, data: &str) -> (Self, Sender<()>) {
            let (tx, rx) = crossbeam_channel::bounded(0);
            self.gates.insert(path.to_string(), rx);
            (self.with(path, data), tx)
        }
    }

    impl TileSource for GatedSource {
        fn load(&self, path: &str) -> Result<Vec<u8>> {
            if let Some(gate) = self.gates.get(path) {
                let _ = gate.recv();
            }
            self.tiles
                .get(path)
                .map(|d| d.as_bytes().to_vec())
                .ok_or_else(|| Error::TileRead {
                    path: path.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such tile"),
                })
        }
    }

    fn square(size: f64) -> LineString<f64> {
        line_string![(x: 0.0, y: 0.0), (x: size, y: 0.0), (x: size, y: size), (x: 0.0, y: size)]
    }

    // ========== InProcessLauncher Tests ==========

    #[test]
    fn test_in_process_job_completes() {
        let source = GatedSource::default().with("t/0_0.csv", "10,10\n300,300\n");
        let launcher = InProcessLauncher::new(Arc::new(source));
        let layer = LayerDescriptor::points("cells", "t/{x}_{y}.csv", 256.0, 256.0);
        let events = Events::default();

        let handle = launcher
            .start(JobKind::Points, Some(&square(100.0)), &layer, 256.0, events.observer())
            .unwrap();
        assert_eq!(handle.layer(), "cells");
        assert_eq!(handle.wait(), JobState::Completed);

        let recorded = events.take();
        assert_eq!(recorded[0], Event::Progress(100.0));
        assert!(matches!(
            recorded.last(),
            Some(Event::Complete(JobResult::Points { count: 1, total: 1, .. }))
        ));
    }

    #[test]
    fn test_in_process_scales_polygon_to_layer() {
        // Reference space 256, layer 512: the 0..100 square becomes 0..200
        let source = GatedSource::default().with("t/0_0.csv", "150,150\n300,300\n");
        let launcher = InProcessLauncher::new(Arc::new(source));
        let layer = LayerDescriptor::points("cells", "t/{x}_{y}.csv", 512.0, 512.0);
        let events = Events::default();

        launcher
            .start(JobKind::Points, Some(&square(100.0)), &layer, 256.0, events.observer())
            .unwrap()
            .wait();

        assert!(matches!(
            events.terminal()[..],
            [Event::Complete(JobResult::Points { count: 1, .. })]
        ));
    }

    #[test]
    fn test_in_process_pixels_job() {
        let source = GatedSource::default().with("p/0_0.csv", "1,2\n3,4\n");
        let launcher = InProcessLauncher::new(Arc::new(source));
        let layer = LayerDescriptor::pixels("mask", "p/{x}_{y}.csv", 2.0, 2.0, PixelRole::Holes);
        let events = Events::default();

        launcher
            .start(JobKind::Pixels, None, &layer, 2.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(events.terminal().len(), 1);
        assert!(matches!(
            events.terminal()[0],
            Event::Complete(JobResult::Pixels { sum, role: PixelRole::Holes, .. }) if sum == 10.0
        ));
    }

    #[test]
    fn test_in_process_reports_tile_errors() {
        let source = GatedSource::default().with("t/0_0.csv", "1,1\n");
        let launcher = InProcessLauncher::new(Arc::new(source));
        let layer = LayerDescriptor::points("cells", "t/{x}_{y}.csv", 20.0, 10.0);
        let events = Events::default();

        launcher
            .start(JobKind::Points, None, &layer, 20.0, events.observer())
            .unwrap()
            .wait();

        let recorded = events.take();
        let tile_errors = recorded
            .iter()
            .filter(|e| matches!(e, Event::TileError(_)))
            .count();
        assert_eq!(tile_errors, 3);
        assert!(matches!(
            events.terminal()[..],
            [Event::Complete(JobResult::Points { count: 1, total: 4, .. })]
        ));
    }

    #[test]
    fn test_cancel_suppresses_callbacks() {
        let (source, release) = GatedSource::default().gated("t/0_0.csv", "1,1\n");
        let launcher = InProcessLauncher::new(Arc::new(source));
        let layer = LayerDescriptor::points("cells", "t/{x}_{y}.csv", 10.0, 10.0);
        let events = Events::default();

        let handle = launcher
            .start(JobKind::Points, None, &layer, 10.0, events.observer())
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.state(), JobState::Cancelled);

        // Unblock the tile; its result must go nowhere
        drop(release);
        assert_eq!(handle.wait(), JobState::Cancelled);
        assert!(events.take().is_empty());
    }

    #[test]
    fn test_cancel_after_complete_is_noop() {
        let source = GatedSource::default().with("t/0_0.csv", "1,1\n");
        let launcher = InProcessLauncher::new(Arc::new(source));
        let layer = LayerDescriptor::points("cells", "t/{x}_{y}.csv", 10.0, 10.0);
        let events = Events::default();

        let handle = launcher
            .start(JobKind::Points, None, &layer, 10.0, events.observer())
            .unwrap();
        while !handle.state().is_terminal() {
            std::thread::yield_now();
        }
        assert!(!handle.cancel());

        assert_eq!(handle.wait(), JobState::Completed);
        assert_eq!(events.terminal().len(), 1);
    }

    #[test]
    fn test_invalid_layer_fails_before_launch() {
        let launcher = InProcessLauncher::default();
        let layer = LayerDescriptor::points("cells", "", 10.0, 10.0);
        let events = Events::default();

        let result = launcher.start(JobKind::Points, None, &layer, 10.0, events.observer());
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(events.take().is_empty());
    }

    // ========== JobRunner Tests ==========

    fn sh(script: &str) -> JobRunner {
        JobRunner::new(WorkerCommand::new("sh").arg("-c").arg(script))
    }

    fn points_layer() -> LayerDescriptor {
        LayerDescriptor::points("cells", "/tiles/{x}_{y}.csv", 256.0, 256.0)
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_relays_scripted_worker() {
        let script = r#"cat > /dev/null
echo '{"type":"step","progress":1,"total":2}'
echo '{"type":"tileError","message":"tile 1 missing"}'
echo '{"type":"step","progress":2,"total":2}'
echo '{"type":"complete","result":{"kind":"points","count":5,"total":2,"elapsedMs":3}}'
echo '{"type":"complete","result":{"kind":"points","count":6,"total":2,"elapsedMs":3}}'"#;
        let events = Events::default();

        let state = sh(script)
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(state, JobState::Completed);
        assert_eq!(
            events.take(),
            vec![
                Event::Progress(50.0),
                Event::TileError("tile 1 missing".to_string()),
                Event::Progress(100.0),
                Event::Complete(JobResult::Points {
                    count: 5,
                    total: 2,
                    elapsed_ms: 3
                }),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_worker_exit_before_complete_is_error() {
        let events = Events::default();

        let state = sh("cat > /dev/null; exit 3")
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(state, JobState::Failed);
        match &events.terminal()[..] {
            [Event::Error(message)] => assert!(message.contains("exited before completion")),
            other => panic!("Expected one error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_worker_error_message() {
        let events = Events::default();

        sh(r#"cat > /dev/null; echo '{"type":"error","message":"bad polygon"}'"#)
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(
            events.terminal(),
            vec![Event::Error("Worker failed: bad polygon".to_string())]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_garbage_output_is_protocol_error() {
        let events = Events::default();

        let state = sh("cat > /dev/null; echo 'hello'; exec sleep 30")
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(state, JobState::Failed);
        assert!(matches!(&events.terminal()[..], [Event::Error(m)] if m.starts_with("Malformed")));
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_cancel_kills_worker() {
        let events = Events::default();

        let handle = sh("cat > /dev/null; exec sleep 30")
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap();
        handle.cancel();

        assert_eq!(handle.wait(), JobState::Cancelled);
        assert!(events.take().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_timeout() {
        let events = Events::default();

        let state = sh("cat > /dev/null; exec sleep 30")
            .with_timeout(Duration::from_millis(100))
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(state, JobState::Failed);
        assert!(matches!(&events.terminal()[..], [Event::Error(m)] if m.starts_with("No result")));
    }

    /// Drains the request, closes stdout and keeps running for 5 seconds.
    #[cfg(unix)]
    const SILENT_WORKER: &str = "cat > /dev/null; exec 1>&-; exec sleep 5";

    #[cfg(unix)]
    #[test]
    fn test_runner_cancel_kills_worker_with_closed_output() {
        let events = Events::default();
        let started = Instant::now();

        let handle = sh(SILENT_WORKER)
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap();
        handle.cancel();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.wait(), JobState::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(events.take().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_timeout_kills_worker_with_closed_output() {
        let events = Events::default();
        let started = Instant::now();

        let state = sh(SILENT_WORKER)
            .with_timeout(Duration::from_millis(100))
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(state, JobState::Failed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(&events.terminal()[..], [Event::Error(m)] if m.starts_with("No result")));
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_closed_output_fails_job() {
        let events = Events::default();
        let started = Instant::now();

        let state = sh(SILENT_WORKER)
            .start(JobKind::Points, None, &points_layer(), 256.0, events.observer())
            .unwrap()
            .wait();

        assert_eq!(state, JobState::Failed);
        assert!(started.elapsed() < Duration::from_secs(2));
        match &events.terminal()[..] {
            [Event::Error(message)] => assert!(message.contains("closed its output")),
            other => panic!("Expected one error, got {:?}", other),
        }
    }

    #[test]
    fn test_runner_spawn_failure() {
        let runner = JobRunner::new(WorkerCommand::new("/nonexistent/atlas-worker"));
        let result = runner.start(
            JobKind::Points,
            None,
            &points_layer(),
            256.0,
            Events::default().observer(),
        );
        assert!(matches!(result, Err(Error::Worker(_))));
    }

    #[test]
    fn test_runner_rejects_invalid_layer_without_spawning() {
        // The program does not exist: reaching spawn would be a Worker error
        let runner = JobRunner::new(WorkerCommand::new("/nonexistent/atlas-worker"));
        let layer = LayerDescriptor::points("cells", "/tiles/{x}_{y}.csv", 256.0, 0.0);
        let result = runner.start(JobKind::Points, None, &layer, 256.0, Events::default().observer());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
