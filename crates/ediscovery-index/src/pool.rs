//! Worker pool abstraction for CPU-bound text extraction (§4.5, §5:
//! "process isolation, not threads").
//!
//! [`ProcessWorkerPool`] is the production implementation: it spawns OS
//! processes and speaks the protocol in
//! `ediscovery_extraction::worker_protocol`. [`ThreadPoolWorkerPool`] is an
//! in-process stand-in used by this workspace's own tests so they don't need
//! to spawn real subprocesses — it implements the identical `WorkerPool`
//! trait and is not part of the production contract.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use ediscovery_extraction::worker_protocol::{read_message, write_message, Job as WireJob, Outcome as WireOutcome};
use ediscovery_extraction::ExtractionFacade;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::engine::IndexError;

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub sha256: String,
    pub path: PathBuf,
    pub doctype: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub sha256: String,
    pub text: String,
    pub metadata: HashMap<String, JsonValue>,
    pub skip_reason: Option<String>,
}

/// A worker that crashed mid-job; the coordinator logs `EXTRACTION_FAILED`
/// and counts the document as skipped.
#[derive(Debug, Clone)]
pub struct WorkerCrash {
    pub sha256: String,
    pub path: PathBuf,
    pub reason: String,
}

pub enum PoolEvent {
    Outcome(ExtractionOutcome),
    Crash(WorkerCrash),
}

/// Dispatches extraction jobs to a bounded pool of isolated workers.
pub trait WorkerPool {
    /// Blocks if the in-flight queue is already at the `2 * workers`
    /// backpressure limit.
    fn submit(&mut self, job: ExtractionJob) -> Result<(), IndexError>;
    /// Blocks until the next job completes or crashes.
    fn recv(&mut self) -> Option<PoolEvent>;
    /// Number of jobs submitted but not yet completed.
    fn in_flight(&self) -> usize;
    /// Signals no more jobs will be submitted; workers may shut down once
    /// drained.
    fn close(&mut self);
}

/// In-process stand-in backed by OS threads and an [`ExtractionFacade`].
/// Test-only: the production pool is [`ProcessWorkerPool`].
pub struct ThreadPoolWorkerPool {
    job_tx: Option<SyncSender<ExtractionJob>>,
    event_rx: Receiver<PoolEvent>,
    handles: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl ThreadPoolWorkerPool {
    pub fn new(workers: usize, facade: Arc<ExtractionFacade>) -> Self {
        let workers = workers.max(1);
        let queue_capacity = 2 * workers;
        let (job_tx, job_rx) = mpsc::sync_channel::<ExtractionJob>(queue_capacity);
        let job_rx = Arc::new(std::sync::Mutex::new(job_rx));
        let (event_tx, event_rx) = mpsc::channel::<PoolEvent>();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let event_tx = event_tx.clone();
            let facade = facade.clone();
            handles.push(std::thread::spawn(move || loop {
                let job = {
                    let rx = job_rx.lock().expect("job queue mutex poisoned");
                    rx.recv()
                };
                let job = match job {
                    Ok(j) => j,
                    Err(_) => return,
                };
                let meta = ediscovery_discovery::DocumentMetadata {
                    sha256: job.sha256.clone(),
                    path: job.path,
                    size_bytes: 0,
                    mtime: chrono::Utc::now(),
                    custodian: None,
                    doctype: job.doctype,
                };
                let result = facade.extract(&meta);
                let outcome = ExtractionOutcome {
                    sha256: job.sha256,
                    text: result.text,
                    metadata: result.metadata,
                    skip_reason: result.skip_reason,
                };
                if event_tx.send(PoolEvent::Outcome(outcome)).is_err() {
                    return;
                }
            }));
        }

        Self { job_tx: Some(job_tx), event_rx, handles, in_flight: 0 }
    }
}

impl WorkerPool for ThreadPoolWorkerPool {
    fn submit(&mut self, job: ExtractionJob) -> Result<(), IndexError> {
        if let Some(tx) = &self.job_tx {
            tx.send(job).map_err(|_| IndexError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker pool closed")))?;
            self.in_flight += 1;
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<PoolEvent> {
        let event = self.event_rx.recv().ok();
        if event.is_some() {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        event
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn close(&mut self) {
        self.job_tx.take();
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPoolWorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

struct WorkerProcess {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    consecutive_failures: u32,
    alive: bool,
}

/// Production worker pool: spawns `workers` copies of `worker_binary` and
/// round-robins jobs to them over the stdin/stdout framing protocol.
pub struct ProcessWorkerPool {
    workers: Vec<WorkerProcess>,
    next_worker: usize,
    event_rx: Receiver<PoolEvent>,
    event_tx: Sender<PoolEvent>,
    reader_handles: Vec<JoinHandle<()>>,
    in_flight: usize,
    queue_capacity: usize,
}

impl ProcessWorkerPool {
    pub fn spawn(worker_binary: &std::path::Path, worker_count: usize) -> Result<Self, IndexError> {
        let worker_count = worker_count.max(1);
        let (event_tx, event_rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(worker_count);
        let mut reader_handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let mut child = Command::new(worker_binary)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()?;
            let stdin = BufWriter::new(child.stdin.take().expect("piped stdin"));
            let stdout: ChildStdout = child.stdout.take().expect("piped stdout");

            let event_tx = event_tx.clone();
            reader_handles.push(std::thread::spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_message::<_, WireOutcome>(&mut reader) {
                        Ok(Some(wire)) => {
                            let outcome = ExtractionOutcome {
                                sha256: wire.sha256,
                                text: wire.text,
                                metadata: wire.metadata,
                                skip_reason: wire.skip_reason,
                            };
                            if event_tx.send(PoolEvent::Outcome(outcome)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(worker_id, error = %e, "worker stdout read error");
                            return;
                        }
                    }
                }
            }));

            workers.push(WorkerProcess { child, stdin: Some(stdin), consecutive_failures: 0, alive: true });
        }

        Ok(Self {
            workers,
            next_worker: 0,
            event_rx,
            event_tx,
            reader_handles,
            in_flight: 0,
            queue_capacity: 2 * worker_count,
        })
    }

    fn pick_worker(&mut self) -> Option<usize> {
        let n = self.workers.len();
        for offset in 0..n {
            let idx = (self.next_worker + offset) % n;
            if self.workers[idx].alive {
                self.next_worker = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }
}

impl WorkerPool for ProcessWorkerPool {
    fn submit(&mut self, job: ExtractionJob) -> Result<(), IndexError> {
        let Some(idx) = self.pick_worker() else {
            return Err(IndexError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no live extraction workers remain")));
        };

        let wire = WireJob { sha256: job.sha256.clone(), path: job.path.display().to_string(), doctype: job.doctype };
        let worker = &mut self.workers[idx];
        let Some(stdin) = worker.stdin.as_mut() else {
            return Err(IndexError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin already closed")));
        };
        match write_message(stdin, &wire) {
            Ok(()) => {
                worker.consecutive_failures = 0;
                self.in_flight += 1;
                Ok(())
            }
            Err(e) => {
                worker.consecutive_failures += 1;
                let crashed_twice = worker.consecutive_failures >= 2;
                if crashed_twice {
                    worker.alive = false;
                }
                let _ = self.event_tx.send(PoolEvent::Crash(WorkerCrash {
                    sha256: job.sha256,
                    path: job.path,
                    reason: e.to_string(),
                }));
                Ok(())
            }
        }
    }

    fn recv(&mut self) -> Option<PoolEvent> {
        if self.in_flight == 0 {
            return self.event_rx.try_recv().ok();
        }
        let event = self.event_rx.recv().ok();
        if let Some(PoolEvent::Outcome(_)) = &event {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        event
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn close(&mut self) {
        for worker in &mut self.workers {
            worker.stdin.take();
            let _ = worker.child.wait();
        }
    }
}

impl Drop for ProcessWorkerPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            let _ = worker.child.kill();
            let _ = worker.child.wait();
        }
        while let Some(handle) = self.reader_handles.pop() {
            let _ = handle.join();
        }
    }
}

pub fn default_queue_capacity(workers: usize) -> usize {
    2 * workers.max(1)
}
