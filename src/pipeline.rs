//! Pipeline runtime (spec 4.4, spec 5): a DAG of stages connected by
//! bounded queues and, between compression and upload, a unidirectional
//! control-then-bytes pipe.
//!
//! Grounded on the teacher's `Arc<RwLock<_>>`-managers-driven async
//! orchestration in `backup.rs`, generalized into an explicit stage/queue
//! graph, and on `original_source/tests/test_subprocess_pipeline.py` plus
//! `backup_core.py`'s `BackupPipelineWorkItem`/queue classes for the
//! stage-and-queue shape. True OS subprocess workers are out of scope for
//! a library core; `Subprocess`/`SubprocessPiped` stages are modeled as
//! work dispatched onto the Tokio blocking-pool via `spawn_blocking`,
//! which gives the same "isolated from the async reactor" property a
//! worker process pool provides without actually forking.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::bid::BackupFileInformation;
use crate::error::{PipelineError, PipelineResult};

/// Default bounded-queue depth between stages.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;
/// Default cap on outstanding per-source work items the orchestrator keeps
/// in flight (spec 4.4 "Concurrency contract").
pub const MAX_SIMULTANEOUS_FILE_BACKUPS: usize = 5;
/// Capacity of the bounded chunk queue inside an upload's reader/writer
/// pair (spec 5 "Per-upload internal concurrency").
pub const PIPE_CHANNEL_CAPACITY: usize = 5;
/// How often the pipe reader polls the writer future (spec 5).
pub const QUEUE_PUT_TIMEOUT: Duration = Duration::from_secs(5);

/// `min(cpu_count / 2, 15)`, the default worker-pool size for a stage
/// (spec 4.4 "Concurrency contract").
pub fn default_pool_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(1).min(15)
}

/// A message flowing over a pipe-connected stage pair (spec 4.4
/// "Pipe-connected stages"). The producer sends exactly one
/// `CompViaPipe` control message before either streaming `Chunk`s
/// (terminated by an empty chunk as EOF) or dropping the sender to
/// abandon the pipe.
#[derive(Debug)]
pub enum PipeMessage {
    CompViaPipe(bool),
    Chunk(Bytes),
}

/// The producing half of a pipe-connected stage pair.
pub struct PipeSender(mpsc::Sender<PipeMessage>);

impl PipeSender {
    pub async fn send_control(&self, comp_via_pipe: bool) -> PipelineResult<()> {
        self.0
            .send(PipeMessage::CompViaPipe(comp_via_pipe))
            .await
            .map_err(|_| {
                PipelineError::PipeProtocolViolation(
                    "receiver dropped before control message".to_string(),
                )
            })
    }

    pub async fn send_chunk(&self, chunk: Bytes) -> PipelineResult<()> {
        self.0.send(PipeMessage::Chunk(chunk)).await.map_err(|_| {
            PipelineError::PipeProtocolViolation("receiver dropped mid-stream".to_string())
        })
    }

    /// Send the empty-chunk EOF marker (spec 4.4).
    pub async fn send_eof(&self) -> PipelineResult<()> {
        self.send_chunk(Bytes::new()).await
    }
}

/// The consuming half of a pipe-connected stage pair.
pub struct PipeReceiver(mpsc::Receiver<PipeMessage>);

impl PipeReceiver {
    /// Receive the leading control message. A protocol violation if
    /// anything else (or a closed pipe) arrives first.
    pub async fn recv_control(&mut self) -> PipelineResult<bool> {
        match self.0.recv().await {
            Some(PipeMessage::CompViaPipe(v)) => Ok(v),
            Some(PipeMessage::Chunk(_)) => Err(PipelineError::PipeProtocolViolation(
                "expected control message before any chunk".to_string(),
            )),
            None => Err(PipelineError::PipeProtocolViolation(
                "pipe closed before control message".to_string(),
            )),
        }
    }

    /// Receive the next chunk, or `None` on the EOF marker or a closed
    /// pipe (an abandoned pipe after the control message looks the same
    /// as a clean EOF to the consumer).
    pub async fn recv_chunk(&mut self) -> PipelineResult<Option<Bytes>> {
        match self.0.recv().await {
            Some(PipeMessage::Chunk(b)) if b.is_empty() => Ok(None),
            Some(PipeMessage::Chunk(b)) => Ok(Some(b)),
            Some(PipeMessage::CompViaPipe(_)) => Err(PipelineError::PipeProtocolViolation(
                "unexpected control message mid-stream".to_string(),
            )),
            None => Ok(None),
        }
    }
}

/// Create a fresh pipe-connected stage pair.
pub fn pipe_channel() -> (PipeSender, PipeReceiver) {
    let (tx, rx) = mpsc::channel(PIPE_CHANNEL_CAPACITY);
    (PipeSender(tx), PipeReceiver(rx))
}

/// One file's journey through the pipeline. Carries the mutable BFI being
/// built up stage by stage, the failure flag stage failures tag
/// cooperatively (spec 4.4 "Cancellation"), and the optional pipe
/// endpoints used between compression and upload.
pub struct WorkItem {
    pub bfi: BackupFileInformation,
    pub source_path: PathBuf,
    pub is_failed: bool,
    pub anomaly: Option<String>,
    pub pipe_tx: Option<PipeSender>,
    pub pipe_rx: Option<PipeReceiver>,
}

impl WorkItem {
    pub fn new(bfi: BackupFileInformation, source_path: PathBuf) -> Self {
        Self {
            bfi,
            source_path,
            is_failed: false,
            anomaly: None,
            pipe_tx: None,
            pipe_rx: None,
        }
    }

    /// Tag this item as failed. Downstream stages must check
    /// `is_for_stage` and pass failed items through untouched rather than
    /// attempt further work on them.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.is_failed = true;
        self.bfi.is_successful = false;
        self.bfi.exception = Some(message.clone());
        self.anomaly = Some(message);
    }
}

/// A pipeline stage: a determiner predicate plus the work it performs for
/// items it claims (spec 4.4).
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this stage has work to do for `item`. An item that fails
    /// this check passes through to the next stage untouched.
    fn is_for_stage(&self, item: &WorkItem) -> bool;

    async fn perform_stage_work(&self, item: WorkItem) -> WorkItem;
}

/// Which worker pool a stage's work is dispatched onto (spec 4.4, spec
/// 9 "Pipeline as tagged stages").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// I/O-bound glue, run on the orchestrator's own async tasks.
    Thread,
    /// CPU-bound work, run on the blocking-task pool.
    Subprocess,
    /// Like `Subprocess`, but the item also carries pipe endpoints for a
    /// neighboring stage.
    SubprocessPiped,
}

/// Configuration for one stage in a [`Pipeline`].
pub struct StageSpec {
    pub kind: StageKind,
    pub stage: Arc<dyn Stage>,
    pub workers: usize,
    pub queue_depth: usize,
}

impl StageSpec {
    pub fn new(kind: StageKind, stage: Arc<dyn Stage>) -> Self {
        Self {
            kind,
            stage,
            workers: default_pool_workers(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

struct RunningStage {
    name: String,
    handle: JoinHandle<()>,
}

/// A built pipeline: submit items at the entry, collect results at the
/// exit, shut down when the source is exhausted.
pub struct Pipeline {
    entry: mpsc::Sender<WorkItem>,
    exit: mpsc::Receiver<WorkItem>,
    stages: Vec<RunningStage>,
}

impl Pipeline {
    /// Wire `specs` into a chain of bounded queues, spawning one driver
    /// task per stage. Each driver task enforces the determiner/pass-
    /// through contract and fans each claimed item out onto the stage's
    /// worker pool, bounded by a per-stage semaphore.
    pub fn build(specs: Vec<StageSpec>) -> Self {
        assert!(!specs.is_empty(), "pipeline must have at least one stage");

        let entry_depth = specs[0].queue_depth;
        let (entry_tx, mut current_rx) = mpsc::channel::<WorkItem>(entry_depth);
        let mut stages = Vec::with_capacity(specs.len());

        for spec in specs {
            let (out_tx, out_rx) = mpsc::channel::<WorkItem>(spec.queue_depth);
            let name = spec.stage.name().to_string();
            let semaphore = Arc::new(Semaphore::new(spec.workers));
            let kind = spec.kind;
            let stage = spec.stage;

            let mut input_rx = current_rx;
            let driver_out_tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
                while let Some(item) = input_rx.recv().await {
                    if !stage.is_for_stage(&item) {
                        if driver_out_tx.send(item).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let stage = stage.clone();
                    let out_tx = driver_out_tx.clone();
                    let task = tokio::spawn(async move {
                        let _permit = permit;
                        let result = match kind {
                            StageKind::Thread => stage.perform_stage_work(item).await,
                            StageKind::Subprocess | StageKind::SubprocessPiped => {
                                let handle = tokio::runtime::Handle::current();
                                tokio::task::spawn_blocking(move || {
                                    handle.block_on(stage.perform_stage_work(item))
                                })
                                .await
                                .expect("subprocess-stage worker panicked")
                            }
                        };
                        let _ = out_tx.send(result).await;
                    });
                    in_flight.push(task);
                    in_flight.retain(|t| !t.is_finished());
                }
                for task in in_flight {
                    let _ = task.await;
                }
            });

            stages.push(RunningStage { name, handle });
            current_rx = out_rx;
        }

        Self {
            entry: entry_tx,
            exit: current_rx,
            stages,
        }
    }

    /// Submit a work item at the entry of the pipeline. Blocks (providing
    /// backpressure) if the first stage's queue is full.
    pub async fn submit(&self, item: WorkItem) -> PipelineResult<()> {
        self.entry
            .send(item)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Receive the next item to complete the final stage. Items may
    /// complete out of submission order (spec 5 "Ordering").
    pub async fn recv(&mut self) -> Option<WorkItem> {
        self.exit.recv().await
    }

    /// Two-phase shutdown (spec 4.4): stop accepting new items by
    /// dropping the entry sender, then drain in-flight items and join
    /// every stage driver task. Returns the items still draining through
    /// the exit so the caller does not lose results submitted before
    /// shutdown began.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> PipelineResult<Vec<WorkItem>> {
        drop(self.entry);

        let mut drained = Vec::new();
        let drain_deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            match tokio::time::timeout_at(drain_deadline, self.exit.recv()).await {
                Ok(Some(item)) => drained.push(item),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        for stage in self.stages {
            match tokio::time::timeout(drain_timeout, stage.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(PipelineError::StageAborted(stage.name));
                }
                Err(_) => {
                    return Err(PipelineError::ShutdownTimeout(stage.name));
                }
            }
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UppercaseStage {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Stage for UppercaseStage {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn is_for_stage(&self, item: &WorkItem) -> bool {
            !item.is_failed
        }

        async fn perform_stage_work(&self, mut item: WorkItem) -> WorkItem {
            self.calls.fetch_add(1, Ordering::SeqCst);
            item.bfi.path = item.bfi.path.to_uppercase();
            item
        }
    }

    struct FailingStage;

    #[async_trait]
    impl Stage for FailingStage {
        fn name(&self) -> &str {
            "failing"
        }

        fn is_for_stage(&self, item: &WorkItem) -> bool {
            !item.is_failed
        }

        async fn perform_stage_work(&self, mut item: WorkItem) -> WorkItem {
            if item.bfi.path.contains("bad") {
                item.fail("synthetic failure");
            }
            item
        }
    }

    fn item(path: &str) -> WorkItem {
        WorkItem::new(
            BackupFileInformation::new(path.to_string(), path.to_string(), "/src".to_string()),
            PathBuf::from(path),
        )
    }

    #[tokio::test]
    async fn single_stage_processes_items() {
        let stage = Arc::new(UppercaseStage {
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::build(vec![StageSpec::new(StageKind::Thread, stage.clone())]);

        pipeline.submit(item("a.txt")).await.unwrap();
        pipeline.submit(item("b.txt")).await.unwrap();

        let mut results = Vec::new();
        let mut pipeline = pipeline;
        for _ in 0..2 {
            results.push(pipeline.recv().await.unwrap());
        }
        results.sort_by(|a, b| a.bfi.path.cmp(&b.bfi.path));
        assert_eq!(results[0].bfi.path, "A.TXT");
        assert_eq!(results[1].bfi.path, "B.TXT");
        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);

        pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_items_pass_through_downstream_stage_untouched() {
        let failing = Arc::new(FailingStage);
        let uppercase = Arc::new(UppercaseStage {
            calls: AtomicUsize::new(0),
        });
        let mut pipeline = Pipeline::build(vec![
            StageSpec::new(StageKind::Thread, failing),
            StageSpec::new(StageKind::Thread, uppercase.clone()),
        ]);

        pipeline.submit(item("bad.txt")).await.unwrap();
        let result = pipeline.recv().await.unwrap();
        assert!(result.is_failed);
        // The uppercase stage declines failed items, so the path is
        // untouched by it.
        assert_eq!(result.bfi.path, "bad.txt");
        assert_eq!(uppercase.calls.load(Ordering::SeqCst), 0);

        pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn pipe_control_then_chunks_then_eof() {
        let (tx, mut rx) = pipe_channel();
        tokio::spawn(async move {
            tx.send_control(true).await.unwrap();
            tx.send_chunk(Bytes::from_static(b"hello")).await.unwrap();
            tx.send_eof().await.unwrap();
        });

        assert!(rx.recv_control().await.unwrap());
        assert_eq!(
            rx.recv_chunk().await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(rx.recv_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_items() {
        let stage = Arc::new(UppercaseStage {
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::build(vec![StageSpec::new(StageKind::Thread, stage)]);
        pipeline.submit(item("c.txt")).await.unwrap();
        let drained = pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].bfi.path, "C.TXT");
    }
}
