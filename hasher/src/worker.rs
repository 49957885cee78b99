//! This module provides the per-worker two-stage hashing pipeline.
//!
//! Each worker runs two tasks connected by a bounded stage channel: a reading stage owning the
//! file lifecycle and a hashing stage owning the sink of the request currently processed. The
//! reading stage is the single control-processing point of the worker; pause/resume/abort are
//! forwarded downstream as [`StageMsg`]s so both stages observe them consistently while partial
//! digest state survives pause boundaries.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::{fs, join};

use crate::engine::{HashError, HashResult, Request, Signal};
use crate::sink::Finalizer;

/// Read chunk size, which is also the granularity of pause checks within a file.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Messages flowing from the reading stage to the hashing stage.
///
/// `Reset` and `EndOfFile` are internal bookkeeping, never exposed to callers.
enum StageMsg {
    /// A new file was opened; the hashing stage takes ownership of the request and its sink.
    Begin(Request),
    /// The next run of file bytes, in read order.
    Chunk(Bytes),
    /// The current file is fully read; finalize and emit its result.
    EndOfFile,
    /// The current file was abandoned mid-stream; discard partial state without emitting.
    Reset,
    /// Hold with partial state preserved.
    Pause,
    /// Pause is over.
    Resume,
    /// Terminate without emitting a result for a file in progress.
    Abort,
}

/// Handle on a spawned worker, its task pair running in the background.
#[derive(Debug)]
pub(crate) struct Worker {
    pub(crate) id: usize,
    /// Inbound request channel, handed out to the dispatcher. Capacity 1: a full inbox marks the
    /// worker as busy for the non-blocking handoff.
    pub(crate) input: mpsc::Sender<Request>,
    /// Control channel serviced by the reading stage.
    pub(crate) control: mpsc::Sender<Signal>,
    reader: JoinHandle<()>,
    hasher: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker task pair emitting results on `out`.
    pub(crate) fn spawn(out: mpsc::Sender<HashResult>) -> Worker {
        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let id = WORKER_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Starting worker {id}...");

        let (input, requests) = mpsc::channel(1);
        let (control, signals) = mpsc::channel(1);
        let (stage, chunks) = mpsc::channel(1);

        let reader = Reader {
            id,
            input: requests,
            control: signals,
            stage,
            out: out.clone(),
            buffers: [BytesMut::with_capacity(CHUNK_SIZE), BytesMut::with_capacity(CHUNK_SIZE)],
            active: 0,
            failed: false,
        };

        let hasher = Hasher {
            id,
            stage: chunks,
            out,
            current: None,
        };

        Worker {
            id,
            input,
            control,
            reader: tokio::spawn(reader.run()),
            hasher: tokio::spawn(hasher.run()),
        }
    }

    /// Wait for both stage tasks to terminate.
    pub(crate) async fn join(self) {
        let _ = join!(self.reader, self.hasher);
    }
}

/// The reading stage: owns the file lifecycle of the request it currently holds.
struct Reader {
    id: usize,
    input: mpsc::Receiver<Request>,
    control: mpsc::Receiver<Signal>,
    stage: mpsc::Sender<StageMsg>,
    out: mpsc::Sender<HashResult>,
    /// Two pre-allocated read buffers used alternately, so the hashing stage can still hold one
    /// chunk while the next read fills the other buffer.
    buffers: [BytesMut; 2],
    active: usize,
    /// The previous file was abandoned mid-stream; the hashing stage must process a `Reset`
    /// before any bytes of the next file.
    failed: bool,
}

impl Reader {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                signal = self.control.recv() => match signal {
                    Some(Signal::Pause) => {
                        if self.pause().await.is_break() {
                            break;
                        }
                    }
                    Some(Signal::Resume) => { /* not paused, nothing to resume */ }
                    Some(Signal::Abort) | None => {
                        tracing::debug!("Worker {} aborted.", self.id);
                        let _ = self.stage.send(StageMsg::Abort).await;
                        break;
                    }
                },
                request = self.input.recv() => match request {
                    Some(request) => {
                        if self.process(request).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("Worker {} quit, input channel closed.", self.id);
                        break;
                    }
                },
            }
        }
    }

    /// Read `request`'s file chunk by chunk, forwarding everything to the hashing stage.
    ///
    /// Returns `Break` when the worker must terminate.
    async fn process(&mut self, request: Request) -> ControlFlow<()> {
        tracing::debug!("Worker {}: hashing started for `{}`.", self.id, request.file);

        let mut file = match fs::File::open(&request.file).await {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!("Worker {}: open failed for `{}`.", self.id, request.file);

                // the hashing stage never sees this request, hand the sink straight back
                return self.emit(HashResult {
                    file: request.file,
                    sink: Some(request.sink),
                    digest: None,
                    error: Some(HashError::Open(err)),
                })
                .await;
            }
        };

        if std::mem::take(&mut self.failed) && self.stage.send(StageMsg::Reset).await.is_err() {
            return ControlFlow::Break(());
        }

        let name = request.file.clone();
        if self.stage.send(StageMsg::Begin(request)).await.is_err() {
            return ControlFlow::Break(());
        }

        loop {
            let buffer = &mut self.buffers[self.active];
            // reclaims the buffer's block once the hashing stage has released the previous chunk,
            // otherwise grabs a fresh one
            buffer.reserve(CHUNK_SIZE);

            match file.read_buf(buffer).await {
                Ok(0) => {
                    tracing::trace!("Worker {}: end of file for `{name}`.", self.id);

                    if self.stage.send(StageMsg::EndOfFile).await.is_err() {
                        return ControlFlow::Break(());
                    }
                    return ControlFlow::Continue(());
                }
                Ok(_) => {
                    let chunk = buffer.split().freeze();
                    self.active ^= 1;

                    if self.stage.send(StageMsg::Chunk(chunk)).await.is_err() {
                        return ControlFlow::Break(());
                    }
                }
                Err(err) => {
                    tracing::debug!("Worker {}: read failed for `{name}`.", self.id);

                    // the hashing stage holds partial state for this file, flag the reset
                    self.failed = true;
                    return self.emit(HashResult {
                        file: name,
                        sink: None,
                        digest: None,
                        error: Some(HashError::Read(err)),
                    })
                    .await;
                }
            }

            // pause check, between chunks only
            match self.control.try_recv() {
                Ok(Signal::Pause) => {
                    if self.pause().await.is_break() {
                        return ControlFlow::Break(());
                    }
                }
                Ok(Signal::Resume) => {}
                Ok(Signal::Abort) => {
                    tracing::debug!("Worker {} aborted while hashing `{name}`.", self.id);
                    let _ = self.stage.send(StageMsg::Abort).await;
                    return ControlFlow::Break(());
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
            }
        }
    }

    /// Forward the pause downstream first, then hold until resume or abort.
    async fn pause(&mut self) -> ControlFlow<()> {
        tracing::debug!("Worker {} paused.", self.id);

        if self.stage.send(StageMsg::Pause).await.is_err() {
            return ControlFlow::Break(());
        }

        loop {
            match self.control.recv().await {
                Some(Signal::Resume) => {
                    tracing::debug!("Worker {} resumed.", self.id);

                    if self.stage.send(StageMsg::Resume).await.is_err() {
                        return ControlFlow::Break(());
                    }
                    return ControlFlow::Continue(());
                }
                Some(Signal::Pause) => { /* already paused */ }
                Some(Signal::Abort) | None => {
                    tracing::debug!("Worker {} aborted while paused.", self.id);
                    let _ = self.stage.send(StageMsg::Abort).await;
                    return ControlFlow::Break(());
                }
            }
        }
    }

    async fn emit(&self, result: HashResult) -> ControlFlow<()> {
        // results abandoned altogether means the engine side is gone
        match self.out.send(result).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// The hashing stage: feeds the sink of the request currently owned by the worker.
struct Hasher {
    id: usize,
    stage: mpsc::Receiver<StageMsg>,
    out: mpsc::Sender<HashResult>,
    /// The request whose bytes are being accumulated, installed by `StageMsg::Begin`.
    current: Option<Request>,
}

impl Hasher {
    async fn run(mut self) {
        while let Some(msg) = self.stage.recv().await {
            match msg {
                StageMsg::Begin(request) => {
                    debug_assert!(self.current.is_none(), "request began over partial state");
                    self.current = Some(request);
                }
                StageMsg::Chunk(chunk) => {
                    if let Some(request) = &mut self.current {
                        request.sink.write(&chunk);
                    }
                }
                StageMsg::EndOfFile => {
                    let Some(request) = self.current.take() else {
                        continue;
                    };

                    let Request { file, mut sink } = request;
                    let digest = sink.finalizer().map(Finalizer::finalize_reset);

                    tracing::debug!("Worker {}: hashing finished for `{file}`.", self.id);

                    let result = HashResult {
                        file,
                        sink: Some(sink),
                        digest,
                        error: None,
                    };

                    if self.out.send(result).await.is_err() {
                        break;
                    }
                }
                StageMsg::Reset => {
                    // the reading stage reported the failure, partial state is just dropped
                    self.current = None;
                }
                StageMsg::Pause | StageMsg::Resume => { /* partial state is kept as-is */ }
                StageMsg::Abort => {
                    tracing::debug!("Worker {} hashing stage aborted.", self.id);
                    break;
                }
            }
        }
    }
}
