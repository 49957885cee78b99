//! This module provides the public engine facade and its data types.

use std::fmt;
use std::io;
use std::num::NonZeroU8;

use futures::future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::sink::Sink;
use crate::worker::Worker;

/// How many submissions may be admitted ahead of the dispatcher's own queue.
const SUBMIT_BACKLOG: usize = 64;
/// How many completed results may pile up before workers block on delivery.
const RESULT_BACKLOG: usize = 16;

/// Engine-level caller-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine has not been started, or has been stopped.
    #[error("engine is not running")]
    NotRunning,
    /// All results have been delivered and no more can ever arrive.
    #[error("result channel closed")]
    Closed,
    /// A digest was requested from a sink without the finalize capability.
    #[error("sink does not finalize to a digest")]
    SinkTypeMismatch,
}

/// Per-file I/O errors, carried inside the file's [`HashResult`].
///
/// They never affect other in-flight or queued files and are never retried.
#[derive(Debug, Error)]
pub enum HashError {
    /// The file could not be opened.
    #[error("failed to open file")]
    Open(#[source] io::Error),
    /// A read failed mid-stream; the file was abandoned.
    #[error("failed to read file")]
    Read(#[source] io::Error),
}

/// Control signals broadcast by the engine to the dispatcher and to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Pause,
    Resume,
    Abort,
}

/// A submitted unit of work: one file identifier and the sink receiving its bytes.
pub(crate) struct Request {
    pub(crate) file: String,
    pub(crate) sink: Box<dyn Sink>,
}

/// The outcome of one submitted file.
pub struct HashResult {
    /// File identifier as submitted.
    pub file: String,
    /// The sink handed back after processing.
    ///
    /// `None` when the file was abandoned mid-stream, in which case the sink's partial state was
    /// discarded by the hashing stage.
    pub sink: Option<Box<dyn Sink>>,
    /// The finalized digest, when the sink exposes the finalize capability.
    pub digest: Option<Vec<u8>>,
    /// The I/O failure for this file, if any.
    pub error: Option<HashError>,
}

impl HashResult {
    /// The digest computed for this file.
    ///
    /// Fails with [`Error::SinkTypeMismatch`] when the result was produced through a sink that
    /// does not finalize to a digest.
    pub fn digest(&self) -> Result<&[u8], Error> {
        self.digest.as_deref().ok_or(Error::SinkTypeMismatch)
    }
}

impl fmt::Debug for HashResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashResult")
            .field("file", &self.file)
            .field("digest", &self.digest)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A concurrent file-hashing engine.
///
/// Files are submitted at runtime together with a [`Sink`] receiving their bytes; a dispatcher
/// task hands each request to a worker of the pool, and every worker overlaps disk reads with
/// digest computation through its internal two-stage pipeline. The whole engine can be paused,
/// resumed and stopped at runtime.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// use hasher::{sink::Sha1Sink, FileHasher};
///
/// let mut engine = FileHasher::default();
/// engine.start();
///
/// engine.submit("Cargo.toml", Sha1Sink::new()).await.unwrap();
///
/// let result = engine.next_result().await.unwrap();
/// println!("{}: {}", result.file, hex::encode(result.digest().unwrap()));
///
/// engine.shutdown().await;
/// # })
/// ```
///
/// Completion order across files is not guaranteed; submissions are admitted first-in first-out
/// but several workers drain the queue concurrently.
#[derive(Debug)]
pub struct FileHasher {
    pool_size: NonZeroU8,
    /// Sending half of the submission queue; present exactly while running.
    queue: Option<mpsc::Sender<Request>>,
    /// Receiving half of the results channel.
    results: Option<mpsc::Receiver<HashResult>>,
    /// Dispatcher control channel.
    control: Option<mpsc::Sender<Signal>>,
    dispatcher: Option<JoinHandle<()>>,
    /// The pool of workers.
    workers: Vec<Worker>,
}

impl Default for FileHasher {
    /// An engine with a pool of one worker, processing submissions sequentially.
    fn default() -> Self {
        Self::new(NonZeroU8::MIN)
    }
}

impl FileHasher {
    /// Create an engine with a pool of `pool_size` workers.
    pub fn new(pool_size: NonZeroU8) -> Self {
        Self {
            pool_size,
            queue: None,
            results: None,
            control: None,
            dispatcher: None,
            workers: vec![],
        }
    }

    /// Whether the engine currently accepts submissions.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.queue.is_some()
    }

    /// Start the engine: spawn the worker pool and the dispatcher task.
    ///
    /// No-op when already running. Must be called within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let (queue, submissions) = mpsc::channel(SUBMIT_BACKLOG);
        let (out, results) = mpsc::channel(RESULT_BACKLOG);
        let (control, signals) = mpsc::channel(1);

        self.workers = (0..self.pool_size.get()).map(|_| Worker::spawn(out.clone())).collect();

        let inputs = self.workers.iter().map(|worker| worker.input.clone()).collect();
        let dispatcher = Dispatcher::new(submissions, signals, inputs);

        self.dispatcher = Some(tokio::spawn(dispatcher.run()));
        self.control = Some(control);
        self.results = Some(results);
        self.queue = Some(queue);
    }

    /// Submit a file for hashing into `sink`.
    ///
    /// Fails with [`Error::NotRunning`] before [`start()`](Self::start) or after
    /// [`stop()`](Self::stop); otherwise only waits for queue admission.
    pub async fn submit(&self, file: impl Into<String>, sink: impl Sink + 'static) -> Result<(), Error> {
        let queue = self.queue.as_ref().ok_or(Error::NotRunning)?;

        let request = Request {
            file: file.into(),
            sink: Box::new(sink),
        };

        queue.send(request).await.map_err(|_| Error::NotRunning)
    }

    /// Suspend the dispatcher and every worker at their next control check.
    ///
    /// Partial digest state of in-flight files is preserved across the pause. Pausing while
    /// already paused is harmless.
    pub fn pause(&self) {
        self.broadcast(Signal::Pause);
    }

    /// Resume a paused engine.
    pub fn resume(&self) {
        self.broadcast(Signal::Resume);
    }

    /// Stop the engine, aborting the dispatcher and every worker.
    ///
    /// In-flight files are abandoned: no result is guaranteed for them, and queued-but-unassigned
    /// requests are discarded. Results already produced can still be drained with
    /// [`next_result()`](Self::next_result); further submissions fail with [`Error::NotRunning`].
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        self.broadcast(Signal::Abort);
        self.control = None;
        self.queue = None;
    }

    /// Stop the engine and wait for the dispatcher and every worker task to terminate.
    ///
    /// Workers block on result delivery when the output backlog is full, so drain pending
    /// results with [`next_result()`](Self::next_result) first if completions may be piled up.
    pub async fn shutdown(&mut self) {
        self.stop();

        let workers = std::mem::take(&mut self.workers);

        future::join_all(workers.into_iter().map(|worker| {
            tracing::debug!("Stopping worker {}...", worker.id);
            worker.join()
        }))
        .await;

        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
    }

    /// Receive the next completed result, blocking until one is available.
    ///
    /// Fails with [`Error::NotRunning`] when the engine was never started, and with
    /// [`Error::Closed`] once the output channel is permanently drained after
    /// [`stop()`](Self::stop).
    pub async fn next_result(&mut self) -> Result<HashResult, Error> {
        let results = self.results.as_mut().ok_or(Error::NotRunning)?;

        results.recv().await.ok_or(Error::Closed)
    }

    /// Deliver `signal` to the dispatcher and every worker, one send task per recipient so that a
    /// blocked recipient cannot delay delivery to the others.
    fn broadcast(&self, signal: Signal) {
        let recipients = self
            .control
            .iter()
            .chain(self.workers.iter().map(|worker| &worker.control));

        for recipient in recipients {
            let recipient = recipient.clone();

            tokio::spawn(async move {
                let _ = recipient.send(signal).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Sha1Sink;

    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    use sha1::{Digest, Sha1};

    // well-known SHA-1 reference vectors
    const SHA1_EMPTY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
    const SHA1_FOOBAR: &str = "8843d7f92416211de9ebb963ff4ce28125932878";

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path.to_str().unwrap().to_owned()
    }

    /// 1 MiB of deterministic, non-repeating-period content.
    fn known_content() -> Vec<u8> {
        (0..1024 * 1024).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_empty_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write_file(dir.path(), "empty.txt", b"");

        let mut engine = FileHasher::default();
        engine.start();

        engine.submit(empty, Sha1Sink::new()).await.unwrap();

        let result = engine.next_result().await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(hex::encode(result.digest().unwrap()), SHA1_EMPTY);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_known_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let content = known_content();
        let file = write_file(dir.path(), "random_1mb.dat", &content);

        let mut engine = FileHasher::default();
        engine.start();

        engine.submit(file, Sha1Sink::new()).await.unwrap();

        let result = engine.next_result().await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(result.digest().unwrap(), Sha1::digest(&content).as_slice());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_foobar_reference_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "foobar.txt", b"foobar");

        let mut engine = FileHasher::default();
        engine.start();

        engine.submit(file, Sha1Sink::new()).await.unwrap();

        let result = engine.next_result().await.unwrap();
        assert_eq!(hex::encode(result.digest().unwrap()), SHA1_FOOBAR);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_failure_does_not_affect_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let valid_a = write_file(dir.path(), "a.txt", b"foobar");
        let valid_b = write_file(dir.path(), "b.txt", b"foobar");

        let mut engine = FileHasher::new(2.try_into().unwrap());
        engine.start();

        engine.submit("path/is/unlikely/to/exist", Sha1Sink::new()).await.unwrap();
        engine.submit(&*valid_a, Sha1Sink::new()).await.unwrap();
        engine.submit(&*valid_b, Sha1Sink::new()).await.unwrap();

        let mut failures = 0;
        for _ in 0..3 {
            let result = engine.next_result().await.unwrap();

            match result.error {
                Some(HashError::Open(_)) => {
                    assert_eq!(result.file, "path/is/unlikely/to/exist");
                    assert!(result.digest.is_none());
                    failures += 1;
                }
                Some(ref err) => panic!("unexpected error for `{}`: {err}", result.file),
                None => assert_eq!(hex::encode(result.digest().unwrap()), SHA1_FOOBAR),
            }
        }

        assert_eq!(failures, 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_pause_resume_preserves_digest() {
        let dir = tempfile::tempdir().unwrap();
        // large enough for several 4 MiB chunks, so pauses land between chunk forwards
        let content: Vec<u8> = known_content().repeat(12);
        let file = write_file(dir.path(), "large.dat", &content);

        let mut engine = FileHasher::default();
        engine.start();

        engine.submit(file, Sha1Sink::new()).await.unwrap();

        for _ in 0..3 {
            engine.pause();
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.resume();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let result = engine.next_result().await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(result.digest().unwrap(), Sha1::digest(&content).as_slice());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_backlog_drains_through_single_worker() {
        let dir = tempfile::tempdir().unwrap();

        let mut engine = FileHasher::default();
        engine.start();

        for i in 0..5 {
            let file = write_file(dir.path(), &format!("file{i}.txt"), format!("content #{i}").as_bytes());
            engine.submit(file, Sha1Sink::new()).await.unwrap();
        }

        let mut digests = HashMap::new();
        for _ in 0..5 {
            let result = engine.next_result().await.unwrap();
            assert!(result.error.is_none());
            digests.insert(result.file.clone(), result.digest().unwrap().to_vec());
        }

        assert_eq!(digests.len(), 5);
        for (file, digest) in digests {
            let content = std::fs::read(&file).unwrap();
            assert_eq!(digest, Sha1::digest(&content).to_vec());
        }

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_completes_more_files_than_workers() {
        let dir = tempfile::tempdir().unwrap();

        let mut engine = FileHasher::new(3.try_into().unwrap());
        engine.start();

        for i in 0..10 {
            let file = write_file(dir.path(), &format!("file{i}.txt"), format!("content #{i}").as_bytes());
            engine.submit(file, Sha1Sink::new()).await.unwrap();
        }

        let mut seen = 0;
        for _ in 0..10 {
            let result = engine.next_result().await.unwrap();
            assert!(result.error.is_none());
            seen += 1;
        }

        assert_eq!(seen, 10);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_fails_when_not_running() {
        let engine = FileHasher::default();
        assert!(matches!(
            engine.submit("whatever", Sha1Sink::new()).await,
            Err(Error::NotRunning)
        ));

        let mut engine = FileHasher::default();
        engine.start();
        engine.stop();

        assert!(!engine.is_running());
        assert!(matches!(
            engine.submit("whatever", Sha1Sink::new()).await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "foobar.txt", b"foobar");

        let mut engine = FileHasher::default();
        engine.start();
        engine.start();

        engine.submit(file, Sha1Sink::new()).await.unwrap();
        let result = engine.next_result().await.unwrap();
        assert_eq!(hex::encode(result.digest().unwrap()), SHA1_FOOBAR);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_results_closed_after_stop() {
        let mut engine = FileHasher::default();
        engine.start();
        engine.stop();

        assert!(matches!(engine.next_result().await, Err(Error::Closed)));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_sink_yields_no_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "raw.txt", b"raw bytes");

        let mut engine = FileHasher::default();
        engine.start();

        engine.submit(file, Vec::<u8>::new()).await.unwrap();

        let result = engine.next_result().await.unwrap();
        assert!(result.error.is_none());
        assert!(result.sink.is_some());
        assert!(matches!(result.digest(), Err(Error::SinkTypeMismatch)));

        engine.shutdown().await;
    }
}
