//! A simple crate providing a concurrent file-hashing engine.
//!
//! Content digests are computed for files submitted at runtime, using a pool of concurrent
//! workers so that disk I/O and digest computation overlap across files and within a single file.
//! The engine is controllable while running: work is submitted asynchronously, in-flight
//! processing can be paused and resumed without losing partial digest state, and stopping the
//! engine releases all internal concurrent activity.
//!
//! Internally, everything is plain message passing over bounded `mpsc` channels, with no shared
//! mutable memory between tasks:
//! - a **dispatcher** task owns the FIFO submission queue and hands each request to the first
//!   worker with a free inbox, backing off shortly when all of them are busy;
//! - each **worker** runs a two-stage pipeline of a *reading* task and a *hashing* task connected
//!   by a bounded chunk channel, with two read buffers used alternately so one chunk can be
//!   hashed while the next one is read;
//! - the [`FileHasher`] facade fans control signals out to the dispatcher and to every worker
//!   independently, so a slow recipient never delays delivery to the others.
//!
//! Destinations for file bytes are [`Sink`](sink::Sink) capabilities; sinks that accumulate a
//! digest additionally expose [`Finalizer`](sink::Finalizer), resolved once per request when the
//! file has been fully read.
//!
//! As **documented contracts**:
//! - every submitted file eventually yields exactly one [`HashResult`], unless the engine is
//!   stopped first, in which case in-flight and queued work is discarded without salvage;
//! - submissions are admitted first-in first-out, but completion order across files is not
//!   guaranteed since workers run concurrently;
//! - per-file I/O failures are reported in that file's result and never affect other files.

mod engine;
pub use engine::*;

pub mod sink;

mod dispatch;
mod worker;
