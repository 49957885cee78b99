//! This module provides the dispatcher matching queued requests to idle workers.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::engine::{Request, Signal};

/// Backoff between handoff attempts while every worker inbox is full.
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// The dispatcher task state.
///
/// The submission queue and the worker list are owned by this task exclusively; no other task
/// mutates them, so no locking is involved. Assignment is a polling admission scheme: the queue
/// head is offered to workers in a fixed order and the loop backs off shortly when all are busy.
pub(crate) struct Dispatcher {
    submissions: mpsc::Receiver<Request>,
    control: mpsc::Receiver<Signal>,
    /// Worker inboxes, tried in order. Capacity-1 channels, so a failed `try_send` means busy.
    workers: Vec<mpsc::Sender<Request>>,
    /// Admitted requests not yet handed to a worker, in arrival order.
    queue: VecDeque<Request>,
    /// The submission sender is still alive; cleared once the engine stops.
    intake_open: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        submissions: mpsc::Receiver<Request>,
        control: mpsc::Receiver<Signal>,
        workers: Vec<mpsc::Sender<Request>>,
    ) -> Self {
        Self {
            submissions,
            control,
            workers,
            queue: VecDeque::new(),
            intake_open: true,
        }
    }

    /// The dispatcher control loop.
    ///
    /// Each iteration services at most one concern, in priority order: a pending control signal,
    /// then intake of one submission, then a handoff attempt for the queue head.
    pub(crate) async fn run(mut self) {
        tracing::debug!("Dispatcher started.");

        loop {
            match self.control.try_recv() {
                Ok(Signal::Pause) => {
                    if !self.paused().await {
                        return;
                    }
                    continue;
                }
                Ok(Signal::Resume) => { /* not paused, nothing to resume */ }
                Ok(Signal::Abort) | Err(TryRecvError::Disconnected) => {
                    tracing::debug!("Dispatcher aborted, {} request(s) discarded.", self.queue.len());
                    return;
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.submissions.try_recv() {
                Ok(request) => {
                    self.queue.push_back(request);
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.intake_open = false,
            }

            if !self.queue.is_empty() {
                if !self.assign() {
                    // all workers busy, the queue drains eventually
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            } else if self.intake_open {
                // nothing to assign, park instead of spinning
                tokio::select! {
                    biased;
                    signal = self.control.recv() => match signal {
                        Some(Signal::Pause) => {
                            if !self.paused().await {
                                return;
                            }
                        }
                        Some(Signal::Resume) => {}
                        Some(Signal::Abort) | None => {
                            tracing::debug!("Dispatcher aborted.");
                            return;
                        }
                    },
                    request = self.submissions.recv() => match request {
                        Some(request) => self.queue.push_back(request),
                        None => self.intake_open = false,
                    },
                }
            } else {
                tracing::debug!("Dispatcher quit, no more submissions.");
                return;
            }
        }
    }

    /// Pause state: submissions are still admitted to the queue, nothing is assigned.
    ///
    /// Returns `false` when the dispatcher must terminate.
    async fn paused(&mut self) -> bool {
        tracing::debug!("Dispatcher paused.");

        loop {
            tokio::select! {
                biased;
                signal = self.control.recv() => match signal {
                    Some(Signal::Resume) => {
                        tracing::debug!("Dispatcher resumed.");
                        return true;
                    }
                    Some(Signal::Pause) => { /* already paused */ }
                    Some(Signal::Abort) | None => {
                        tracing::debug!("Dispatcher aborted, {} request(s) discarded.", self.queue.len());
                        return false;
                    }
                },
                request = self.submissions.recv(), if self.intake_open => match request {
                    Some(request) => self.queue.push_back(request),
                    None => self.intake_open = false,
                },
            }
        }
    }

    /// Offer the queue head to the first worker with a free inbox.
    ///
    /// Returns `false` when every worker refused it, leaving the head in place.
    fn assign(&mut self) -> bool {
        let Some(mut request) = self.queue.pop_front() else {
            return true;
        };

        for (i, worker) in self.workers.iter().enumerate() {
            match worker.try_send(request) {
                Ok(()) => {
                    tracing::trace!("Dispatcher handed request to worker slot {i}.");
                    return true;
                }
                Err(TrySendError::Full(refused) | TrySendError::Closed(refused)) => request = refused,
            }
        }

        self.queue.push_front(request);
        false
    }
}
