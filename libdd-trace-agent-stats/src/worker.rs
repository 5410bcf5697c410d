// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background flush loop shared by the concentrator and the client stats aggregator.

use async_trait::async_trait;
use tokio::{runtime::Handle, select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Trait representing a periodic worker.
///
/// The worker loop waits on [`Worker::trigger`] and calls [`Worker::run`] after each trigger.
/// When the worker is stopped [`Worker::shutdown`] is called once before the loop exits.
#[async_trait]
pub trait Worker: Send {
    /// Main worker function
    async fn run(&mut self);

    /// Function to call between each `run` to wait for the next run
    async fn trigger(&mut self);

    /// Hook called when the worker is stopped. Used to flush all data.
    async fn shutdown(&mut self) {}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Worker is in an invalid state and must be recreated.")]
    InvalidState,
    #[error("Worker task has been aborted and state has been lost.")]
    TaskAborted,
}

/// Lifecycle of a worker running in a tokio task.
///
/// A worker starts `Idle`, runs its loop while `Running` and ends `Stopped` once the stop signal
/// has been received and the shutdown hook has completed. The stop signal is cooperative: a run
/// in progress is never interrupted, only the wait for the next trigger is.
#[derive(Debug)]
pub enum FlushWorker<T: Worker + 'static> {
    Idle {
        worker: T,
    },
    Running {
        handle: JoinHandle<T>,
        stop_token: CancellationToken,
    },
    Stopped {
        worker: T,
    },
    InvalidState,
}

impl<T: Worker + 'static> FlushWorker<T> {
    pub fn new(worker: T) -> Self {
        Self::Idle { worker }
    }

    /// Spawn the worker loop on the given runtime.
    ///
    /// # Errors
    /// Fails if the worker is not idle.
    pub fn start(&mut self, rt: &Handle) -> Result<(), WorkerError> {
        let mut worker = match std::mem::replace(self, Self::InvalidState) {
            Self::Idle { worker } => worker,
            running @ Self::Running { .. } => {
                *self = running;
                return Ok(());
            }
            other => {
                *self = other;
                return Err(WorkerError::InvalidState);
            }
        };
        let stop_token = CancellationToken::new();
        let cloned_token = stop_token.clone();
        let handle = rt.spawn(async move {
            loop {
                let triggered = select! {
                    biased;
                    _ = cloned_token.cancelled() => false,
                    _ = worker.trigger() => true,
                };
                if !triggered {
                    break;
                }
                worker.run().await;
            }
            debug!("Worker stopped, running shutdown hook");
            worker.shutdown().await;
            worker
        });
        *self = Self::Running { handle, stop_token };
        Ok(())
    }

    /// Signal the worker to stop and wait for its shutdown hook to complete.
    ///
    /// # Errors
    /// Fails if the worker task panicked or has been aborted, or if the worker was never started.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        match std::mem::replace(self, Self::InvalidState) {
            Self::Running { handle, stop_token } => {
                stop_token.cancel();
                match handle.await {
                    Ok(worker) => {
                        *self = Self::Stopped { worker };
                        Ok(())
                    }
                    Err(_) => Err(WorkerError::TaskAborted),
                }
            }
            stopped @ Self::Stopped { .. } => {
                *self = stopped;
                Ok(())
            }
            other => {
                *self = other;
                Err(WorkerError::InvalidState)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}
