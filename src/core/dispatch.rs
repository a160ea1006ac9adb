//! The serializing dispatch gate
//! Every state mutation in the bridge runs as a job on one queue drained by a
//! single worker task, so transport callbacks arriving on arbitrary platform
//! threads become ordered, one-at-a-time events. Delayed jobs enter the queue
//! when their deadline passes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle onto the gate; clones share one queue and one worker
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Spawns the gate worker. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Dispatch gate shut down");
                        break;
                    }
                    job = rx.recv() => match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            }
        });

        Self { tx, cancel }
    }

    /// Queues a job; jobs run to completion in submission order
    pub fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(job)).is_err() {
            warn!("Dispatch gate is gone, dropping job");
        }
    }

    /// Queues a job once `delay` has elapsed
    pub fn dispatch_after<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if delay.is_zero() {
            self.dispatch(job);
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Box::pin(job)).is_err() {
                debug!("Dispatch gate is gone, dropping delayed job");
            }
        });
    }

    /// Stops the worker; queued and future jobs are dropped unexecuted
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
