use anyhow::Result;
use batchport_core::BackendError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::BatchJob;

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<BatchJob>,
}

impl SchedulerHandle {
    pub async fn submit(&self, job: BatchJob) -> Result<()> {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job).await {
            job.reject(&BackendError::Cancelled("scheduler stopped".to_string()));
            anyhow::bail!("scheduler stopped");
        }
        Ok(())
    }
}

/// Hands batches to instance workers round-robin. A worker whose inbox has
/// closed is skipped; a batch nobody can take is rejected.
pub struct Scheduler {
    rx: mpsc::Receiver<BatchJob>,
    worker_txs: Vec<mpsc::Sender<BatchJob>>,
    rr: usize,
}

impl Scheduler {
    pub fn new(rx: mpsc::Receiver<BatchJob>, worker_txs: Vec<mpsc::Sender<BatchJob>>) -> Self {
        Self {
            rx,
            worker_txs,
            rr: 0,
        }
    }

    pub fn handle(tx: mpsc::Sender<BatchJob>) -> SchedulerHandle {
        SchedulerHandle { tx }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(job) = self.rx.recv().await {
            self.dispatch(job).await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, mut job: BatchJob) {
        for _ in 0..self.worker_txs.len() {
            let idx = self.rr % self.worker_txs.len();
            self.rr += 1;
            match self.worker_txs[idx].send(job).await {
                Ok(()) => {
                    debug!(worker = idx, "batch scheduled");
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    warn!(worker = idx, "worker inbox closed");
                    job = returned;
                }
            }
        }
        let err = BackendError::Cancelled(format!(
            "no instance of model '{}' is running",
            job.model
        ));
        job.reject(&err);
    }
}
