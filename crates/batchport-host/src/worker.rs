use anyhow::Result;
use batchport_core::HostRequest;
use batchport_runtime::{execute, CancelToken, InstanceState};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::BatchJob;

/// Drives one instance: runs its batches one at a time, to completion.
pub struct Worker {
    pub id: u32,
    pub inbox: mpsc::Receiver<BatchJob>,
    pub instance: InstanceState,
    pub cancel: CancelToken,
}

impl Worker {
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = self.id, instance = self.instance.name(), "worker started");
        while let Some(job) = self.inbox.recv().await {
            let waited = job.created_at.elapsed();
            let requests: Vec<&dyn HostRequest> = job
                .requests
                .iter()
                .map(|r| r as &dyn HostRequest)
                .collect();
            match execute(&mut self.instance, &requests, &self.cancel) {
                Ok(report) => debug!(
                    worker_id = self.id,
                    completed = report.completed(),
                    errored = report.errored(),
                    waited_us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX),
                    "batch done"
                ),
                Err(err) => {
                    error!(worker_id = self.id, error = %err, "batch failed");
                    drop(requests);
                    job.reject(&err);
                }
            }
        }
        info!(worker_id = self.id, "worker stopped");
        Ok(())
    }
}
