use anyhow::Result;
use batchport_core::{BackendError, HostRequest};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::{InferenceRequest, SchedulerHandle};

#[derive(Clone, Debug)]
pub struct BatchPolicy {
    pub max_batch: usize,
    pub max_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch: 8,
            max_delay: Duration::from_millis(5),
        }
    }
}

/// A batch ready to run on an instance.
#[derive(Debug)]
pub struct BatchJob {
    pub model: String,
    pub requests: Vec<InferenceRequest>,
    pub created_at: std::time::Instant,
}

impl BatchJob {
    /// Answers every request in the job with `err` without executing it.
    pub fn reject(self, err: &BackendError) {
        for request in &self.requests {
            match request.new_response() {
                Ok(response) => response.send(Err(err.clone())),
                Err(open) => debug!(request = %request.id, error = %open, "request already answered"),
            }
        }
    }
}

/// Groups incoming requests for one model into batches of at most
/// `max_batch`, waiting no longer than `max_delay` after the first one.
pub struct Batcher {
    model: String,
    policy: BatchPolicy,
    rx: mpsc::Receiver<InferenceRequest>,
    scheduler: SchedulerHandle,
}

impl Batcher {
    pub fn new(
        model: impl Into<String>,
        policy: BatchPolicy,
        rx: mpsc::Receiver<InferenceRequest>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            model: model.into(),
            policy,
            rx,
            scheduler,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut pending: Vec<InferenceRequest> = Vec::new();
        let mut first_seen: Option<Instant> = None;
        let max_batch = self.policy.max_batch.max(1);
        let max_delay = self.policy.max_delay;

        loop {
            tokio::select! {
                maybe_req = self.rx.recv() => {
                    match maybe_req {
                        None => break,
                        Some(req) => {
                            if pending.is_empty() { first_seen = Some(Instant::now()); }
                            pending.push(req);
                            if pending.len() >= max_batch {
                                self.flush(&mut pending).await?;
                                first_seen = None;
                            }
                        }
                    }
                }
                _ = async {
                    if let Some(t0) = first_seen {
                        sleep(max_delay.saturating_sub(t0.elapsed())).await;
                    }
                }, if first_seen.is_some() => {
                    self.flush(&mut pending).await?;
                    first_seen = None;
                }
            }
        }

        // Intake closed: whatever is still waiting goes out as a final batch.
        self.flush(&mut pending).await
    }

    async fn flush(&self, pending: &mut Vec<InferenceRequest>) -> Result<()> {
        let requests = std::mem::take(pending);
        if requests.is_empty() {
            return Ok(());
        }

        debug!(model = %self.model, batch = requests.len(), "dispatching batch");
        let job = BatchJob {
            model: self.model.clone(),
            requests,
            created_at: std::time::Instant::now(),
        };
        self.scheduler.submit(job).await
    }
}
