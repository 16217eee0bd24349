use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use batchport_core::{InstanceDescriptor, MemoryManager, ModelConfig};
use batchport_runtime::{CancelToken, Compute, InstanceState, ModelState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    BatchPolicy, Batcher, InferenceRequest, InferenceResponse, InputTensor, Scheduler, Worker,
};

struct LoadedModel {
    state: Arc<ModelState>,
    intake: mpsc::Sender<InferenceRequest>,
    tasks: Vec<JoinHandle<()>>,
}

/// The in-process host: loaded models, each with a batcher, a scheduler and
/// one worker per instance.
pub struct ModelRegistry {
    memory: Arc<dyn MemoryManager>,
    models: HashMap<String, LoadedModel>,
    cancel: CancelToken,
}

impl ModelRegistry {
    pub fn new(memory: Arc<dyn MemoryManager>) -> Self {
        Self {
            memory,
            models: HashMap::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn is_ready(&self, model: &str) -> bool {
        self.is_live() && self.models.contains_key(model)
    }

    pub fn model(&self, name: &str) -> Option<&Arc<ModelState>> {
        self.models.get(name).map(|m| &m.state)
    }

    /// Loads a model and starts its pipeline. Must be called inside a tokio
    /// runtime.
    pub fn load(
        &mut self,
        config: &ModelConfig,
        compute: Arc<dyn Compute>,
        instances: Vec<InstanceDescriptor>,
        policy: BatchPolicy,
    ) -> Result<()> {
        if self.models.contains_key(&config.name) {
            bail!("model '{}' is already loaded", config.name);
        }
        if instances.is_empty() {
            bail!("model '{}' needs at least one instance", config.name);
        }

        let state = ModelState::create(config, Arc::clone(&self.memory), compute)
            .with_context(|| format!("failed to load model '{}'", config.name))?;
        let policy = BatchPolicy {
            max_batch: policy.max_batch.min(state.spec().max_batch.max(1)),
            ..policy
        };

        let mut workers = Vec::with_capacity(instances.len());
        let mut worker_txs = Vec::with_capacity(instances.len());
        for (id, descriptor) in (0u32..).zip(instances) {
            let instance = InstanceState::create(&state, descriptor)?;
            let (tx, inbox) = mpsc::channel(128);
            worker_txs.push(tx);
            workers.push(Worker {
                id,
                inbox,
                instance,
                cancel: self.cancel.clone(),
            });
        }

        let (intake, batcher_rx) = mpsc::channel(1024);
        let (sched_tx, sched_rx) = mpsc::channel(1024);
        let scheduler = Scheduler::new(sched_rx, worker_txs);
        let batcher = Batcher::new(
            config.name.clone(),
            policy,
            batcher_rx,
            Scheduler::handle(sched_tx),
        );

        let mut tasks = Vec::with_capacity(workers.len() + 2);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = batcher.run().await {
                error!(error = ?e, "batcher exited");
            }
        }));
        tasks.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!(error = ?e, "scheduler exited");
            }
        }));
        for worker in workers {
            tasks.push(tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    error!(error = ?e, "worker exited");
                }
            }));
        }

        info!(model = %config.name, instances = tasks.len() - 2, "model loaded");
        self.models.insert(
            config.name.clone(),
            LoadedModel {
                state,
                intake,
                tasks,
            },
        );
        Ok(())
    }

    pub async fn submit(&self, request: InferenceRequest) -> Result<()> {
        if !self.is_live() {
            bail!("server is shutting down");
        }
        let model = self
            .models
            .get(&request.model)
            .ok_or_else(|| anyhow!("model '{}' is not loaded", request.model))?;
        model
            .intake
            .send(request)
            .await
            .map_err(|e| anyhow!("model intake closed: {e}"))
    }

    pub async fn infer(
        &self,
        model: &str,
        id: impl Into<String>,
        inputs: Vec<InputTensor>,
    ) -> Result<InferenceResponse> {
        let (request, rx) = InferenceRequest::new(id, model, inputs);
        self.submit(request).await?;
        rx.await.map_err(|_| anyhow!("response dropped without being sent"))
    }

    /// Stops intake for `name`, drains its pipeline and destroys its state.
    pub async fn unload(&mut self, name: &str) -> Result<()> {
        let LoadedModel {
            state,
            intake,
            tasks,
        } = self
            .models
            .remove(name)
            .ok_or_else(|| anyhow!("model '{name}' is not loaded"))?;
        drop(intake);
        let mut failure = None;
        for task in tasks {
            if let Err(e) = task.await {
                error!(model = %name, error = %e, "pipeline task panicked");
                failure.get_or_insert(e);
            }
        }
        ModelState::destroy(state).map_err(|state| {
            anyhow!(
                "model '{name}' still has {} live instances",
                state.live_instances()
            )
        })?;
        info!(model = %name, "model unloaded");
        match failure {
            Some(e) => Err(e).context(format!("model '{name}' pipeline task panicked")),
            None => Ok(()),
        }
    }

    /// Cancels in-flight batches and unloads every model. Every accepted
    /// request still receives a response.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let names: Vec<String> = self.models.keys().cloned().collect();
        for name in names {
            self.unload(&name).await?;
        }
        Ok(())
    }
}
