use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use batchport_core::{
    BackendError, Device, HostRequest, InstanceDescriptor, MemoryManager, MemoryPlacement, ModelConfig,
    ModelSpec, Result,
};
use tracing::info;

use crate::{BatchReport, CancelToken, Compute};

/// Per-model state, created on load and read-only afterwards. Shared by
/// every instance of the model.
pub struct ModelState {
    spec: ModelSpec,
    memory: Arc<dyn MemoryManager>,
    compute: Arc<dyn Compute>,
    live_instances: AtomicUsize,
}

impl ModelState {
    pub fn create(
        config: &ModelConfig,
        memory: Arc<dyn MemoryManager>,
        compute: Arc<dyn Compute>,
    ) -> Result<Arc<Self>> {
        let spec = config.to_spec()?;
        compute.validate(&spec)?;
        info!(
            model = %spec.name,
            compute = compute.name(),
            inputs = spec.inputs.len(),
            outputs = spec.outputs.len(),
            max_batch = spec.max_batch,
            "model state created"
        );
        Ok(Arc::new(Self {
            spec,
            memory,
            compute,
            live_instances: AtomicUsize::new(0),
        }))
    }

    /// Tears the model down. Hands the state back while any instance still
    /// holds it.
    pub fn destroy(this: Arc<Self>) -> std::result::Result<(), Arc<Self>> {
        let state = Arc::try_unwrap(this)?;
        info!(model = %state.spec.name, "model state destroyed");
        Ok(())
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn memory(&self) -> &dyn MemoryManager {
        self.memory.as_ref()
    }

    pub fn compute(&self) -> &dyn Compute {
        self.compute.as_ref()
    }

    pub fn live_instances(&self) -> usize {
        self.live_instances.load(Ordering::Acquire)
    }
}

/// Per-instance state. Owned by one execution path; `execute` takes it by
/// `&mut`, so two batches can never run on it at once.
pub struct InstanceState {
    name: String,
    device: Device,
    model: Arc<ModelState>,
}

impl InstanceState {
    pub fn create(model: &Arc<ModelState>, descriptor: InstanceDescriptor) -> Result<Self> {
        if descriptor.name.is_empty() {
            return Err(BackendError::Config(format!(
                "instance of model '{}' has no name",
                model.name()
            )));
        }
        model.live_instances.fetch_add(1, Ordering::AcqRel);
        info!(
            model = %model.name(),
            instance = %descriptor.name,
            device = %descriptor.device,
            "instance state created"
        );
        Ok(Self {
            name: descriptor.name,
            device: descriptor.device,
            model: Arc::clone(model),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &Arc<ModelState> {
        &self.model
    }

    /// Where this instance wants its outputs to live.
    pub fn preferred_placement(&self) -> MemoryPlacement {
        self.device.preferred_placement()
    }

    /// Runs one batch with no external cancellation.
    pub fn execute(&mut self, requests: &[&dyn HostRequest]) -> Result<BatchReport> {
        crate::execute(self, requests, &CancelToken::new())
    }
}

impl Drop for InstanceState {
    fn drop(&mut self) {
        self.model.live_instances.fetch_sub(1, Ordering::AcqRel);
        info!(model = %self.model.name(), instance = %self.name, "instance state destroyed");
    }
}
