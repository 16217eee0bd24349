#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use batchport_core::{
    BackendError, BufferView, BufferViewMut, CopyStatus, DType, HostRequest, HostResponse, IOName,
    InputProperties, MemoryKind, MemoryManager, MemoryPlacement, ModelConfig, OwnedBuffer, Result,
    Shape, TensorConfig,
};
use batchport_runtime::{Compute, IdentityCompute, ModelState};

/// Memory with per-allocation size limits. Device copies stay pending until
/// `synchronize`.
#[derive(Default)]
pub struct TestMemory {
    pub host_limit: Option<usize>,
    pub pinned_limit: Option<usize>,
    pub device_limit: Option<usize>,
    pub devices: Vec<i64>,
    pub pending: AtomicUsize,
    pub syncs: AtomicUsize,
}

impl TestMemory {
    pub fn with_devices(devices: &[i64]) -> Self {
        Self {
            devices: devices.to_vec(),
            ..Self::default()
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl MemoryManager for TestMemory {
    fn allocate(&self, placement: MemoryPlacement, byte_size: usize) -> Result<OwnedBuffer> {
        let limit = match placement.kind {
            MemoryKind::Host => self.host_limit,
            MemoryKind::Pinned => self.pinned_limit,
            MemoryKind::Device if !self.devices.contains(&placement.device_id) => Some(0),
            MemoryKind::Device => self.device_limit,
        };
        if limit.is_some_and(|limit| byte_size > limit) {
            return Err(BackendError::OutOfMemory {
                bytes: byte_size,
                tried: placement.to_string(),
            });
        }
        Ok(OwnedBuffer::zeroed(placement, byte_size))
    }

    fn copy(&self, src: &BufferView<'_>, dst: &mut BufferViewMut<'_>) -> Result<CopyStatus> {
        let (from, to) = (src.placement(), dst.placement());
        if from.kind == MemoryKind::Device
            && to.kind == MemoryKind::Device
            && from.device_id != to.device_id
        {
            return Err(BackendError::UnsupportedTransfer { from, to });
        }
        dst.raw_bytes_mut().copy_from_slice(src.raw_bytes());
        if from.kind.is_host_accessible() && to.kind.is_host_accessible() {
            Ok(CopyStatus::Complete)
        } else {
            self.pending.fetch_add(1, Ordering::SeqCst);
            Ok(CopyStatus::Pending)
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.pending.store(0, Ordering::SeqCst);
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct SentOutput {
    pub name: IOName,
    pub dtype: DType,
    pub shape: Shape,
    pub placement: MemoryPlacement,
    pub bytes: Vec<u8>,
}

impl SentOutput {
    pub fn to_i32(&self) -> Vec<i32> {
        self.bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

#[derive(Debug)]
pub struct Sent {
    pub request_id: String,
    pub outputs: Vec<SentOutput>,
    pub error: Option<BackendError>,
    pub pending_copies_at_send: usize,
}

/// Records every response sent through it.
pub struct TestHost {
    pub memory: Arc<TestMemory>,
    pub sent: Mutex<Vec<Sent>>,
}

impl TestHost {
    pub fn new(memory: TestMemory) -> Arc<Self> {
        Arc::new(Self {
            memory: Arc::new(memory),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn model(&self, config: &ModelConfig) -> Arc<ModelState> {
        self.model_with(config, Arc::new(IdentityCompute))
    }

    pub fn model_with(&self, config: &ModelConfig, compute: Arc<dyn Compute>) -> Arc<ModelState> {
        ModelState::create(config, self.memory.clone(), compute).unwrap()
    }
}

pub struct TestInput {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
    pub segments: Vec<(MemoryPlacement, Vec<u8>)>,
}

pub struct TestRequest {
    pub id: String,
    pub inputs: Vec<TestInput>,
    host: Arc<TestHost>,
    refused_opens: AtomicUsize,
}

impl TestRequest {
    pub fn new(host: &Arc<TestHost>, id: &str) -> Self {
        Self {
            id: id.to_string(),
            inputs: Vec::new(),
            host: Arc::clone(host),
            refused_opens: AtomicUsize::new(0),
        }
    }

    pub fn i32_input(self, name: &str, values: &[i32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.input(name, DType::I32, &[values.len()], vec![(MemoryPlacement::HOST, bytes)])
    }

    pub fn input(
        mut self,
        name: &str,
        dtype: DType,
        dims: &[usize],
        segments: Vec<(MemoryPlacement, Vec<u8>)>,
    ) -> Self {
        self.inputs.push(TestInput {
            name: name.to_string(),
            dtype,
            shape: Shape::from_slice(dims),
            segments,
        });
        self
    }

    /// The first `n` attempts to open a response are refused.
    pub fn refuse_opens(self, n: usize) -> Self {
        self.refused_opens.store(n, Ordering::SeqCst);
        self
    }

    fn tensor(&self, name: &str) -> Option<&TestInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

impl HostRequest for TestRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|i| i.name.as_str()).collect()
    }

    fn input(&self, name: &str) -> Option<InputProperties> {
        let input = self.tensor(name)?;
        Some(InputProperties {
            dtype: input.dtype,
            shape: input.shape.clone(),
            byte_size: input.segments.iter().map(|(_, b)| b.len()).sum(),
            buffer_count: input.segments.len(),
        })
    }

    fn input_buffer(&self, name: &str, index: usize) -> Option<BufferView<'_>> {
        let (placement, bytes) = self.tensor(name)?.segments.get(index)?;
        Some(BufferView::new(*placement, bytes))
    }

    fn new_response(&self) -> Result<Box<dyn HostResponse>> {
        let refused = self
            .refused_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(BackendError::Internal(format!("host refused a response for {}", self.id)));
        }
        Ok(Box::new(TestResponse {
            request_id: self.id.clone(),
            outputs: Vec::new(),
            host: Arc::clone(&self.host),
        }))
    }
}

struct TestResponse {
    request_id: String,
    outputs: Vec<(IOName, DType, Shape, OwnedBuffer)>,
    host: Arc<TestHost>,
}

impl HostResponse for TestResponse {
    fn add_output(
        &mut self,
        name: &IOName,
        dtype: DType,
        shape: Shape,
        buffer: OwnedBuffer,
    ) -> Result<BufferViewMut<'_>> {
        self.outputs.push((name.clone(), dtype, shape, buffer));
        Ok(self.outputs.last_mut().unwrap().3.view_mut())
    }

    fn send(self: Box<Self>, outcome: Result<()>) {
        let outputs = match &outcome {
            Ok(()) => self
                .outputs
                .iter()
                .map(|(name, dtype, shape, buffer)| SentOutput {
                    name: name.clone(),
                    dtype: *dtype,
                    shape: shape.clone(),
                    placement: buffer.placement(),
                    bytes: buffer.view().raw_bytes().to_vec(),
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        self.host.sent.lock().unwrap().push(Sent {
            request_id: self.request_id.clone(),
            outputs,
            error: outcome.err(),
            pending_copies_at_send: self.host.memory.pending(),
        });
    }
}

pub fn tensor(name: &str, dtype: DType, dims: &[i64]) -> TensorConfig {
    TensorConfig {
        name: name.to_string(),
        data_type: dtype,
        dims: dims.to_vec(),
    }
}

/// One INT32 `[4]` input `IN0` echoed as `OUT0`, batching disabled.
pub fn int32_config() -> ModelConfig {
    ModelConfig {
        name: "minimal".to_string(),
        max_batch_size: 0,
        inputs: vec![tensor("IN0", DType::I32, &[4])],
        outputs: vec![tensor("OUT0", DType::I32, &[4])],
        require_non_empty_output: false,
    }
}

pub fn refs(requests: &[TestRequest]) -> Vec<&dyn HostRequest> {
    requests.iter().map(|r| r as &dyn HostRequest).collect()
}
