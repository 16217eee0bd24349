use std::sync::Mutex;
use std::time::Instant;

use batchport_core::{
    BackendError, BufferView, BufferViewMut, DType, HostRequest, HostResponse, IOName,
    InputProperties, MemoryPlacement, OwnedBuffer, Result, Shape,
};
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

/// One stretch of an input tensor's bytes.
#[derive(Clone, Debug)]
pub struct Segment {
    pub placement: MemoryPlacement,
    pub bytes: Bytes,
}

#[derive(Clone, Debug)]
pub struct InputTensor {
    pub name: IOName,
    pub dtype: DType,
    pub shape: Shape,
    pub segments: Vec<Segment>,
}

impl InputTensor {
    pub fn from_host_bytes(name: impl Into<String>, dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            name: IOName(name.into()),
            dtype,
            shape,
            segments: vec![Segment {
                placement: MemoryPlacement::HOST,
                bytes,
            }],
        }
    }

    /// Little-endian tensor from a slice of `i32`.
    pub fn from_i32(name: impl Into<String>, shape: Shape, values: &[i32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        Self::from_host_bytes(name, DType::I32, shape, Bytes::from(bytes))
    }

    pub fn from_u64(name: impl Into<String>, shape: Shape, values: &[u64]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        Self::from_host_bytes(name, DType::U64, shape, Bytes::from(bytes))
    }

    /// Re-splits the data into segments of at most `chunk` bytes.
    pub fn chunked(mut self, chunk: usize) -> Self {
        let chunk = chunk.max(1);
        self.segments = self
            .segments
            .into_iter()
            .flat_map(|segment| {
                let placement = segment.placement;
                let bytes = segment.bytes;
                (0..bytes.len())
                    .step_by(chunk)
                    .map(move |start| Segment {
                        placement,
                        bytes: bytes.slice(start..(start + chunk).min(bytes.len())),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        self
    }

    /// Marks every segment as living in `placement`.
    pub fn placed(mut self, placement: MemoryPlacement) -> Self {
        for segment in &mut self.segments {
            segment.placement = placement;
        }
        self
    }

    pub fn byte_size(&self) -> usize {
        self.segments.iter().map(|s| s.bytes.len()).sum()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub queued_us: u64,
    pub backend_us: u64,
}

#[derive(Debug)]
pub struct OutputTensor {
    pub name: IOName,
    pub dtype: DType,
    pub shape: Shape,
    pub buffer: OwnedBuffer,
}

impl OutputTensor {
    pub fn placement(&self) -> MemoryPlacement {
        self.buffer.placement()
    }

    /// Output bytes as they leave the host; device-resident outputs are
    /// read back the way the host's transport would.
    pub fn bytes(&self) -> &[u8] {
        self.buffer.view().raw_bytes()
    }

    pub fn to_i32(&self) -> Vec<i32> {
        self.bytes()
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    pub fn to_u64(&self) -> Vec<u64> {
        self.bytes()
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect()
    }
}

#[derive(Debug)]
pub struct InferenceResponse {
    pub request_id: String,
    pub outputs: Vec<OutputTensor>,
    pub error: Option<BackendError>,
    pub timings: Timings,
}

impl InferenceResponse {
    pub fn output(&self, name: &str) -> Option<&OutputTensor> {
        self.outputs.iter().find(|o| o.name.as_str() == name)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct InferenceRequest {
    pub id: String,
    pub model: String,
    pub inputs: Vec<InputTensor>,
    pub enqueued_at: Instant,
    resp_tx: Mutex<Option<oneshot::Sender<InferenceResponse>>>,
}

impl InferenceRequest {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        inputs: Vec<InputTensor>,
    ) -> (Self, oneshot::Receiver<InferenceResponse>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: id.into(),
            model: model.into(),
            inputs,
            enqueued_at: Instant::now(),
            resp_tx: Mutex::new(Some(tx)),
        };
        (request, rx)
    }

    fn tensor(&self, name: &str) -> Option<&InputTensor> {
        self.inputs.iter().find(|t| t.name.as_str() == name)
    }
}

impl HostRequest for InferenceRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|t| t.name.as_str()).collect()
    }

    fn input(&self, name: &str) -> Option<InputProperties> {
        let tensor = self.tensor(name)?;
        Some(InputProperties {
            dtype: tensor.dtype,
            shape: tensor.shape.clone(),
            byte_size: tensor.byte_size(),
            buffer_count: tensor.segments.len(),
        })
    }

    fn input_buffer(&self, name: &str, index: usize) -> Option<BufferView<'_>> {
        let segment = self.tensor(name)?.segments.get(index)?;
        Some(BufferView::new(segment.placement, &segment.bytes))
    }

    fn new_response(&self) -> Result<Box<dyn HostResponse>> {
        let tx = self
            .resp_tx
            .lock()
            .map_err(|_| BackendError::Internal("response slot poisoned".to_string()))?
            .take()
            .ok_or_else(|| {
                BackendError::Internal(format!("response for request '{}' already created", self.id))
            })?;
        Ok(Box::new(ResponseHandle {
            request_id: self.id.clone(),
            outputs: Vec::new(),
            tx,
            enqueued_at: self.enqueued_at,
            opened_at: Instant::now(),
        }))
    }
}

struct ResponseHandle {
    request_id: String,
    outputs: Vec<OutputTensor>,
    tx: oneshot::Sender<InferenceResponse>,
    enqueued_at: Instant,
    opened_at: Instant,
}

impl HostResponse for ResponseHandle {
    fn add_output(
        &mut self,
        name: &IOName,
        dtype: DType,
        shape: Shape,
        buffer: OwnedBuffer,
    ) -> Result<BufferViewMut<'_>> {
        if self.outputs.iter().any(|o| &o.name == name) {
            return Err(BackendError::Internal(format!(
                "output '{name}' declared twice on response '{}'",
                self.request_id
            )));
        }
        self.outputs.push(OutputTensor {
            name: name.clone(),
            dtype,
            shape,
            buffer,
        });
        let output = self
            .outputs
            .last_mut()
            .ok_or_else(|| BackendError::Internal("output vanished".to_string()))?;
        Ok(output.buffer.view_mut())
    }

    fn send(self: Box<Self>, outcome: Result<()>) {
        let ResponseHandle {
            request_id,
            outputs,
            tx,
            enqueued_at,
            opened_at,
        } = *self;
        let (outputs, error) = match outcome {
            Ok(()) => (outputs, None),
            Err(err) => (Vec::new(), Some(err)),
        };
        let response = InferenceResponse {
            request_id,
            outputs,
            error,
            timings: Timings {
                queued_us: micros(opened_at.duration_since(enqueued_at)),
                backend_us: micros(opened_at.elapsed()),
            },
        };
        if let Err(response) = tx.send(response) {
            debug!(request = %response.request_id, "caller went away before the response arrived");
        }
    }
}

fn micros(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
