use batchport_core::{
    BackendError, BufferViewMut, CopyStatus, DType, HostResponse, IOName, MemoryManager,
    MemoryPlacement, OwnedBuffer, Result, Shape,
};
use tracing::debug;

use crate::ComputedOutput;

/// Allocates output tensors on responses and fills them.
///
/// Allocation is deferred until the size is known and walks the placement's
/// fallback chain, so an exhausted device pool degrades to pinned and then
/// host memory. The buffer is owned by the response it is attached to.
pub struct OutputResponder<'m> {
    memory: &'m dyn MemoryManager,
    preferred: MemoryPlacement,
    require_non_empty: bool,
    pending_copies: bool,
}

impl<'m> OutputResponder<'m> {
    pub fn new(
        memory: &'m dyn MemoryManager,
        preferred: MemoryPlacement,
        require_non_empty: bool,
    ) -> Self {
        Self {
            memory,
            preferred,
            require_non_empty,
            pending_copies: false,
        }
    }

    /// Declares output `name` on `response` and returns its writable buffer
    /// of exactly `product(dims) * dtype.size()` bytes.
    pub fn allocate<'s>(
        &mut self,
        response: &'s mut dyn HostResponse,
        name: &IOName,
        dtype: DType,
        dims: &[i64],
    ) -> Result<BufferViewMut<'s>> {
        let shape = Shape::from_dims(dims)?;
        let byte_size = checked_byte_size(name, &shape, dtype)?;
        if self.require_non_empty && byte_size == 0 {
            return Err(BackendError::InvalidShape(format!(
                "output '{name}' has empty shape {shape}"
            )));
        }
        let buffer = self.allocate_with_fallback(byte_size)?;
        response.add_output(name, dtype, shape, buffer)
    }

    fn allocate_with_fallback(&self, byte_size: usize) -> Result<OwnedBuffer> {
        let chain = self.preferred.fallback_chain();
        for placement in &chain {
            match self.memory.allocate(*placement, byte_size) {
                Ok(buffer) => return Ok(buffer),
                Err(err) => {
                    debug!(%placement, bytes = byte_size, error = %err, "output allocation failed, falling back");
                }
            }
        }
        Err(BackendError::OutOfMemory {
            bytes: byte_size,
            tried: chain
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Allocates `output` on `response` and copies its data in.
    pub fn write(&mut self, response: &mut dyn HostResponse, output: ComputedOutput<'_>) -> Result<()> {
        let dims = output
            .shape
            .dims()
            .iter()
            .map(|&d| {
                i64::try_from(d)
                    .map_err(|_| BackendError::InvalidShape(format!("dimension {d} overflows")))
            })
            .collect::<Result<Vec<_>>>()?;

        let source_bytes = output.byte_size();
        let expected = checked_byte_size(&output.name, &output.shape, output.dtype)?;
        if source_bytes != expected {
            return Err(BackendError::InvalidShape(format!(
                "output '{}' of shape {} needs {expected} bytes, computed {source_bytes}",
                output.name, output.shape
            )));
        }

        let mut dst = self.allocate(response, &output.name, output.dtype, &dims)?;
        let mut offset = 0;
        for segment in &output.data {
            let src = segment.view();
            let mut window = dst.sub_view(offset, src.len()).ok_or_else(|| {
                BackendError::Internal(format!("output '{}' overruns its buffer", output.name))
            })?;
            if self.memory.copy(&src, &mut window)? == CopyStatus::Pending {
                self.pending_copies = true;
            }
            offset += src.len();
        }
        Ok(())
    }

    /// Waits for any asynchronous output copies. Must run before responses
    /// are sent.
    pub fn finalize(&mut self) -> Result<bool> {
        if !std::mem::take(&mut self.pending_copies) {
            return Ok(false);
        }
        self.memory.synchronize()?;
        Ok(true)
    }
}

fn checked_byte_size(name: &IOName, shape: &Shape, dtype: DType) -> Result<usize> {
    shape.byte_size(dtype).ok_or_else(|| {
        BackendError::InvalidShape(format!(
            "output '{name}' of shape {shape} does not fit in memory as {dtype}"
        ))
    })
}
