use batchport_core::{
    BackendError, BufferView, CopyStatus, DType, HostRequest, IOName, MemoryManager,
    MemoryPlacement, OwnedBuffer, Result, Shape,
};
use smallvec::SmallVec;
use tracing::trace;

/// Either a view straight into the request's memory or a copy made to
/// satisfy a placement or contiguity requirement.
#[derive(Debug)]
pub enum CollectedBuffer<'r> {
    Borrowed(BufferView<'r>),
    Owned(OwnedBuffer),
}

impl CollectedBuffer<'_> {
    pub fn view(&self) -> BufferView<'_> {
        match self {
            CollectedBuffer::Borrowed(view) => *view,
            CollectedBuffer::Owned(buffer) => buffer.view(),
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, CollectedBuffer::Owned(_))
    }
}

/// One request's contribution to a named input.
#[derive(Debug)]
pub struct CollectedInput<'r> {
    pub name: IOName,
    pub dtype: DType,
    pub shape: Shape,
    pub byte_size: usize,
    pub segments: SmallVec<[CollectedBuffer<'r>; 1]>,
}

impl CollectedInput<'_> {
    /// The whole input as one region, if it is a single segment.
    pub fn contiguous(&self) -> Option<BufferView<'_>> {
        match self.segments.as_slice() {
            [only] => Some(only.view()),
            _ => None,
        }
    }

    /// Host-readable bytes of a single-segment input.
    pub fn host_bytes(&self) -> Option<&[u8]> {
        self.contiguous().and_then(|view| view.host_bytes())
    }
}

/// Gathers input buffers across the requests of a batch.
///
/// With no target placement and no contiguity requirement every segment is
/// handed out as-is. A copy is only made when a segment is in the wrong
/// memory or a multi-segment input must be contiguous.
pub struct InputCollector<'m> {
    memory: &'m dyn MemoryManager,
    target: Option<MemoryPlacement>,
    force_contiguous: bool,
    pending_copies: bool,
}

impl<'m> InputCollector<'m> {
    pub fn new(
        memory: &'m dyn MemoryManager,
        target: Option<MemoryPlacement>,
        force_contiguous: bool,
    ) -> Self {
        Self {
            memory,
            target,
            force_contiguous,
            pending_copies: false,
        }
    }

    pub fn collect<'r>(
        &mut self,
        request: &'r dyn HostRequest,
        name: &IOName,
    ) -> Result<CollectedInput<'r>> {
        let props = request
            .input(name.as_str())
            .ok_or_else(|| BackendError::InputNotFound {
                request: request.id().to_string(),
                input: name.to_string(),
            })?;

        let mut segments: SmallVec<[BufferView<'r>; 1]> = SmallVec::new();
        for index in 0..props.buffer_count {
            let view = request.input_buffer(name.as_str(), index).ok_or_else(|| {
                BackendError::Internal(format!(
                    "request '{}' input '{name}' is missing segment {index} of {}",
                    request.id(),
                    props.buffer_count
                ))
            })?;
            segments.push(view);
        }

        let total: usize = segments.iter().map(|s| s.len()).sum();
        if total != props.byte_size {
            return Err(BackendError::InvalidShape(format!(
                "request '{}' input '{name}' declares {} bytes but its segments hold {total}",
                request.id(),
                props.byte_size
            )));
        }

        let misplaced = self
            .target
            .is_some_and(|target| segments.iter().any(|s| !s.placement().satisfies(target)));
        let fragmented = self.force_contiguous && segments.len() > 1;

        let collected = if misplaced || fragmented {
            let destination = self
                .target
                .or_else(|| segments.first().map(|s| s.placement()))
                .unwrap_or(MemoryPlacement::HOST);
            let buffer = self.gather(&segments, destination, total)?;
            trace!(
                request = request.id(),
                input = %name,
                bytes = total,
                to = %destination,
                "gathered input into a copy"
            );
            smallvec::smallvec![CollectedBuffer::Owned(buffer)]
        } else {
            segments.into_iter().map(CollectedBuffer::Borrowed).collect()
        };

        Ok(CollectedInput {
            name: name.clone(),
            dtype: props.dtype,
            shape: props.shape,
            byte_size: total,
            segments: collected,
        })
    }

    fn gather(
        &mut self,
        segments: &[BufferView<'_>],
        destination: MemoryPlacement,
        total: usize,
    ) -> Result<OwnedBuffer> {
        let mut buffer = self.memory.allocate(destination, total)?;
        let mut dst = buffer.view_mut();
        let mut offset = 0;
        for segment in segments {
            let mut window = dst.sub_view(offset, segment.len()).ok_or_else(|| {
                BackendError::Internal(format!(
                    "segment of {} bytes overruns a {total}-byte gather buffer",
                    segment.len()
                ))
            })?;
            if self.memory.copy(segment, &mut window)? == CopyStatus::Pending {
                self.pending_copies = true;
            }
            offset += segment.len();
        }
        Ok(buffer)
    }

    /// Waits for any asynchronous copies. Returns whether a wait was needed.
    pub fn finalize(&mut self) -> Result<bool> {
        if !std::mem::take(&mut self.pending_copies) {
            return Ok(false);
        }
        self.memory.synchronize()?;
        Ok(true)
    }
}
