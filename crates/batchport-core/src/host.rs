//! Boundary between the execution path and the host serving runtime.
//!
//! The host owns requests, responses and memory. The execution path only
//! borrows them for the duration of one `execute` call.

use crate::{BufferView, BufferViewMut, DType, IOName, MemoryPlacement, OwnedBuffer, Result, Shape};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputProperties {
    pub dtype: DType,
    pub shape: Shape,
    pub byte_size: usize,
    /// Number of segments the host split this input into.
    pub buffer_count: usize,
}

/// A request as delivered by the host. Read-only to the backend.
pub trait HostRequest: Send + Sync {
    fn id(&self) -> &str;

    fn input_names(&self) -> Vec<&str>;

    fn input(&self, name: &str) -> Option<InputProperties>;

    /// Segment `index` of `buffer_count` for the named input.
    fn input_buffer(&self, name: &str, index: usize) -> Option<BufferView<'_>>;

    /// Opens the single response for this request.
    fn new_response(&self) -> Result<Box<dyn HostResponse>>;
}

/// A response under construction. Consumed by `send`, so it can only be
/// sent once.
pub trait HostResponse: Send {
    /// Binds `buffer` to this response as output `name` and returns the
    /// region to write the result into.
    fn add_output(
        &mut self,
        name: &IOName,
        dtype: DType,
        shape: Shape,
        buffer: OwnedBuffer,
    ) -> Result<BufferViewMut<'_>>;

    /// Terminal send. An error outcome discards any attached outputs.
    fn send(self: Box<Self>, outcome: Result<()>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStatus {
    Complete,
    /// Issued on a device stream; call `MemoryManager::synchronize` before
    /// reading the destination.
    Pending,
}

/// Process-wide memory services. Must be safe for concurrent use by every
/// instance of every model.
pub trait MemoryManager: Send + Sync {
    fn allocate(&self, placement: MemoryPlacement, byte_size: usize) -> Result<OwnedBuffer>;

    /// Copies `src` into `dst`. Both views must have the same length.
    fn copy(&self, src: &BufferView<'_>, dst: &mut BufferViewMut<'_>) -> Result<CopyStatus>;

    /// Blocks until every pending copy has landed.
    fn synchronize(&self) -> Result<()>;
}
