use std::any::Any;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::BackendError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IOName(pub String);

impl IOName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IOName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 | DType::F16 | DType::BF16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "BOOL",
            DType::U8 => "UINT8",
            DType::U16 => "UINT16",
            DType::U32 => "UINT32",
            DType::U64 => "UINT64",
            DType::I8 => "INT8",
            DType::I16 => "INT16",
            DType::I32 => "INT32",
            DType::I64 => "INT64",
            DType::F16 => "FP16",
            DType::BF16 => "BF16",
            DType::F32 => "FP32",
            DType::F64 => "FP64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = BackendError;

    /// Accepts both the bare wire name (`INT32`) and the config form
    /// (`TYPE_INT32`).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.strip_prefix("TYPE_").unwrap_or(raw);
        Ok(match name.to_ascii_uppercase().as_str() {
            "BOOL" => DType::Bool,
            "UINT8" => DType::U8,
            "UINT16" => DType::U16,
            "UINT32" => DType::U32,
            "UINT64" => DType::U64,
            "INT8" => DType::I8,
            "INT16" => DType::I16,
            "INT32" => DType::I32,
            "INT64" => DType::I64,
            "FP16" => DType::F16,
            "BF16" => DType::BF16,
            "FP32" => DType::F32,
            "FP64" => DType::F64,
            _ => return Err(BackendError::Config(format!("unsupported data type: {raw}"))),
        })
    }
}

impl TryFrom<String> for DType {
    type Error = BackendError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<DType> for String {
    fn from(dtype: DType) -> Self {
        dtype.as_str().to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }

    /// Builds a shape from host-provided signed dims, rejecting negatives.
    pub fn from_dims(dims: &[i64]) -> Result<Self, BackendError> {
        dims.iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| {
                    BackendError::InvalidShape(format!("negative dimension {d} in {dims:?}"))
                })
            })
            .collect::<Result<SmallVec<_>, _>>()
            .map(Self)
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Element count, or `None` if it overflows. A rank-0 shape holds one
    /// element; any zero dim makes the shape empty.
    pub fn numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn byte_size(&self, dtype: DType) -> Option<usize> {
        self.numel()?.checked_mul(dtype.size())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

#[derive(Clone, Debug)]
pub enum Device {
    Cpu,
    Cuda { device_id: u32 },
}

impl Device {
    /// Memory an instance on this device prefers for its outputs.
    pub fn preferred_placement(&self) -> MemoryPlacement {
        match self {
            Device::Cpu => MemoryPlacement::HOST,
            Device::Cuda { device_id } => MemoryPlacement::device(i64::from(*device_id)),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Physical location class of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Host,
    Pinned,
    Device,
}

impl MemoryKind {
    /// Host and pinned memory can be read by host code without a transfer.
    pub fn is_host_accessible(self) -> bool {
        matches!(self, MemoryKind::Host | MemoryKind::Pinned)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryKind::Host => "host",
            MemoryKind::Pinned => "pinned",
            MemoryKind::Device => "device",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryPlacement {
    pub kind: MemoryKind,
    pub device_id: i64,
}

impl MemoryPlacement {
    pub const HOST: Self = Self {
        kind: MemoryKind::Host,
        device_id: 0,
    };
    pub const PINNED: Self = Self {
        kind: MemoryKind::Pinned,
        device_id: 0,
    };

    pub fn device(device_id: i64) -> Self {
        Self {
            kind: MemoryKind::Device,
            device_id,
        }
    }

    /// Placements to try, in order, when allocating for this placement.
    pub fn fallback_chain(self) -> SmallVec<[MemoryPlacement; 3]> {
        let mut chain = SmallVec::new();
        chain.push(self);
        match self.kind {
            MemoryKind::Device => {
                chain.push(Self::PINNED);
                chain.push(Self::HOST);
            }
            MemoryKind::Pinned => chain.push(Self::HOST),
            MemoryKind::Host => {}
        }
        chain
    }

    /// True when a buffer already at `self` can be consumed where `target`
    /// is required without moving it.
    pub fn satisfies(self, target: MemoryPlacement) -> bool {
        match (self.kind, target.kind) {
            (MemoryKind::Device, MemoryKind::Device) => self.device_id == target.device_id,
            (a, b) => a.is_host_accessible() && b.is_host_accessible(),
        }
    }
}

impl fmt::Display for MemoryPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MemoryKind::Device => write!(f, "device:{}", self.device_id),
            kind => write!(f, "{kind}"),
        }
    }
}

/// Read-only view of one contiguous memory region. Does not own the memory.
#[derive(Clone, Copy, Debug)]
pub struct BufferView<'a> {
    placement: MemoryPlacement,
    bytes: &'a [u8],
}

impl<'a> BufferView<'a> {
    pub fn new(placement: MemoryPlacement, bytes: &'a [u8]) -> Self {
        Self { placement, bytes }
    }

    pub fn placement(&self) -> MemoryPlacement {
        self.placement
    }

    pub fn kind(&self) -> MemoryKind {
        self.placement.kind
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// Contents, if host code may read this region directly.
    pub fn host_bytes(&self) -> Option<&'a [u8]> {
        self.placement
            .kind
            .is_host_accessible()
            .then_some(self.bytes)
    }

    /// Raw region regardless of kind. Only memory managers performing a
    /// transfer should touch device-resident bytes.
    pub fn raw_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl PartialEq for BufferView<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.placement.kind == other.placement.kind
            && std::ptr::eq(self.bytes.as_ptr(), other.bytes.as_ptr())
            && self.bytes.len() == other.bytes.len()
    }
}

impl Eq for BufferView<'_> {}

/// Writable view of one contiguous memory region. Does not own the memory.
#[derive(Debug)]
pub struct BufferViewMut<'a> {
    placement: MemoryPlacement,
    bytes: &'a mut [u8],
}

impl<'a> BufferViewMut<'a> {
    pub fn new(placement: MemoryPlacement, bytes: &'a mut [u8]) -> Self {
        Self { placement, bytes }
    }

    pub fn placement(&self) -> MemoryPlacement {
        self.placement
    }

    pub fn kind(&self) -> MemoryKind {
        self.placement.kind
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_view(&self) -> BufferView<'_> {
        BufferView::new(self.placement, &*self.bytes)
    }

    /// Narrower writable view of `len` bytes starting at `offset`.
    pub fn sub_view(&mut self, offset: usize, len: usize) -> Option<BufferViewMut<'_>> {
        let end = offset.checked_add(len)?;
        let bytes = self.bytes.get_mut(offset..end)?;
        Some(BufferViewMut::new(self.placement, bytes))
    }

    pub fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.placement.kind.is_host_accessible() {
            Some(&mut *self.bytes)
        } else {
            None
        }
    }

    pub fn raw_bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }
}

/// An allocation handed out by a memory manager. The lease is dropped
/// together with the data and returns the capacity to its pool.
pub struct OwnedBuffer {
    placement: MemoryPlacement,
    data: Vec<u8>,
    lease: Option<Box<dyn Any + Send + Sync>>,
}

impl OwnedBuffer {
    pub fn new(placement: MemoryPlacement, data: Vec<u8>) -> Self {
        Self {
            placement,
            data,
            lease: None,
        }
    }

    pub fn zeroed(placement: MemoryPlacement, byte_size: usize) -> Self {
        Self::new(placement, vec![0; byte_size])
    }

    pub fn with_lease(mut self, lease: impl Any + Send + Sync) -> Self {
        self.lease = Some(Box::new(lease));
        self
    }

    pub fn placement(&self) -> MemoryPlacement {
        self.placement
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> BufferView<'_> {
        BufferView::new(self.placement, &self.data)
    }

    pub fn view_mut(&mut self) -> BufferViewMut<'_> {
        BufferViewMut::new(self.placement, &mut self.data)
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("placement", &self.placement)
            .field("len", &self.data.len())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_equality_is_by_kind_address_and_length() {
        let data = [1u8, 2, 3, 4];
        let a = BufferView::new(MemoryPlacement::HOST, &data);
        let b = BufferView::new(MemoryPlacement::HOST, &data);
        let pinned = BufferView::new(MemoryPlacement::PINNED, &data);
        let shorter = BufferView::new(MemoryPlacement::HOST, &data[..2]);
        let copy = data;
        let elsewhere = BufferView::new(MemoryPlacement::HOST, &copy);

        assert_eq!(a, b);
        assert_ne!(a, pinned);
        assert_ne!(a, shorter);
        assert_ne!(a, elsewhere);
    }

    #[test]
    fn device_views_hide_host_bytes() {
        let mut data = vec![0u8; 8];
        let mut view = BufferViewMut::new(MemoryPlacement::device(1), &mut data);
        assert!(view.host_bytes_mut().is_none());
        assert!(view.as_view().host_bytes().is_none());
        assert_eq!(view.raw_bytes_mut().len(), 8);
    }

    #[test]
    fn sub_view_is_bounds_checked() {
        let mut data = vec![0u8; 8];
        let mut view = BufferViewMut::new(MemoryPlacement::HOST, &mut data);
        assert_eq!(view.sub_view(4, 4).map(|v| v.len()), Some(4));
        assert!(view.sub_view(6, 4).is_none());
    }

    #[test]
    fn shape_rejects_negative_dims() {
        assert!(Shape::from_dims(&[2, -1]).is_err());
        let shape = Shape::from_dims(&[2, 3]).unwrap();
        assert_eq!(shape.numel(), Some(6));
        assert_eq!(shape.byte_size(DType::I32), Some(24));
        assert_eq!(Shape::from_dims(&[4, 0]).unwrap().numel(), Some(0));
    }

    #[test]
    fn oversized_shape_has_no_size() {
        let shape = Shape::from_slice(&[1 << 62, 4]);
        assert_eq!(shape.numel(), None);
        assert_eq!(shape.byte_size(DType::U8), None);
        let shape = Shape::from_slice(&[1 << 61, 2]);
        assert!(shape.numel().is_some());
        assert_eq!(shape.byte_size(DType::I64), None);
    }

    #[test]
    fn dtype_accepts_config_names() {
        assert_eq!("TYPE_INT32".parse::<DType>().unwrap(), DType::I32);
        assert_eq!("UINT64".parse::<DType>().unwrap(), DType::U64);
        assert!("STRING".parse::<DType>().is_err());
    }

    #[test]
    fn fallback_chain_ends_in_host() {
        let chain = MemoryPlacement::device(0).fallback_chain();
        assert_eq!(
            chain.as_slice(),
            &[
                MemoryPlacement::device(0),
                MemoryPlacement::PINNED,
                MemoryPlacement::HOST
            ]
        );
        assert_eq!(MemoryPlacement::HOST.fallback_chain().len(), 1);
    }

    #[test]
    fn pinned_satisfies_host_but_device_does_not() {
        assert!(MemoryPlacement::PINNED.satisfies(MemoryPlacement::HOST));
        assert!(!MemoryPlacement::device(0).satisfies(MemoryPlacement::HOST));
        assert!(!MemoryPlacement::device(0).satisfies(MemoryPlacement::device(1)));
    }
}
