use batchport_core::{BackendError, DType, IOName, ModelSpec, Result, Shape, TensorSpec};
use smallvec::SmallVec;

use crate::{CollectedBuffer, CollectedInput};

#[derive(Clone, Copy, Debug)]
pub struct ComputeCapabilities {
    /// Every input must arrive as a single segment.
    pub contiguous_inputs: bool,
    /// Inputs must be host-readable. Otherwise they are gathered into the
    /// instance's preferred memory.
    pub host_inputs: bool,
}

/// The per-batch computation run between collection and response.
pub trait Compute: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> ComputeCapabilities;

    /// Called once at model load; an error keeps the model from loading.
    fn validate(&self, spec: &ModelSpec) -> Result<()>;

    /// Runs the batch. Request-scoped failures go through
    /// `ComputeItem::fail`; an `Err` return fails every item in the batch.
    fn execute(&self, spec: &ModelSpec, batch: &mut [ComputeItem<'_>]) -> Result<()>;
}

/// Result tensor produced for one request, written out by the responder.
#[derive(Debug)]
pub struct ComputedOutput<'r> {
    pub name: IOName,
    pub dtype: DType,
    pub shape: Shape,
    pub data: SmallVec<[CollectedBuffer<'r>; 1]>,
}

impl ComputedOutput<'_> {
    pub fn byte_size(&self) -> usize {
        self.data.iter().map(|b| b.view().len()).sum()
    }
}

/// One live request as seen by the compute step.
#[derive(Debug)]
pub struct ComputeItem<'r> {
    index: usize,
    request_id: String,
    inputs: Vec<CollectedInput<'r>>,
    outputs: Vec<ComputedOutput<'r>>,
    error: Option<BackendError>,
}

impl<'r> ComputeItem<'r> {
    pub fn new(index: usize, request_id: impl Into<String>) -> Self {
        Self {
            index,
            request_id: request_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            error: None,
        }
    }

    /// Position of the request in the batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn push_input(&mut self, input: CollectedInput<'r>) {
        self.inputs.push(input);
    }

    pub fn input(&self, name: &IOName) -> Option<&CollectedInput<'r>> {
        self.inputs.iter().find(|i| &i.name == name)
    }

    pub fn take_input(&mut self, name: &IOName) -> Option<CollectedInput<'r>> {
        let pos = self.inputs.iter().position(|i| &i.name == name)?;
        Some(self.inputs.remove(pos))
    }

    pub fn push_output(&mut self, output: ComputedOutput<'r>) {
        self.outputs.push(output);
    }

    pub fn outputs(&self) -> &[ComputedOutput<'r>] {
        &self.outputs
    }

    pub fn take_outputs(&mut self) -> Vec<ComputedOutput<'r>> {
        std::mem::take(&mut self.outputs)
    }

    /// Marks this request failed. The first error wins.
    pub fn fail(&mut self, error: BackendError) {
        if self.error.is_none() {
            self.outputs.clear();
            self.error = Some(error);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<BackendError> {
        self.error.take()
    }
}

/// Returns every input unchanged as the output at the same position.
///
/// When the output datatype differs from the input's, the bytes are
/// reinterpreted under the output element width; a byte length that does
/// not divide evenly is rejected rather than truncated.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityCompute;

impl Compute for IdentityCompute {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn capabilities(&self) -> ComputeCapabilities {
        ComputeCapabilities {
            contiguous_inputs: false,
            host_inputs: false,
        }
    }

    fn validate(&self, spec: &ModelSpec) -> Result<()> {
        if spec.inputs.len() != spec.outputs.len() {
            return Err(BackendError::Config(format!(
                "identity model '{}' needs one output per input, got {} inputs and {} outputs",
                spec.name,
                spec.inputs.len(),
                spec.outputs.len()
            )));
        }
        Ok(())
    }

    fn execute(&self, spec: &ModelSpec, batch: &mut [ComputeItem<'_>]) -> Result<()> {
        for item in batch.iter_mut() {
            for (input_spec, output_spec) in spec.inputs.iter().zip(&spec.outputs) {
                if item.is_failed() {
                    break;
                }
                let Some(input) = item.take_input(&input_spec.name) else {
                    item.fail(BackendError::Internal(format!(
                        "input '{}' was not collected",
                        input_spec.name
                    )));
                    break;
                };
                match identity_shape(spec, output_spec, &input) {
                    Ok(shape) => item.push_output(ComputedOutput {
                        name: output_spec.name.clone(),
                        dtype: output_spec.dtype,
                        shape,
                        data: input.segments,
                    }),
                    Err(err) => item.fail(err),
                }
            }
        }
        Ok(())
    }
}

fn identity_shape(spec: &ModelSpec, output: &TensorSpec, input: &CollectedInput<'_>) -> Result<Shape> {
    let width = output.dtype.size();
    let byte_size = input.byte_size;
    if byte_size % width != 0 {
        return Err(BackendError::InvalidShape(format!(
            "'{}' holds {byte_size} bytes, not a multiple of the {}-byte {} element of '{}'",
            input.name, width, output.dtype, output.name
        )));
    }
    let elements = byte_size / width;

    let batch_dim = if spec.supports_batching() {
        input.shape.dims().first().copied()
    } else {
        None
    };

    let shape = if let Some(per_row) = output.fixed_numel() {
        let rows = batch_dim.unwrap_or(1);
        let mut dims: SmallVec<[usize; 6]> = batch_dim.into_iter().collect();
        dims.extend(output.dims.iter().flatten().copied());
        let expected = rows.checked_mul(per_row).ok_or_else(|| {
            BackendError::InvalidShape(format!(
                "'{}' with {rows} batch rows overflows the element count",
                output.name
            ))
        })?;
        if expected != elements {
            return Err(BackendError::InvalidShape(format!(
                "'{}' expects {expected} elements, input '{}' provides {elements}",
                output.name, input.name
            )));
        }
        Shape(dims)
    } else if output.dtype == input.dtype {
        input.shape.clone()
    } else {
        match batch_dim {
            Some(0) | None => Shape::from_slice(&[elements]),
            Some(rows) if elements % rows == 0 => Shape::from_slice(&[rows, elements / rows]),
            Some(rows) => {
                return Err(BackendError::InvalidShape(format!(
                    "{elements} {} elements cannot be split across {rows} batch rows",
                    output.dtype
                )))
            }
        }
    };
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use batchport_core::{BufferView, DType, MemoryPlacement, ModelConfig, TensorConfig};

    use super::*;

    fn spec(input: DType, output: DType, dims: Vec<i64>, max_batch: usize) -> ModelSpec {
        ModelConfig {
            name: "t".to_string(),
            max_batch_size: max_batch,
            inputs: vec![TensorConfig {
                name: "IN0".to_string(),
                data_type: input,
                dims: dims.clone(),
            }],
            outputs: vec![TensorConfig {
                name: "OUT0".to_string(),
                data_type: output,
                dims,
            }],
            require_non_empty_output: false,
        }
        .to_spec()
        .unwrap()
    }

    fn input<'a>(dtype: DType, dims: &[usize], bytes: &'a [u8]) -> CollectedInput<'a> {
        CollectedInput {
            name: IOName::from("IN0"),
            dtype,
            shape: Shape::from_slice(dims),
            byte_size: bytes.len(),
            segments: smallvec::smallvec![CollectedBuffer::Borrowed(BufferView::new(
                MemoryPlacement::HOST,
                bytes
            ))],
        }
    }

    #[test]
    fn same_dtype_keeps_shape() {
        let spec = spec(DType::I32, DType::I32, vec![4], 8);
        let bytes = [0u8; 16];
        let mut items = vec![ComputeItem::new(0, "r0")];
        items[0].push_input(input(DType::I32, &[1, 4], &bytes));
        IdentityCompute.execute(&spec, &mut items).unwrap();
        assert!(!items[0].is_failed());
        assert_eq!(items[0].outputs()[0].shape, Shape::from_slice(&[1, 4]));
        assert_eq!(items[0].outputs()[0].byte_size(), 16);
    }

    #[test]
    fn reinterprets_divisible_width() {
        let spec = spec(DType::U8, DType::U32, vec![-1], 0);
        let bytes = [0u8; 8];
        let mut items = vec![ComputeItem::new(0, "r0")];
        items[0].push_input(input(DType::U8, &[8], &bytes));
        IdentityCompute.execute(&spec, &mut items).unwrap();
        assert_eq!(items[0].outputs()[0].shape, Shape::from_slice(&[2]));
    }

    #[test]
    fn indivisible_width_is_invalid_shape() {
        let spec = spec(DType::U8, DType::U64, vec![-1], 0);
        let bytes = [0u8; 12];
        let mut items = vec![ComputeItem::new(0, "r0")];
        items[0].push_input(input(DType::U8, &[12], &bytes));
        IdentityCompute.execute(&spec, &mut items).unwrap();
        assert!(matches!(
            items[0].take_error(),
            Some(BackendError::InvalidShape(_))
        ));
        assert!(items[0].outputs().is_empty());
    }

    #[test]
    fn fixed_output_dims_must_match() {
        let spec = spec(DType::I32, DType::I32, vec![4], 0);
        let bytes = [0u8; 12];
        let mut items = vec![ComputeItem::new(0, "r0")];
        items[0].push_input(input(DType::I32, &[3], &bytes));
        IdentityCompute.execute(&spec, &mut items).unwrap();
        assert!(items[0].is_failed());
    }

    #[test]
    fn oversized_batch_dim_is_invalid_shape() {
        let spec = spec(DType::I32, DType::I32, vec![4], 8);
        let bytes = [0u8; 16];
        let mut items = vec![ComputeItem::new(0, "r0")];
        items[0].push_input(input(DType::I32, &[usize::MAX / 2, 4], &bytes));
        IdentityCompute.execute(&spec, &mut items).unwrap();
        assert!(matches!(
            items[0].take_error(),
            Some(BackendError::InvalidShape(_))
        ));
    }

    #[test]
    fn validate_requires_paired_outputs() {
        let mut spec = spec(DType::I32, DType::I32, vec![4], 0);
        spec.outputs.clear();
        assert!(matches!(
            IdentityCompute.validate(&spec),
            Err(BackendError::Config(_))
        ));
    }
}
