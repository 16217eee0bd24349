use anyhow::{bail, Context, Result};
use batchport_core::Shape;
use batchport_host::{InputTensor, ModelRegistry};

/// The demonstration client: liveness check, one request carrying a 3x3
/// `f64` matrix sent as nine `UINT64` words, and the echoed matrix printed
/// back row by row.
pub async fn run(registry: &ModelRegistry, model: &str) -> Result<()> {
    if !registry.is_live() {
        bail!("Server is not live");
    }

    let spec = registry
        .model(model)
        .with_context(|| format!("model '{model}' is not loaded"))?
        .spec();
    let input_name = spec.inputs[0].name.clone();
    let output_name = spec.outputs[0].name.clone();

    let matrix = [
        [1.5f64, 2.2, 3.3],
        [4.0, 57.2, 6.0],
        [7.0, 8.0, 9.3455],
    ];
    let words: Vec<u64> = matrix.iter().flatten().map(|v| v.to_bits()).collect();
    println!("Shape: {}", words.len());

    let mut dims = vec![words.len()];
    if spec.supports_batching() {
        dims.insert(0, 1);
    }
    let input = InputTensor::from_u64(input_name.0, Shape::from_slice(&dims), &words);

    let response = registry.infer(model, "demo-0", vec![input]).await?;
    if let Some(err) = &response.error {
        bail!("Error: {err}");
    }
    let output = response
        .output(output_name.as_str())
        .with_context(|| format!("response carries no '{output_name}'"))?;

    println!("Received output:");
    let values: Vec<f64> = output.to_u64().into_iter().map(f64::from_bits).collect();
    for row in values.chunks(3) {
        let row: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", row.join(" "));
    }
    Ok(())
}
