use anyhow::{anyhow, Result};
use infergraph::{DType, OpDispatcher, Operation, ShapeDesc, Tensor, TensorData};

/// Kernel provider for the test graphs. The kernel is picked from the op
/// name up to the first '.', so "add.z" and "add.w" both dispatch to add.
pub struct MathDispatcher;

fn kernel_of(op: &Operation) -> &str {
    op.name.split('.').next().unwrap_or(op.name.as_str())
}

fn f32s(tensor: &Tensor) -> Result<Vec<f32>> {
    match tensor.data() {
        TensorData::F32(v) => Ok(v.clone()),
        other => Err(anyhow!("expected f32 tensor, got {:?}", other.dtype())),
    }
}

/// Pairwise combine with scalar broadcast on either side.
fn zip_broadcast(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) -> Result<Vec<f32>> {
    if a.len() == b.len() {
        Ok(a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect())
    } else if a.len() == 1 {
        Ok(b.iter().map(|y| f(a[0], *y)).collect())
    } else if b.len() == 1 {
        Ok(a.iter().map(|x| f(*x, b[0])).collect())
    } else {
        Err(anyhow!("length mismatch: {} vs {}", a.len(), b.len()))
    }
}

impl OpDispatcher for MathDispatcher {
    fn calculate_output_shape(&self, op: &Operation, inputs: &[&Tensor]) -> Result<Vec<ShapeDesc>> {
        match kernel_of(op) {
            "add" | "sub" | "mul" => {
                let wide = inputs
                    .iter()
                    .max_by_key(|t| t.len())
                    .ok_or_else(|| anyhow!("op {} has no inputs", op.name))?;
                Ok(vec![ShapeDesc::of(wide)])
            }
            "less" => Ok(vec![ShapeDesc::new(DType::Bool, Vec::new())]),
            other => Err(anyhow!("unknown kernel: {}", other)),
        }
    }

    fn execute(&self, op: &Operation, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        match kernel_of(op) {
            "add" => {
                let result = zip_broadcast(&f32s(inputs[0])?, &f32s(inputs[1])?, |x, y| x + y)?;
                *outputs[0].data_mut() = TensorData::F32(result);
            }
            "sub" => {
                let result = zip_broadcast(&f32s(inputs[0])?, &f32s(inputs[1])?, |x, y| x - y)?;
                *outputs[0].data_mut() = TensorData::F32(result);
            }
            "mul" => {
                let result = zip_broadcast(&f32s(inputs[0])?, &f32s(inputs[1])?, |x, y| x * y)?;
                *outputs[0].data_mut() = TensorData::F32(result);
            }
            "less" => {
                let a = f32s(inputs[0])?;
                let b = f32s(inputs[1])?;
                *outputs[0].data_mut() = TensorData::Bool(vec![a[0] < b[0]]);
            }
            other => return Err(anyhow!("unknown kernel: {}", other)),
        }
        Ok(())
    }
}

pub fn scalar_f32_of(tensor: &Tensor) -> Result<f32> {
    let values = f32s(tensor)?;
    if values.len() != 1 {
        return Err(anyhow!("expected scalar, got {} elements", values.len()));
    }
    Ok(values[0])
}

pub fn vec_f32_of(tensor: &Tensor) -> Result<Vec<f32>> {
    f32s(tensor)
}
