//! Safetensors files with string metadata

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{serialize, Dtype as SafeDtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Write `tensors` and `metadata` to `path`.
pub fn write_safetensors(
    path: &Path,
    tensors: &[(String, Tensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    // Views borrow their bytes, so collect all data first
    let mut all_data = Vec::with_capacity(tensors.len());
    for (_, tensor) in tensors {
        all_data.push(tensor_to_vec(tensor)?);
    }

    let mut views = Vec::with_capacity(tensors.len());
    for ((name, tensor), data) in tensors.iter().zip(&all_data) {
        let view = TensorView::new(convert_dtype(tensor.dtype())?, tensor.dims().to_vec(), data)?;
        views.push((name.as_str(), view));
    }

    let bytes = serialize(views, &Some(metadata))?;
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Every tensor in the file plus its metadata map.
pub fn read_safetensors(path: &Path, device: &Device) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&buffer)
        .with_context(|| format!("Invalid safetensors header in {}", path.display()))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
    Ok((tensors, metadata))
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::U8 => Ok(SafeDtype::U8),
        DType::U32 => Ok(SafeDtype::U32),
        _ => Err(anyhow!("Unsupported dtype for safetensors: {:?}", dtype)),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?.to_device(&Device::Cpu)?;

    let data = match tensor.dtype() {
        DType::F32 => {
            let data: Vec<f32> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::F16 => {
            let data: Vec<half::f16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::BF16 => {
            let data: Vec<half::bf16> = flattened.to_vec1()?;
            data.into_iter().flat_map(|f| f.to_le_bytes()).collect()
        }
        DType::U32 => {
            let data: Vec<u32> = flattened.to_vec1()?;
            data.into_iter().flat_map(|v| v.to_le_bytes()).collect()
        }
        DType::U8 => flattened.to_vec1::<u8>()?,
        other => return Err(anyhow!("Unsupported tensor dtype for conversion: {:?}", other)),
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_keeps_dtypes_and_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.safetensors");
        let device = Device::Cpu;
        let tensors = vec![
            ("a".to_string(), Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &device)?),
            ("b".to_string(), Tensor::new(&[1f32, 2.0], &device)?.to_dtype(DType::BF16)?),
            ("c".to_string(), Tensor::new(&[7u32, 9], &device)?),
        ];
        let mut metadata = HashMap::new();
        metadata.insert("epoch".to_string(), "3".to_string());

        write_safetensors(&path, &tensors, metadata)?;
        let (loaded, meta) = read_safetensors(&path, &device)?;

        assert_eq!(meta["epoch"], "3");
        assert_eq!(loaded["a"].to_vec2::<f32>()?, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(loaded["b"].dtype(), DType::BF16);
        assert_eq!(loaded["c"].to_vec1::<u32>()?, vec![7, 9]);
        Ok(())
    }
}
