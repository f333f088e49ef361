//! Small shape utilities over `TensorData`, independent of any backend.

use crate::types::{BucketDatasetError, DatasetResult};
use burn::tensor::{DType, TensorData};

pub fn f32_values(data: &TensorData) -> DatasetResult<Vec<f32>> {
    let converted;
    let data = if data.dtype == DType::F32 {
        data
    } else {
        converted = data.clone().convert::<f32>();
        &converted
    };
    data.to_vec::<f32>()
        .map_err(|e| BucketDatasetError::Tensor(format!("{e:?}")))
}

pub fn i64_values(data: &TensorData) -> DatasetResult<Vec<i64>> {
    let converted;
    let data = if data.dtype == DType::I64 {
        data
    } else {
        converted = data.clone().convert::<i64>();
        &converted
    };
    data.to_vec::<i64>()
        .map_err(|e| BucketDatasetError::Tensor(format!("{e:?}")))
}

/// Token ids as a `[1, n]` tensor.
pub fn token_ids(ids: Vec<i64>) -> TensorData {
    let n = ids.len();
    TensorData::new(ids, [1, n])
}

/// Concatenate tensors along their last dimension; all other dims must match.
pub fn concat_last_dim(parts: &[TensorData]) -> DatasetResult<TensorData> {
    let first = parts
        .first()
        .ok_or_else(|| BucketDatasetError::Tensor("nothing to concatenate".to_string()))?;
    if parts.len() == 1 {
        return Ok(first.clone());
    }
    let rank = first.shape.len();
    if rank == 0 {
        return Err(BucketDatasetError::Tensor(
            "cannot concatenate scalars".to_string(),
        ));
    }
    let outer = &first.shape[..rank - 1];
    for part in parts {
        if part.shape.len() != rank || &part.shape[..rank - 1] != outer {
            return Err(BucketDatasetError::Tensor(format!(
                "shape {:?} incompatible with {:?} for last-dim concat",
                part.shape, first.shape
            )));
        }
    }
    let rows: usize = outer.iter().product();
    let values = parts
        .iter()
        .map(f32_values)
        .collect::<DatasetResult<Vec<_>>>()?;
    let widths: Vec<usize> = parts.iter().map(|p| p.shape[rank - 1]).collect();
    let total_width: usize = widths.iter().sum();

    let mut out = Vec::with_capacity(rows * total_width);
    for row in 0..rows {
        for (vals, width) in values.iter().zip(&widths) {
            out.extend_from_slice(&vals[row * width..(row + 1) * width]);
        }
    }
    let mut shape = outer.to_vec();
    shape.push(total_width);
    Ok(TensorData::new(out, shape))
}

/// Stack equally shaped tensors along a new leading dimension.
pub fn stack(parts: &[&TensorData]) -> DatasetResult<TensorData> {
    let first = parts
        .first()
        .ok_or_else(|| BucketDatasetError::Tensor("nothing to stack".to_string()))?;
    let mut out = Vec::with_capacity(parts.len() * first.num_elements());
    for part in parts {
        if part.shape != first.shape {
            return Err(BucketDatasetError::Tensor(format!(
                "cannot stack {:?} with {:?}",
                part.shape, first.shape
            )));
        }
        out.extend(f32_values(part)?);
    }
    let mut shape = Vec::with_capacity(first.shape.len() + 1);
    shape.push(parts.len());
    shape.extend_from_slice(&first.shape);
    Ok(TensorData::new(out, shape))
}

/// Concatenate along dim 0; trailing dims must match.
pub fn cat_rows(parts: &[&TensorData]) -> DatasetResult<TensorData> {
    let first = parts
        .first()
        .ok_or_else(|| BucketDatasetError::Tensor("nothing to concatenate".to_string()))?;
    if first.shape.is_empty() {
        return Err(BucketDatasetError::Tensor(
            "cannot concatenate scalars".to_string(),
        ));
    }
    let mut rows = 0;
    let mut out = Vec::new();
    for part in parts {
        if part.shape.len() != first.shape.len() || part.shape[1..] != first.shape[1..] {
            return Err(BucketDatasetError::Tensor(format!(
                "cannot concatenate {:?} with {:?}",
                part.shape, first.shape
            )));
        }
        rows += part.shape[0];
        out.extend(f32_values(part)?);
    }
    let mut shape = first.shape.clone();
    shape[0] = rows;
    Ok(TensorData::new(out, shape))
}

/// Same as [`cat_rows`] for integer tensors.
pub fn cat_rows_i64(parts: &[&TensorData]) -> DatasetResult<TensorData> {
    let first = parts
        .first()
        .ok_or_else(|| BucketDatasetError::Tensor("nothing to concatenate".to_string()))?;
    let mut rows = 0;
    let mut out = Vec::new();
    for part in parts {
        if part.shape.len() != first.shape.len() || part.shape[1..] != first.shape[1..] {
            return Err(BucketDatasetError::Tensor(format!(
                "cannot concatenate token ids {:?} with {:?}",
                part.shape, first.shape
            )));
        }
        rows += part.shape[0];
        out.extend(i64_values(part)?);
    }
    let mut shape = first.shape.clone();
    shape[0] = rows;
    Ok(TensorData::new(out, shape))
}

/// Drop a leading batch dimension of size one, e.g. `[1, 4, 64, 64]` → `[4, 64, 64]`.
pub fn squeeze_batch(data: TensorData) -> TensorData {
    if data.shape.len() > 1 && data.shape[0] == 1 {
        let shape = data.shape[1..].to_vec();
        let mut data = data;
        data.shape = shape;
        data
    } else {
        data
    }
}

pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0).max(1.0);
    (mean as f32, var.sqrt() as f32)
}
