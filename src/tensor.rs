//! Minimal row-major tensors exchanged with the executor.
//!
//! Tensors here are plain buffers with a shape: they are created per
//! inference call and handed across the session boundary by value.

use std::collections::HashMap;

use crate::error::{Result, SdkError};

pub type NamedTensors = HashMap<String, TensorValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    dims: Vec<usize>,
    data: Vec<T>,
}

impl<T: Copy> Tensor<T> {
    pub fn new(dims: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(SdkError::Shape(format!(
                "shape {dims:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn filled(dims: Vec<usize>, value: T) -> Self {
        let len = dims.iter().product();
        Self {
            dims,
            data: vec![value; len],
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.dims.len()
            || index.iter().zip(&self.dims).any(|(&i, &d)| i >= d)
        {
            return Err(SdkError::IndexOutOfBounds {
                index: index.to_vec(),
                dims: self.dims.clone(),
            });
        }
        let mut flat = 0;
        for (&i, &d) in index.iter().zip(&self.dims) {
            flat = flat * d + i;
        }
        Ok(flat)
    }

    pub fn at(&self, index: &[usize]) -> Result<T> {
        let flat = self.flat_index(index)?;
        Ok(self.data[flat])
    }

    pub fn set_at(&mut self, index: &[usize], value: T) -> Result<()> {
        let flat = self.flat_index(index)?;
        self.data[flat] = value;
        Ok(())
    }

    pub fn reshape(&self, dims: Vec<usize>) -> Result<Self> {
        Self::new(dims, self.data.clone())
    }

    /// Appends one column to a `[rows, cols]` tensor.
    pub fn append_column(&self, column: &[T]) -> Result<Self> {
        let [rows, cols] = self.dims[..] else {
            return Err(SdkError::Shape(format!(
                "append_column expects a 2-d tensor, got {:?}",
                self.dims
            )));
        };
        if column.len() != rows {
            return Err(SdkError::Shape(format!(
                "column of {} values does not match {rows} rows",
                column.len()
            )));
        }
        if cols == 0 {
            return Ok(Self {
                dims: vec![rows, 1],
                data: column.to_vec(),
            });
        }
        let mut data = Vec::with_capacity(rows * (cols + 1));
        for (row, &extra) in self.data.chunks(cols).zip(column) {
            data.extend_from_slice(row);
            data.push(extra);
        }
        Ok(Self {
            dims: vec![rows, cols + 1],
            data,
        })
    }

    /// Concatenates tensors of identical trailing shape along axis 0.
    pub fn stack(parts: &[Tensor<T>]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(SdkError::Shape("cannot stack zero tensors".into()));
        };
        let Some((_, tail)) = first.dims.split_first() else {
            return Err(SdkError::Shape("cannot stack scalar tensors".into()));
        };
        let mut rows = 0;
        let mut data = Vec::with_capacity(first.len() * parts.len());
        for part in parts {
            if part.dims.is_empty() || &part.dims[1..] != tail {
                return Err(SdkError::Shape(format!(
                    "cannot stack {:?} with {:?}",
                    part.dims, first.dims
                )));
            }
            rows += part.dims[0];
            data.extend_from_slice(&part.data);
        }
        let mut dims = vec![rows];
        dims.extend_from_slice(tail);
        Ok(Self { dims, data })
    }
}

impl<T: Copy + PartialOrd> Tensor<T> {
    /// Index of the maximum along `axis`, with that axis removed from the shape.
    ///
    /// Ties resolve to the first occurrence.
    pub fn argmax(&self, axis: usize) -> Result<Tensor<i64>> {
        if axis >= self.dims.len() {
            return Err(SdkError::Shape(format!(
                "axis {axis} out of range for shape {:?}",
                self.dims
            )));
        }
        let size = self.dims[axis];
        if size == 0 {
            return Err(SdkError::Shape(format!("cannot argmax over empty axis {axis}")));
        }
        let outer: usize = self.dims[..axis].iter().product();
        let inner: usize = self.dims[axis + 1..].iter().product();

        let mut out = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let base = o * size * inner + i;
                let mut best = 0;
                let mut best_value = self.data[base];
                for k in 1..size {
                    let value = self.data[base + k * inner];
                    if value > best_value {
                        best = k;
                        best_value = value;
                    }
                }
                out.push(best as i64);
            }
        }

        let mut dims: Vec<usize> = self
            .dims
            .iter()
            .enumerate()
            .filter(|&(d, _)| d != axis)
            .map(|(_, &n)| n)
            .collect();
        if dims.is_empty() {
            dims.push(1);
        }
        Ok(Tensor { dims, data: out })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Float32(Tensor<f32>),
    Int64(Tensor<i64>),
}

impl TensorValue {
    pub fn dims(&self) -> &[usize] {
        match self {
            TensorValue::Float32(t) => t.dims(),
            TensorValue::Int64(t) => t.dims(),
        }
    }

    pub fn into_f32(self, name: &str) -> Result<Tensor<f32>> {
        match self {
            TensorValue::Float32(t) => Ok(t),
            TensorValue::Int64(_) => Err(SdkError::Shape(format!(
                "expected float32 tensor for {name}, got int64"
            ))),
        }
    }

    pub fn into_i64(self, name: &str) -> Result<Tensor<i64>> {
        match self {
            TensorValue::Int64(t) => Ok(t),
            TensorValue::Float32(_) => Err(SdkError::Shape(format!(
                "expected int64 tensor for {name}, got float32"
            ))),
        }
    }
}

impl From<Tensor<f32>> for TensorValue {
    fn from(t: Tensor<f32>) -> Self {
        TensorValue::Float32(t)
    }
}

impl From<Tensor<i64>> for TensorValue {
    fn from(t: Tensor<i64>) -> Self {
        TensorValue::Int64(t)
    }
}

/// Removes and returns a float output, failing with the output name when missing.
pub fn take_f32(outputs: &mut NamedTensors, name: &str) -> Result<Tensor<f32>> {
    outputs
        .remove(name)
        .ok_or_else(|| SdkError::Inference(format!("executor produced no output named {name}")))?
        .into_f32(name)
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn argmax_slice(values: &[f32]) -> Option<usize> {
    let mut iter = values.iter().enumerate();
    let (mut best, mut best_value) = iter.next().map(|(i, &v)| (i, v))?;
    for (i, &v) in iter {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    Some(best)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Tensor<f32> {
        Tensor::new(vec![3, 3], vec![1., 2., 3., 4., 5., 6., 7., 8., 9.]).unwrap()
    }

    #[test]
    fn set_then_get_returns_written_value() {
        let mut t = Tensor::filled(vec![2, 3, 4], 0i64);
        for a in 0..2 {
            for b in 0..3 {
                for c in 0..4 {
                    let v = (a * 100 + b * 10 + c) as i64;
                    t.set_at(&[a, b, c], v).unwrap();
                    assert_eq!(t.at(&[a, b, c]).unwrap(), v);
                }
            }
        }
        assert_eq!(t.data()[23], 123);
    }

    #[test]
    fn indexing_rejects_wrong_arity_and_out_of_range() {
        let mut t = grid();
        assert!(matches!(t.at(&[1]), Err(SdkError::IndexOutOfBounds { .. })));
        assert!(matches!(t.at(&[0, 0, 0]), Err(SdkError::IndexOutOfBounds { .. })));
        assert!(t.at(&[3, 0]).is_err());
        assert!(t.set_at(&[0, 3], 1.0).is_err());
        assert_eq!(t.at(&[2, 2]).unwrap(), 9.0);
    }

    #[test]
    fn argmax_along_last_axis() {
        let out = grid().argmax(1).unwrap();
        assert_eq!(out.dims(), &[3]);
        assert_eq!(out.data(), &[2, 2, 2]);
    }

    #[test]
    fn argmax_along_first_axis() {
        let out = grid().argmax(0).unwrap();
        assert_eq!(out.data(), &[2, 2, 2]);
    }

    #[test]
    fn argmax_prefers_first_of_equal_values() {
        let t = Tensor::new(vec![4], vec![1.0f32, 7.0, 7.0, 3.0]).unwrap();
        let out = t.argmax(0).unwrap();
        assert_eq!(out.dims(), &[1]);
        assert_eq!(out.data(), &[1]);
    }

    #[test]
    fn argmax_middle_axis_of_3d() {
        // [1, 2, 3]: class axis in the middle.
        let t = Tensor::new(vec![1, 2, 3], vec![0.1f32, 0.9, 0.5, 0.2, 0.1, 0.8]).unwrap();
        let out = t.argmax(1).unwrap();
        assert_eq!(out.dims(), &[1, 3]);
        assert_eq!(out.data(), &[1, 0, 1]);
    }

    #[test]
    fn append_column_grows_sequence_axis() {
        let t = Tensor::new(vec![2, 1], vec![0i64, 0]).unwrap();
        let t = t.append_column(&[5, 6]).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
        assert_eq!(t.data(), &[0, 5, 0, 6]);
        assert!(t.append_column(&[1]).is_err());
    }

    #[test]
    fn softmax_of_equal_logits_is_uniform() {
        let probs = softmax(&[0.0, 0.0, 0.0]);
        for p in probs {
            assert!((p - 1.0 / 3.0).abs() < 1e-6);
        }
    }
}
