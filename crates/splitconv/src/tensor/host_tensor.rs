//! Host-backed tensor used for weights, literals, and readback.

use anyhow::{bail, ensure, Result};
use rand::Rng;

use super::shape::Shape;
use crate::layout::Layout;

/// Simple host-backed `f32` tensor stored in row-major order.
///
/// The layout tag does not reorder the payload; it records the layout a backend should report
/// once the tensor is materialized on device.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    layout: Layout,
    data: Vec<f32>,
}

impl Tensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            layout: Layout::RowMajor,
            data,
        })
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            layout: Layout::RowMajor,
            data: vec![0.0; len],
        }
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            layout: Layout::RowMajor,
            data: values,
        }
    }

    /// Retags the tensor layout without touching the payload.
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Copies the contiguous block `[start, start + len)` along `axis` into a new tensor.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let dims = self.shape.dims();
        ensure!(
            axis < dims.len(),
            "narrow axis {} out of range for shape {:?}",
            axis,
            dims
        );
        ensure!(
            start + len <= dims[axis],
            "narrow range {}..{} exceeds axis {} of length {}",
            start,
            start + len,
            axis,
            dims[axis]
        );

        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let src_stride = dims[axis] * inner;
        let chunk = len * inner;

        let mut data = Vec::with_capacity(outer * chunk);
        for outer_idx in 0..outer {
            let src_start = outer_idx * src_stride + start * inner;
            data.extend_from_slice(&self.data[src_start..src_start + chunk]);
        }

        Ok(Tensor {
            shape: self.shape.with_dim(axis, len),
            layout: self.layout,
            data,
        })
    }

    /// Splits the tensor along `axis` into consecutive blocks of `chunk` entries.
    ///
    /// The axis length must be a multiple of `chunk`.
    pub fn split(&self, axis: usize, chunk: usize) -> Result<Vec<Tensor>> {
        ensure!(chunk > 0, "split chunk must be > 0");
        let dims = self.shape.dims();
        ensure!(
            axis < dims.len(),
            "split axis {} out of range for shape {:?}",
            axis,
            dims
        );
        ensure!(
            dims[axis] % chunk == 0,
            "axis {} of length {} is not divisible into chunks of {}",
            axis,
            dims[axis],
            chunk
        );
        (0..dims[axis] / chunk)
            .map(|idx| self.narrow(axis, idx * chunk, chunk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(dims: &[usize]) -> Tensor {
        let shape = Shape::new(dims.to_vec());
        let data = (0..shape.num_elements()).map(|v| v as f32).collect();
        Tensor::from_vec(shape, data).unwrap()
    }

    #[test]
    fn from_vec_rejects_length_mismatch() {
        let err = Tensor::from_vec(Shape::new([2, 3]), vec![0.0; 5]).unwrap_err();
        assert!(err.to_string().contains("does not match shape"));
    }

    #[test]
    fn narrow_inner_axis_picks_strided_blocks() {
        let t = iota(&[2, 4]);
        let slice = t.narrow(1, 1, 2).unwrap();
        assert_eq!(slice.shape().dims(), &[2, 2]);
        assert_eq!(slice.data(), &[1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn split_outer_axis_keeps_order() {
        let t = iota(&[4, 2]);
        let parts = t.split(0, 2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].data(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(parts[1].data(), &[4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn split_rejects_uneven_chunks() {
        let t = iota(&[1, 1, 1, 6]);
        assert!(t.split(3, 4).is_err());
    }

    #[test]
    fn layout_tag_survives_narrow() {
        let t = iota(&[2, 2]).with_layout(Layout::Tile);
        assert_eq!(t.narrow(0, 0, 1).unwrap().layout(), Layout::Tile);
    }
}
