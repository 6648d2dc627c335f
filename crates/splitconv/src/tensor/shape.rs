//! Tensor dimensions.

use std::fmt;

/// Dimensions of a tensor, outermost first. Activations are NHWC, weights OIHW.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Panics on an empty dimension list.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns a copy of the shape with one axis resized.
    ///
    /// Panics if `axis` is out of range.
    pub fn with_dim(&self, axis: usize, value: usize) -> Shape {
        let mut dims = self.dims.clone();
        dims[axis] = value;
        Shape { dims }
    }

    /// Resolves a possibly negative axis against the rank.
    pub fn resolve_axis(&self, axis: isize) -> Option<usize> {
        let rank = self.rank() as isize;
        let resolved = if axis < 0 { rank + axis } else { axis };
        (0..rank).contains(&resolved).then_some(resolved as usize)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", parts.join("x"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_axes_count_from_the_end() {
        let shape = Shape::new([1, 16, 16, 8]);
        assert_eq!(shape.resolve_axis(-1), Some(3));
        assert_eq!(shape.resolve_axis(3), Some(3));
        assert_eq!(shape.resolve_axis(4), None);
        assert_eq!(shape.resolve_axis(-5), None);
    }

    #[test]
    fn with_dim_resizes_one_axis() {
        let shape = Shape::new([1, 16, 16, 8]).with_dim(3, 4);
        assert_eq!(shape.dims(), &[1, 16, 16, 4]);
        assert_eq!(shape.num_elements(), 1024);
        assert_eq!(shape.to_string(), "[1x16x16x4]");
    }
}
