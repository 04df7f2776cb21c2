use std::fmt;

// Shape: ordered per-axis sizes of a tensor
//
//   Scalar: Shape([])          0 axes, 1 element
//   Vector: Shape([5])         1 axis, 5 elements
//   Matrix: Shape([3, 4])      2 axes, 12 elements
//   Empty:  Shape([2, 0])      2 axes, 0 elements
//
// The canonical memory layout of every buffer is row-major: the last axis
// varies fastest. All backends share this layout, so strides are a pure
// function of the shape (see `stride_contiguous`).

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape [].
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of elements: the product of all dimensions.
    /// The scalar shape [] has 1 element; any zero-sized axis gives 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides: `stride[i] = product(dims[i+1..])`, `[]` for rank 0.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        crate::strided::strides(&self.0)
    }

    /// Size of a specific axis.
    pub fn dim(&self, axis: usize) -> crate::Result<usize> {
        self.0.get(axis).copied().ok_or(crate::Error::AxisOutOfRange {
            axis,
            rank: self.rank(),
        })
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.clone()
    }

    /// Copy of this shape with `size` inserted at `axis`.
    pub fn inserted(&self, axis: usize, size: usize) -> crate::Result<Shape> {
        if axis > self.rank() {
            return Err(crate::Error::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        let mut dims = self.0.clone();
        dims.insert(axis, size);
        Ok(Shape(dims))
    }

    /// Copy of this shape with the size of `axis` replaced.
    pub fn with_dim(&self, axis: usize, size: usize) -> crate::Result<Shape> {
        self.dim(axis)?;
        let mut dims = self.0.clone();
        dims[axis] = size;
        Ok(Shape(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
