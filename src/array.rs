use std::sync::Arc;

use derive_more::{Deref, Display, From};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    driver::{Buffer, BufferId, Context, DriverError},
    num::{DataType, Scalar},
};

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("array creation error: shape {0} does not match data len {1}")]
    Create(Shape, usize),
    #[error("array shape error: only 1-D and 2-D arrays are supported, got {0}")]
    Rank(Shape),
    #[error("array layout error: leading dimension {ld} and offset {start} do not fit {shape} in {size} elements")]
    Layout {
        shape: Shape,
        start: usize,
        ld: usize,
        size: usize,
    },
    #[error("array type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("array size error: {0} elements of {1} overflow the address space")]
    Overflow(Shape, DataType),
    #[error("array context error: buffer {0} was allocated by another context")]
    Foreign(uid::Id<BufferId>),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Extent of an array: one or two dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, From, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl From<usize> for Shape {
    #[inline]
    fn from(value: usize) -> Self {
        Self([value].into())
    }
}

impl From<[usize; 2]> for Shape {
    #[inline]
    fn from(value: [usize; 2]) -> Self {
        Self(value.into())
    }
}

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl Shape {
    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }

    /// Number of elements, or `None` if it overflows `usize`.
    pub fn checked_size(&self) -> Option<usize> {
        self.iter().try_fold(1usize, |acc, &x| acc.checked_mul(x))
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.first().copied().unwrap_or(1)
    }

    /// Number of columns; 1 for vectors.
    #[inline]
    pub fn cols(&self) -> usize {
        self.get(1).copied().unwrap_or(1)
    }
}

/// A logical view over a device buffer.
///
/// Elements are column-major: element `(i, j)` lives at `start + i + j * ld`.
#[derive(Debug, Clone)]
pub struct Array {
    context: Arc<Context>,
    buffer: Buffer,
    shape: Shape,
    r#type: DataType,
    start: usize,
    ld: usize,
}

impl Array {
    /// Allocates a zero-filled array on `context`.
    pub fn zeros(
        context: &Arc<Context>,
        shape: impl Into<Shape>,
        r#type: DataType,
    ) -> Result<Self, ArrayError> {
        let shape = shape.into();
        if !(1..=2).contains(&shape.len()) {
            return Err(ArrayError::Rank(shape));
        }
        let Some(bytes) = shape
            .checked_size()
            .and_then(|size| size.checked_mul(r#type.size()))
        else {
            return Err(ArrayError::Overflow(shape, r#type));
        };
        let buffer = context.alloc(bytes)?;
        let ld = shape.rows();
        Ok(Self {
            context: context.clone(),
            buffer,
            shape,
            r#type,
            start: 0,
            ld,
        })
    }

    /// Allocates an array on `context` and uploads `contents`.
    pub fn from_slice<T: Scalar>(
        context: &Arc<Context>,
        shape: impl Into<Shape>,
        contents: &[T],
    ) -> Result<Self, ArrayError> {
        let shape = shape.into();
        if shape.checked_size() != Some(contents.len()) {
            return Err(ArrayError::Create(shape, contents.len()));
        }
        let array = Self::zeros(context, shape, T::DATA_TYPE)?;
        array
            .buffer
            .write()
            .copy_from_slice(bytemuck::cast_slice(contents));
        Ok(array)
    }

    /// Wraps an existing buffer with a layout.
    pub fn from_buffer(
        context: &Arc<Context>,
        buffer: Buffer,
        shape: impl Into<Shape>,
        r#type: DataType,
        start: usize,
        ld: usize,
    ) -> Result<Self, ArrayError> {
        let shape = shape.into();
        if !(1..=2).contains(&shape.len()) {
            return Err(ArrayError::Rank(shape));
        }
        if buffer.context() != context.id() {
            return Err(ArrayError::Foreign(buffer.id()));
        }
        let size = buffer.size() / r#type.size();
        // one past the last element, column-major
        let end = match shape.checked_size() {
            None => None,
            Some(0) => Some(start),
            Some(_) if ld < shape.rows() => None,
            Some(_) => (shape.cols() - 1)
                .checked_mul(ld)
                .and_then(|x| x.checked_add(start))
                .and_then(|x| x.checked_add(shape.rows())),
        };
        if !end.is_some_and(|end| end <= size) {
            return Err(ArrayError::Layout {
                shape,
                start,
                ld,
                size,
            });
        }
        Ok(Self {
            context: context.clone(),
            buffer,
            shape,
            r#type,
            start,
            ld,
        })
    }

    /// A new array wrapper over the same storage and layout.
    #[inline]
    pub fn view(&self) -> Self {
        self.clone()
    }

    #[inline]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Leading dimension: distance between consecutive columns.
    #[inline]
    pub fn ld(&self) -> usize {
        self.ld
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shape.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if both arrays refer to the same device buffer.
    #[inline]
    pub fn shares_storage(&self, other: &Array) -> bool {
        self.buffer == other.buffer
    }

    /// Buffer element index of logical element `index`, counted column by column.
    #[inline]
    pub fn offset(&self, index: usize) -> usize {
        let rows = self.shape.rows().max(1);
        self.start + index % rows + (index / rows) * self.ld
    }

    /// Reads the elements back to the host, column by column.
    ///
    /// The result reflects completed work only; wait on the producing events first.
    pub fn read<T: Scalar>(&self) -> Result<Vec<T>, ArrayError> {
        if self.r#type != T::DATA_TYPE {
            return Err(ArrayError::Type(self.r#type, T::DATA_TYPE));
        }
        let data = self.buffer.read();
        let size = self.r#type.size();
        let output = (0..self.len())
            .map(|index| self.offset(index) * size)
            .map(|offset| bytemuck::pod_read_unaligned(&data[offset..offset + size]))
            .collect();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::{Array, ArrayError};
    use crate::{
        driver::{Context, DriverError, Registry},
        num::DataType,
    };

    #[test]
    fn test_create() -> Result<(), ArrayError> {
        let registry = Registry::builder()
            .driver(crate::driver::OpenCl::default())
            .build()?;
        let device = &registry.platforms()[0].devices()[0];
        let context = Context::new(device)?;

        let x = Array::from_slice(&context, [2usize, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        assert_eq!(x.shape().rows(), 2);
        assert_eq!(x.shape().cols(), 3);
        assert_eq!(x.ld(), 2);
        assert_eq!(x.read::<f32>()?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(matches!(x.read::<f64>(), Err(ArrayError::Type(..))));

        let y = x.view();
        assert!(y.shares_storage(&x));
        assert_eq!(context.memory_usage(), 24);

        // second row of `x` as a vector view
        let row = Array::from_buffer(&context, x.buffer().clone(), [1usize, 3], DataType::F32, 1, 2)?;
        assert_eq!(row.read::<f32>()?, vec![2.0, 4.0, 6.0]);

        let err = Array::from_buffer(&context, x.buffer().clone(), [2usize, 3], DataType::F32, 1, 2);
        assert!(matches!(err, Err(ArrayError::Layout { .. })));

        assert!(matches!(
            Array::from_slice(&context, 4usize, &[1u8, 2, 3]),
            Err(ArrayError::Create(..))
        ));
        assert!(matches!(
            Array::zeros(&context, vec![2, 2, 2], DataType::F32),
            Err(ArrayError::Rank(..))
        ));
        Ok(())
    }

    #[test]
    fn test_overflow() -> Result<(), ArrayError> {
        let registry = Registry::builder()
            .driver(crate::driver::OpenCl::default())
            .build()?;
        let device = &registry.platforms()[0].devices()[0];
        let context = Context::new(device)?;

        assert!(matches!(
            Array::zeros(&context, [usize::MAX / 2, 4], DataType::F32),
            Err(ArrayError::Overflow(..))
        ));
        assert!(matches!(
            Array::zeros(&context, usize::MAX / 2, DataType::F32),
            Err(ArrayError::Overflow(..))
        ));
        assert!(matches!(
            Array::from_slice(&context, [usize::MAX, 2], &[1.0f32, 2.0]),
            Err(ArrayError::Create(..))
        ));

        // representable but larger than the device
        assert!(matches!(
            Array::zeros(&context, usize::MAX / 8, DataType::F32),
            Err(ArrayError::Driver(DriverError::Execution(_)))
        ));
        assert_eq!(context.memory_usage(), 0);

        let x = Array::zeros(&context, 4usize, DataType::F32)?;
        assert!(matches!(
            Array::from_buffer(&context, x.buffer().clone(), [2usize, 2], DataType::F32, 0, usize::MAX),
            Err(ArrayError::Layout { .. })
        ));
        assert!(matches!(
            Array::from_buffer(&context, x.buffer().clone(), 1usize, DataType::F32, usize::MAX, 1),
            Err(ArrayError::Layout { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_foreign_buffer() -> Result<(), ArrayError> {
        let registry = Registry::builder()
            .driver(crate::driver::OpenCl::default())
            .build()?;
        let device = &registry.platforms()[0].devices()[0];
        let context = Context::new(device)?;
        let other = Context::new(device)?;

        let x = Array::zeros(&context, 4usize, DataType::F32)?;
        let err = Array::from_buffer(&other, x.buffer().clone(), 4usize, DataType::F32, 0, 4);
        assert!(matches!(err, Err(ArrayError::Foreign(id)) if id == x.buffer().id()));
        assert_eq!(other.memory_usage(), 0);

        let y = Array::from_buffer(&context, x.buffer().clone(), 4usize, DataType::F32, 0, 4)?;
        assert!(y.shares_storage(&x));
        Ok(())
    }
}
