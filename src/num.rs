use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element types a device buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    #[display("int8")]
    I8,
    #[display("uint8")]
    U8,
    #[display("int16")]
    I16,
    #[display("uint16")]
    U16,
    #[display("int32")]
    I32,
    #[display("uint32")]
    U32,
    #[display("int64")]
    I64,
    #[display("uint64")]
    U64,
    #[display("float16")]
    F16,
    #[display("float32")]
    F32,
    #[display("float64")]
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 | DataType::F16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 => 8,
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::F32 | DataType::F64)
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        !matches!(
            self,
            DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64
        )
    }

    /// Result type of a binary operation on `self` and `other`.
    ///
    /// Floats win over integers; `float16` widens to `float32` against integers wider than a
    /// byte. Mixed-sign integers pick the narrowest signed type holding both, up to `int64`.
    pub fn promote(self, other: Self) -> Self {
        let wider = |x: Self, y: Self| match x.size() >= y.size() {
            true => x,
            false => y,
        };
        match (self.is_float(), other.is_float()) {
            (true, true) => wider(self, other),
            (true, false) | (false, true) => {
                let (float, int) = match self.is_float() {
                    true => (self, other),
                    false => (other, self),
                };
                match float {
                    DataType::F16 if int.size() > 1 => DataType::F32,
                    float => float,
                }
            }
            (false, false) if self.is_signed() == other.is_signed() => wider(self, other),
            (false, false) => {
                let (signed, unsigned) = match self.is_signed() {
                    true => (self, other),
                    false => (other, self),
                };
                match unsigned.size() {
                    size if signed.size() > size => signed,
                    1 => DataType::I16,
                    2 => DataType::I32,
                    _ => DataType::I64,
                }
            }
        }
    }

    /// Reads element `index` of `bytes` as `f64`.
    pub fn load(self, bytes: &[u8], index: usize) -> f64 {
        let offset = index * self.size();
        let bytes = &bytes[offset..offset + self.size()];
        match self {
            DataType::I8 => bytemuck::pod_read_unaligned::<i8>(bytes) as f64,
            DataType::U8 => bytemuck::pod_read_unaligned::<u8>(bytes) as f64,
            DataType::I16 => bytemuck::pod_read_unaligned::<i16>(bytes) as f64,
            DataType::U16 => bytemuck::pod_read_unaligned::<u16>(bytes) as f64,
            DataType::I32 => bytemuck::pod_read_unaligned::<i32>(bytes) as f64,
            DataType::U32 => bytemuck::pod_read_unaligned::<u32>(bytes) as f64,
            DataType::I64 => bytemuck::pod_read_unaligned::<i64>(bytes) as f64,
            DataType::U64 => bytemuck::pod_read_unaligned::<u64>(bytes) as f64,
            DataType::F16 => bytemuck::pod_read_unaligned::<f16>(bytes).to_f64(),
            DataType::F32 => bytemuck::pod_read_unaligned::<f32>(bytes) as f64,
            DataType::F64 => bytemuck::pod_read_unaligned::<f64>(bytes),
        }
    }

    /// Writes `value` into element `index` of `bytes`, converting with `as` semantics.
    pub fn store(self, bytes: &mut [u8], index: usize, value: f64) {
        let offset = index * self.size();
        let bytes = &mut bytes[offset..offset + self.size()];
        match self {
            DataType::I8 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as i8))),
            DataType::U8 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as u8))),
            DataType::I16 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as i16))),
            DataType::U16 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as u16))),
            DataType::I32 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as i32))),
            DataType::U32 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as u32))),
            DataType::I64 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as i64))),
            DataType::U64 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as u64))),
            DataType::F16 => bytes.copy_from_slice(bytemuck::bytes_of(&f16::from_f64(value))),
            DataType::F32 => bytes.copy_from_slice(bytemuck::bytes_of(&(value as f32))),
            DataType::F64 => bytes.copy_from_slice(bytemuck::bytes_of(&value)),
        }
    }

    /// Rounds `value` to the nearest value representable by this type.
    #[inline]
    pub fn cast(self, value: f64) -> f64 {
        let mut bytes = [0u8; 8];
        self.store(&mut bytes, 0, value);
        self.load(&bytes, 0)
    }
}

/// Host types that map onto a [`DataType`].
pub trait Scalar: Sized + Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:expr) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = $data_type;
        }

        impl sealed::Sealed for $ty {}
    };
}

impl_scalar!(i8, DataType::I8);
impl_scalar!(u8, DataType::U8);
impl_scalar!(i16, DataType::I16);
impl_scalar!(u16, DataType::U16);
impl_scalar!(i32, DataType::I32);
impl_scalar!(u32, DataType::U32);
impl_scalar!(i64, DataType::I64);
impl_scalar!(u64, DataType::U64);
impl_scalar!(f16, DataType::F16);
impl_scalar!(f32, DataType::F32);
impl_scalar!(f64, DataType::F64);

mod sealed {
    pub trait Sealed {}
}
