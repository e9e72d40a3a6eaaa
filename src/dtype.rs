//! Pixel data types and typed pixel buffers.
use std::{fmt, ops::AddAssign, str::FromStr};

use serde::{Deserialize, Serialize};
use zarrs::{
    array::{DataType, Element, ElementOwned, data_type},
    plugin::ExtensionName,
};

use crate::Error;

/// Numeric element types a pyramid can be written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl PixelType {
    pub const ALL: [PixelType; 10] = [
        PixelType::Uint8,
        PixelType::Uint16,
        PixelType::Uint32,
        PixelType::Uint64,
        PixelType::Int8,
        PixelType::Int16,
        PixelType::Int32,
        PixelType::Int64,
        PixelType::Float32,
        PixelType::Float64,
    ];

    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            PixelType::Uint8 | PixelType::Int8 => 1,
            PixelType::Uint16 | PixelType::Int16 => 2,
            PixelType::Uint32 | PixelType::Int32 | PixelType::Float32 => 4,
            PixelType::Uint64 | PixelType::Int64 | PixelType::Float64 => 8,
        }
    }

    /// Zarr V3 / numpy-style name, e.g. `uint16`.
    pub fn name(&self) -> &'static str {
        match self {
            PixelType::Uint8 => "uint8",
            PixelType::Uint16 => "uint16",
            PixelType::Uint32 => "uint32",
            PixelType::Uint64 => "uint64",
            PixelType::Int8 => "int8",
            PixelType::Int16 => "int16",
            PixelType::Int32 => "int32",
            PixelType::Int64 => "int64",
            PixelType::Float32 => "float32",
            PixelType::Float64 => "float64",
        }
    }

    /// Zarr V2 `dtype` string (little-endian).
    pub fn v2_dtype(&self) -> &'static str {
        match self {
            PixelType::Uint8 => "|u1",
            PixelType::Uint16 => "<u2",
            PixelType::Uint32 => "<u4",
            PixelType::Uint64 => "<u8",
            PixelType::Int8 => "|i1",
            PixelType::Int16 => "<i2",
            PixelType::Int32 => "<i4",
            PixelType::Int64 => "<i8",
            PixelType::Float32 => "<f4",
            PixelType::Float64 => "<f8",
        }
    }

    /// Parse a numpy type string such as `<u2` or `|u1`.
    ///
    /// Only native little-endian (or byte-order-free) strings are accepted.
    pub fn from_typestr(typestr: &str) -> Option<Self> {
        let (order, code) = typestr.split_at(1.min(typestr.len()));
        if !matches!(order, "<" | "|" | "=") {
            return None;
        }
        Self::ALL.into_iter().find(|t| &t.v2_dtype()[1..] == code)
    }

    pub fn to_data_type(&self) -> DataType {
        match self {
            PixelType::Uint8 => data_type::uint8(),
            PixelType::Uint16 => data_type::uint16(),
            PixelType::Uint32 => data_type::uint32(),
            PixelType::Uint64 => data_type::uint64(),
            PixelType::Int8 => data_type::int8(),
            PixelType::Int16 => data_type::int16(),
            PixelType::Int32 => data_type::int32(),
            PixelType::Int64 => data_type::int64(),
            PixelType::Float32 => data_type::float32(),
            PixelType::Float64 => data_type::float64(),
        }
    }

    /// Map a zarrs data type back to a pixel type, if it is one we can convert.
    pub fn from_data_type(data_type: &DataType) -> Option<Self> {
        let name = data_type.name_v3()?;
        name.parse().ok()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    pub fn is_signed(&self) -> bool {
        !matches!(
            self,
            PixelType::Uint8 | PixelType::Uint16 | PixelType::Uint32 | PixelType::Uint64
        )
    }

    /// Representable value range; floats report `0.0..=1.0`, the conventional display window.
    pub fn range(&self) -> (f64, f64) {
        match self {
            PixelType::Uint8 => (0.0, u8::MAX as f64),
            PixelType::Uint16 => (0.0, u16::MAX as f64),
            PixelType::Uint32 => (0.0, u32::MAX as f64),
            PixelType::Uint64 => (0.0, u64::MAX as f64),
            PixelType::Int8 => (i8::MIN as f64, i8::MAX as f64),
            PixelType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            PixelType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            PixelType::Int64 => (i64::MIN as f64, i64::MAX as f64),
            PixelType::Float32 | PixelType::Float64 => (0.0, 1.0),
        }
    }

    /// Number of bits of integer precision, mantissa bits for floats.
    fn precision_bits(&self) -> u32 {
        match self {
            PixelType::Uint8 => 8,
            PixelType::Uint16 => 16,
            PixelType::Uint32 => 32,
            PixelType::Uint64 => 64,
            PixelType::Int8 => 7,
            PixelType::Int16 => 15,
            PixelType::Int32 => 31,
            PixelType::Int64 => 63,
            PixelType::Float32 => 24,
            PixelType::Float64 => 53,
        }
    }

    /// Whether every value of `self` is exactly representable as `target`.
    pub fn losslessly_converts_to(&self, target: PixelType) -> bool {
        if *self == target {
            return true;
        }
        match (self.is_float(), target.is_float()) {
            (true, false) => false,
            (true, true) => target.size() >= self.size(),
            (false, true) => self.precision_bits() <= target.precision_bits(),
            (false, false) => {
                if self.is_signed() && !target.is_signed() {
                    false
                } else {
                    self.precision_bits() <= target.precision_bits()
                }
            }
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let found = Self::ALL
            .into_iter()
            .find(|t| t.name() == lower)
            .or_else(|| Self::from_typestr(&lower));
        found.ok_or_else(|| Error::invalid_option("dtype", format!("unknown data type {s:?}")))
    }
}

/// How a dtype override is allowed to change values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtypePolicy {
    /// Only conversions which preserve every source value.
    #[default]
    Lossless,
    /// Narrowing conversions saturate to the target range.
    Truncate,
}

/// Check that `source` may be written as `target` under `policy`.
pub fn check_override(
    source: PixelType,
    target: PixelType,
    policy: DtypePolicy,
) -> crate::Result<()> {
    if source.losslessly_converts_to(target) {
        return Ok(());
    }
    match policy {
        DtypePolicy::Truncate => {
            log::warn!("{source} data will be saturated to the {target} range");
            Ok(())
        }
        DtypePolicy::Lossless => Err(Error::UnsupportedDtype {
            source_dtype: source.to_string(),
            target: target.to_string(),
            reason: "conversion would lose values; enable truncation to saturate explicitly"
                .into(),
        }),
    }
}

/// A numeric pixel element.
pub trait Sample: Element + ElementOwned + Copy + Send + Sync + 'static {
    const PIXEL_TYPE: PixelType;

    /// Exact running total of samples.
    type Sum: Copy + Default + AddAssign;

    fn to_f64(self) -> f64;

    /// Convert from `f64`, rounding integers and saturating to the type's range.
    fn from_f64(value: f64) -> Self;

    fn to_sum(self) -> Self::Sum;

    /// Mean of `count` samples adding up to `sum`, rounded as [`Sample::from_f64`] does.
    fn mean(sum: Self::Sum, count: usize) -> Self;
}

macro_rules! impl_sample_int {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl Sample for $t {
                const PIXEL_TYPE: PixelType = PixelType::$variant;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    // float-to-int `as` casts saturate
                    value.round() as $t
                }

                type Sum = i128;

                fn to_sum(self) -> i128 {
                    self as i128
                }

                fn mean(sum: i128, count: usize) -> Self {
                    let count = count.max(1) as i128;
                    let (quotient, remainder) = (sum / count, sum % count);
                    // Halves round away from zero.
                    let mean = if 2 * remainder.abs() >= count {
                        quotient + sum.signum()
                    } else {
                        quotient
                    };
                    mean as $t
                }
            }
        )*
    };
}

impl_sample_int!(
    u8 => Uint8, u16 => Uint16, u32 => Uint32, u64 => Uint64,
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64
);

impl Sample for f32 {
    const PIXEL_TYPE: PixelType = PixelType::Float32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    type Sum = f64;

    fn to_sum(self) -> f64 {
        self as f64
    }

    fn mean(sum: f64, count: usize) -> Self {
        Self::from_f64(sum / count.max(1) as f64)
    }
}

impl Sample for f64 {
    const PIXEL_TYPE: PixelType = PixelType::Float64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    type Sum = f64;

    fn to_sum(self) -> f64 {
        self
    }

    fn mean(sum: f64, count: usize) -> Self {
        Self::from_f64(sum / count.max(1) as f64)
    }
}

/// A C-order buffer of pixels of one of the supported types.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// Dispatch over the typed vector inside a [`PixelBuffer`].
#[macro_export]
#[doc(hidden)]
macro_rules! with_pixels {
    ($buffer:expr, $v:ident => $body:expr) => {
        match $buffer {
            $crate::dtype::PixelBuffer::Uint8($v) => $body,
            $crate::dtype::PixelBuffer::Uint16($v) => $body,
            $crate::dtype::PixelBuffer::Uint32($v) => $body,
            $crate::dtype::PixelBuffer::Uint64($v) => $body,
            $crate::dtype::PixelBuffer::Int8($v) => $body,
            $crate::dtype::PixelBuffer::Int16($v) => $body,
            $crate::dtype::PixelBuffer::Int32($v) => $body,
            $crate::dtype::PixelBuffer::Int64($v) => $body,
            $crate::dtype::PixelBuffer::Float32($v) => $body,
            $crate::dtype::PixelBuffer::Float64($v) => $body,
        }
    };
}

/// Conversion between typed vectors and [`PixelBuffer`].
pub trait IntoPixelBuffer: Sample {
    fn into_buffer(values: Vec<Self>) -> PixelBuffer;
}

macro_rules! impl_into_pixel_buffer {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl IntoPixelBuffer for $t {
                fn into_buffer(values: Vec<Self>) -> PixelBuffer {
                    PixelBuffer::$variant(values)
                }
            }

            impl From<Vec<$t>> for PixelBuffer {
                fn from(values: Vec<$t>) -> Self {
                    PixelBuffer::$variant(values)
                }
            }
        )*
    };
}

impl_into_pixel_buffer!(
    u8 => Uint8, u16 => Uint16, u32 => Uint32, u64 => Uint64,
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    f32 => Float32, f64 => Float64
);

fn cast_vec<S: Sample, D: IntoPixelBuffer>(values: &[S]) -> PixelBuffer {
    D::into_buffer(values.iter().map(|v| D::from_f64(v.to_f64())).collect())
}

fn cast_to<S: Sample>(values: &[S], target: PixelType) -> PixelBuffer {
    match target {
        PixelType::Uint8 => cast_vec::<S, u8>(values),
        PixelType::Uint16 => cast_vec::<S, u16>(values),
        PixelType::Uint32 => cast_vec::<S, u32>(values),
        PixelType::Uint64 => cast_vec::<S, u64>(values),
        PixelType::Int8 => cast_vec::<S, i8>(values),
        PixelType::Int16 => cast_vec::<S, i16>(values),
        PixelType::Int32 => cast_vec::<S, i32>(values),
        PixelType::Int64 => cast_vec::<S, i64>(values),
        PixelType::Float32 => cast_vec::<S, f32>(values),
        PixelType::Float64 => cast_vec::<S, f64>(values),
    }
}

impl PixelBuffer {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelBuffer::Uint8(_) => PixelType::Uint8,
            PixelBuffer::Uint16(_) => PixelType::Uint16,
            PixelBuffer::Uint32(_) => PixelType::Uint32,
            PixelBuffer::Uint64(_) => PixelType::Uint64,
            PixelBuffer::Int8(_) => PixelType::Int8,
            PixelBuffer::Int16(_) => PixelType::Int16,
            PixelBuffer::Int32(_) => PixelType::Int32,
            PixelBuffer::Int64(_) => PixelType::Int64,
            PixelBuffer::Float32(_) => PixelType::Float32,
            PixelBuffer::Float64(_) => PixelType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        with_pixels!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to `target`; values saturate where the target range is narrower.
    ///
    /// Callers are expected to have validated the conversion with [`check_override`].
    pub fn cast(self, target: PixelType) -> PixelBuffer {
        if self.pixel_type() == target {
            return self;
        }
        with_pixels!(&self, v => cast_to(v.as_slice(), target))
    }
}
