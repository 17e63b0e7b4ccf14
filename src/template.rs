//! Payload templates and the array types that travel through the queue
//!
//! A [`Template`] fixes element type and shape (and therefore byte length)
//! for one payload kind. Arrays are plain bytes tagged with that information;
//! no serialization happens on the way through shared memory.

use crate::error::{Mismatch, Payload, Result, SlotqError};
use std::fmt;

/// Element type of an array
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    U64 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
}

impl ElementType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }

    pub(crate) const fn code(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => ElementType::U8,
            2 => ElementType::I8,
            3 => ElementType::U16,
            4 => ElementType::I16,
            5 => ElementType::U32,
            6 => ElementType::I32,
            7 => ElementType::U64,
            8 => ElementType::I64,
            9 => ElementType::F32,
            10 => ElementType::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "uint8",
            ElementType::I8 => "int8",
            ElementType::U16 => "uint16",
            ElementType::I16 => "int16",
            ElementType::U32 => "uint32",
            ElementType::I32 => "int32",
            ElementType::U64 => "uint64",
            ElementType::I64 => "int64",
            ElementType::F32 => "float32",
            ElementType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Rust scalar types that can be stored in an [`Array`]
pub trait Element: Copy {
    const TYPE: ElementType;

    fn write_ne(self, out: &mut [u8]);

    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const TYPE: ElementType = ElementType::$variant;

                #[inline]
                fn write_ne(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

/// Fixed element type and shape for one payload kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Template {
    dtype: ElementType,
    shape: Vec<usize>,
}

impl Template {
    pub fn new(dtype: ElementType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    #[inline]
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements, `None` on overflow
    pub fn checked_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// Byte length, `None` on overflow
    pub fn checked_byte_len(&self) -> Option<usize> {
        self.checked_elements()?.checked_mul(self.dtype.size())
    }

    /// Byte length of a conforming array.
    ///
    /// Saturates for shapes whose size does not fit in `usize`; such
    /// templates are rejected when a queue is created.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.checked_byte_len().unwrap_or(usize::MAX)
    }

    /// Check `array` against this template: element type, then shape, then
    /// byte length.
    pub fn check(&self, payload: Payload, array: &ArrayView<'_>) -> Result<()> {
        if array.dtype != self.dtype {
            return Err(SlotqError::validation(
                payload,
                Mismatch::ElementType {
                    expected: self.dtype,
                    got: array.dtype,
                },
            ));
        }
        if array.shape != self.shape.as_slice() {
            return Err(SlotqError::validation(
                payload,
                Mismatch::Shape {
                    expected: self.shape.clone(),
                    got: array.shape.to_vec(),
                },
            ));
        }
        if array.data.len() != self.byte_len() {
            return Err(SlotqError::validation(
                payload,
                Mismatch::ByteLength {
                    expected: self.byte_len(),
                    got: array.data.len(),
                },
            ));
        }
        Ok(())
    }
}

impl From<&Array> for Template {
    fn from(array: &Array) -> Self {
        Template::new(array.dtype, array.shape.clone())
    }
}

/// Borrowed array: element type, shape and the raw native-endian bytes
#[derive(Debug, Clone, Copy)]
pub struct ArrayView<'a> {
    dtype: ElementType,
    shape: &'a [usize],
    data: &'a [u8],
}

impl<'a> ArrayView<'a> {
    /// Wrap raw bytes. Nothing is checked here; `put` validates against the
    /// queue's templates.
    pub fn new(dtype: ElementType, shape: &'a [usize], data: &'a [u8]) -> Self {
        Self { dtype, shape, data }
    }

    #[inline]
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &'a [usize] {
        self.shape
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Copy into an owned array
    pub fn to_array(&self) -> Array {
        Array {
            dtype: self.dtype,
            shape: self.shape.to_vec(),
            data: self.data.to_vec(),
        }
    }
}

impl<'a> From<&'a Array> for ArrayView<'a> {
    fn from(array: &'a Array) -> Self {
        array.view()
    }
}

/// Owned array, independent of any shared memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Array {
    dtype: ElementType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Array {
    /// Zero-filled array matching `template`
    pub fn zeros(template: &Template) -> Self {
        Self {
            dtype: template.dtype,
            shape: template.shape.clone(),
            data: vec![0u8; template.byte_len()],
        }
    }

    /// Build an array from typed elements laid out in row-major order.
    ///
    /// The element count is not checked against `shape`; a mismatch surfaces
    /// as a byte-length validation error on `put`.
    pub fn from_elements<T: Element>(shape: impl Into<Vec<usize>>, elements: &[T]) -> Self {
        let size = T::TYPE.size();
        let mut data = vec![0u8; elements.len() * size];
        for (chunk, &value) in data.chunks_exact_mut(size).zip(elements) {
            value.write_ne(chunk);
        }
        Self {
            dtype: T::TYPE,
            shape: shape.into(),
            data,
        }
    }

    /// Build an array from raw native-endian bytes
    pub fn from_bytes(dtype: ElementType, shape: impl Into<Vec<usize>>, data: Vec<u8>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            data,
        }
    }

    /// Decode the elements as `T`, `None` if `T` is not the element type
    pub fn to_elements<T: Element>(&self) -> Option<Vec<T>> {
        if T::TYPE != self.dtype {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.dtype.size())
                .map(T::read_ne)
                .collect(),
        )
    }

    #[inline]
    pub fn view(&self) -> ArrayView<'_> {
        ArrayView {
            dtype: self.dtype,
            shape: &self.shape,
            data: &self.data,
        }
    }

    #[inline]
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Take the raw bytes, dropping element type and shape
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len() {
        let t = Template::new(ElementType::F32, vec![300, 300, 3]);
        assert_eq!(t.byte_len(), 300 * 300 * 3 * 4);
        assert_eq!(Template::new(ElementType::U8, vec![4, 0]).byte_len(), 0);
        assert_eq!(
            Template::new(ElementType::F64, vec![usize::MAX, 2]).checked_byte_len(),
            None
        );
    }

    #[test]
    fn test_typed_elements() {
        let arr = Array::from_elements(vec![2, 2], &[1.5f32, -2.0, 0.25, 8.0]);
        assert_eq!(arr.dtype(), ElementType::F32);
        assert_eq!(arr.as_bytes().len(), 16);
        assert_eq!(arr.to_elements::<f32>().unwrap(), vec![1.5, -2.0, 0.25, 8.0]);
        assert!(arr.to_elements::<i32>().is_none());
    }

    #[test]
    fn test_template_from_sample_array() {
        let sample = Array::from_elements(vec![2, 3], &[1i16, 2, 3, 4, 5, 6]);
        let t = Template::from(&sample);
        assert_eq!(t.dtype(), ElementType::I16);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.byte_len(), 12);
        assert!(t.check(Payload::Image, &sample.view()).is_ok());

        // A borrowed view copied out is independent of the source
        let copy = sample.view().to_array();
        assert_eq!(copy, sample);
        let mut bytes = sample.into_bytes();
        bytes[0] = 0xFF;
        assert_eq!(copy.to_elements::<i16>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn test_check_order() {
        let t = Template::new(ElementType::U8, vec![300, 300, 3]);

        let wrong_type = Array::from_elements(vec![300, 300, 3], &vec![0u16; 300 * 300 * 3][..]);
        let err = t.check(Payload::Image, &wrong_type.view()).unwrap_err();
        assert!(matches!(
            err,
            SlotqError::Validation {
                mismatch: Mismatch::ElementType { .. },
                ..
            }
        ));

        // Same byte count, different shape
        let wrong_shape = Array::from_bytes(ElementType::U8, vec![300, 900], vec![0u8; 270_000]);
        let err = t.check(Payload::Image, &wrong_shape.view()).unwrap_err();
        assert!(matches!(
            err,
            SlotqError::Validation {
                mismatch: Mismatch::Shape { .. },
                ..
            }
        ));

        let short = Array::from_bytes(ElementType::U8, vec![300, 300, 3], vec![0u8; 10]);
        let err = t.check(Payload::Label, &short.view()).unwrap_err();
        assert!(matches!(
            err,
            SlotqError::Validation {
                payload: Payload::Label,
                mismatch: Mismatch::ByteLength {
                    expected: 270_000,
                    got: 10
                },
            }
        ));

        assert!(t.check(Payload::Image, &Array::zeros(&t).view()).is_ok());
    }

    #[test]
    fn test_element_type_codes() {
        for dtype in [
            ElementType::U8,
            ElementType::I8,
            ElementType::U16,
            ElementType::I16,
            ElementType::U32,
            ElementType::I32,
            ElementType::U64,
            ElementType::I64,
            ElementType::F32,
            ElementType::F64,
        ] {
            assert_eq!(ElementType::from_code(dtype.code()), Some(dtype));
        }
        assert_eq!(ElementType::from_code(0), None);
    }
}
