//! Shared element-wise reduction primitives used by the typed allreduce
//! entry point.

use crate::types::{DataType, ReduceOp};

/// Trait for types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Element-wise reduce on byte slices interpreted as `dtype` elements:
/// `dst[i] = op(dst[i], src[i])`.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()`
/// bytes.
pub(crate) fn reduce_slice(dst: &mut [u8], src: &[u8], count: usize, dtype: DataType, op: ReduceOp) {
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
    }
}

/// Read/write a value from a little-endian byte slice (alignment-safe).
trait LeBytes: Sized {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes.try_into().expect("slice length matches type size"),
                    )
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

fn reduce_slice_typed<T: Reducible + LeBytes>(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    op: ReduceOp,
) {
    let elem = std::mem::size_of::<T>();
    assert_eq!(dst.len(), count * elem, "dst length mismatch");
    assert_eq!(src.len(), count * elem, "src length mismatch");
    for i in 0..count {
        let off = i * elem;
        let a = T::read_le(&dst[off..off + elem]);
        let b = T::read_le(&src[off..off + elem]);
        T::reduce(a, b, op).write_le(&mut dst[off..off + elem]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_bytes_i32(v: &[i32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn from_bytes_i32(b: &[u8]) -> Vec<i32> {
        b.chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_sum_i32() {
        let mut dst = to_bytes_i32(&[1, 2, 3]);
        let src = to_bytes_i32(&[10, 20, 30]);
        reduce_slice(&mut dst, &src, 3, DataType::I32, ReduceOp::Sum);
        assert_eq!(from_bytes_i32(&dst), vec![11, 22, 33]);
    }

    #[test]
    fn test_min_max_i32() {
        let mut dst = to_bytes_i32(&[5, -2, 7]);
        let src = to_bytes_i32(&[3, 4, 9]);
        reduce_slice(&mut dst, &src, 3, DataType::I32, ReduceOp::Min);
        assert_eq!(from_bytes_i32(&dst), vec![3, -2, 7]);

        let mut dst = to_bytes_i32(&[5, -2, 7]);
        reduce_slice(&mut dst, &src, 3, DataType::I32, ReduceOp::Max);
        assert_eq!(from_bytes_i32(&dst), vec![5, 4, 9]);
    }

    #[test]
    fn test_sum_f64() {
        let mut dst: Vec<u8> = [1.5f64, 2.5]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect();
        let src: Vec<u8> = [0.5f64, 0.25]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect();
        reduce_slice(&mut dst, &src, 2, DataType::F64, ReduceOp::Sum);
        let out: Vec<f64> = dst
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![2.0, 2.75]);
    }

    #[test]
    fn test_prod_u8_wraps() {
        let mut dst = vec![200u8];
        let src = vec![2u8];
        reduce_slice(&mut dst, &src, 1, DataType::U8, ReduceOp::Prod);
        assert_eq!(dst[0], 144); // 400 mod 256
    }
}
