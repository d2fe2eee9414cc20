//! Element-wise application of reduction operators on raw bytes.

use crate::datatype::BuiltinType;
use crate::error::{Error, MpiErrorClass, Result};
use crate::operation::BuiltinOp;
use crate::transport::UserFunction;
use std::os::raw::{c_int, c_void};

/// A reduction operator as the local transport stores it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LocalOp {
    Builtin(BuiltinOp),
    User { func: UserFunction, ctx: *mut c_void },
}

/// `inout[i] = invec[i] op inout[i]` over `count` elements.
///
/// `builtin` is the predefined type behind the datatype, if any; builtin
/// operators require one.
pub(crate) fn apply(
    op: LocalOp,
    builtin: Option<BuiltinType>,
    count: usize,
    invec: &[u8],
    inout: &mut [u8],
) -> Result<()> {
    match op {
        LocalOp::Builtin(op) => {
            let ty = builtin.ok_or_else(|| {
                op_error(format!("operator {op:?} requires a predefined datatype"))
            })?;
            apply_builtin(op, ty, invec, inout)
        }
        LocalOp::User { func, ctx } => {
            let len = c_int::try_from(count)
                .map_err(|_| op_error(format!("{count} elements exceed the C int range")))?;
            // SAFETY: both buffers hold `count` elements of the operator's
            // datatype; the callback reads them unaligned.
            unsafe {
                func(
                    invec.as_ptr().cast::<c_void>(),
                    inout.as_mut_ptr().cast::<c_void>(),
                    len,
                    ctx,
                );
            }
            Ok(())
        }
    }
}

fn op_error(message: String) -> Error {
    Error::transport(MpiErrorClass::Op.as_raw(), MpiErrorClass::Op, message)
}

macro_rules! combine {
    ($ty:ty, $invec:expr, $inout:expr, |$a:ident, $b:ident| $body:expr) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        for (src, dst) in $invec.chunks_exact(WIDTH).zip($inout.chunks_exact_mut(WIDTH)) {
            let mut raw = [0u8; WIDTH];
            raw.copy_from_slice(src);
            let $a = <$ty>::from_ne_bytes(raw);
            raw.copy_from_slice(dst);
            let $b = <$ty>::from_ne_bytes(raw);
            let out: $ty = $body;
            dst.copy_from_slice(&out.to_ne_bytes());
        }
        Ok(())
    }};
}

macro_rules! integer_op {
    ($ty:ty, $op:expr, $invec:expr, $inout:expr) => {
        match $op {
            BuiltinOp::Sum => combine!($ty, $invec, $inout, |a, b| a.wrapping_add(b)),
            BuiltinOp::Prod => combine!($ty, $invec, $inout, |a, b| a.wrapping_mul(b)),
            BuiltinOp::Min => combine!($ty, $invec, $inout, |a, b| a.min(b)),
            BuiltinOp::Max => combine!($ty, $invec, $inout, |a, b| a.max(b)),
            BuiltinOp::BitAnd => combine!($ty, $invec, $inout, |a, b| a & b),
            BuiltinOp::BitOr => combine!($ty, $invec, $inout, |a, b| a | b),
            BuiltinOp::BitXor => combine!($ty, $invec, $inout, |a, b| a ^ b),
            other => Err(unsupported(other, stringify!($ty))),
        }
    };
}

macro_rules! float_op {
    ($ty:ty, $op:expr, $invec:expr, $inout:expr) => {
        match $op {
            BuiltinOp::Sum => combine!($ty, $invec, $inout, |a, b| a + b),
            BuiltinOp::Prod => combine!($ty, $invec, $inout, |a, b| a * b),
            BuiltinOp::Min => combine!($ty, $invec, $inout, |a, b| a.min(b)),
            BuiltinOp::Max => combine!($ty, $invec, $inout, |a, b| a.max(b)),
            other => Err(unsupported(other, stringify!($ty))),
        }
    };
}

macro_rules! complex_op {
    ($ty:ty, $op:expr, $invec:expr, $inout:expr) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        let read = |bytes: &[u8]| {
            let mut raw = [0u8; WIDTH];
            raw.copy_from_slice(&bytes[..WIDTH]);
            let re = <$ty>::from_ne_bytes(raw);
            raw.copy_from_slice(&bytes[WIDTH..]);
            (re, <$ty>::from_ne_bytes(raw))
        };
        let combine = |(ar, ai): ($ty, $ty), (br, bi): ($ty, $ty)| match $op {
            BuiltinOp::Sum => Some((ar + br, ai + bi)),
            BuiltinOp::Prod => Some((ar * br - ai * bi, ar * bi + ai * br)),
            _ => None,
        };
        for (src, dst) in $invec
            .chunks_exact(2 * WIDTH)
            .zip($inout.chunks_exact_mut(2 * WIDTH))
        {
            let (re, im) =
                combine(read(src), read(dst)).ok_or_else(|| unsupported($op, "complex"))?;
            dst[..WIDTH].copy_from_slice(&re.to_ne_bytes());
            dst[WIDTH..].copy_from_slice(&im.to_ne_bytes());
        }
        Ok(())
    }};
}

fn apply_builtin(op: BuiltinOp, ty: BuiltinType, invec: &[u8], inout: &mut [u8]) -> Result<()> {
    match ty {
        BuiltinType::I8 => integer_op!(i8, op, invec, inout),
        BuiltinType::I16 => integer_op!(i16, op, invec, inout),
        BuiltinType::I32 => integer_op!(i32, op, invec, inout),
        BuiltinType::I64 => integer_op!(i64, op, invec, inout),
        BuiltinType::U8 => integer_op!(u8, op, invec, inout),
        BuiltinType::U16 => integer_op!(u16, op, invec, inout),
        BuiltinType::U32 => integer_op!(u32, op, invec, inout),
        BuiltinType::U64 => integer_op!(u64, op, invec, inout),
        BuiltinType::F32 => float_op!(f32, op, invec, inout),
        BuiltinType::F64 => float_op!(f64, op, invec, inout),
        BuiltinType::ComplexF32 => complex_op!(f32, op, invec, inout),
        BuiltinType::ComplexF64 => complex_op!(f64, op, invec, inout),
        BuiltinType::Bool => {
            for (a, b) in invec.iter().zip(inout.iter_mut()) {
                let (a, bv) = (*a != 0, *b != 0);
                let out = match op {
                    BuiltinOp::LogicalAnd => a && bv,
                    BuiltinOp::LogicalOr => a || bv,
                    BuiltinOp::LogicalXor => a != bv,
                    other => return Err(unsupported(other, "bool")),
                };
                *b = u8::from(out);
            }
            Ok(())
        }
        BuiltinType::Byte => match op {
            BuiltinOp::BitAnd => combine!(u8, invec, inout, |a, b| a & b),
            BuiltinOp::BitOr => combine!(u8, invec, inout, |a, b| a | b),
            BuiltinOp::BitXor => combine!(u8, invec, inout, |a, b| a ^ b),
            other => Err(unsupported(other, "byte")),
        },
        BuiltinType::Char => Err(unsupported(op, "char")),
    }
}

fn unsupported(op: BuiltinOp, ty: &str) -> Error {
    op_error(format!("operator {op:?} is not defined for {ty}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of<T: Copy>(values: &[T]) -> Vec<u8> {
        let len = std::mem::size_of_val(values);
        // SAFETY: plain-old-data test values
        unsafe { std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), len).to_vec() }
    }

    fn values_of<T: Copy + Default>(bytes: &[u8]) -> Vec<T> {
        let n = bytes.len() / std::mem::size_of::<T>();
        let mut out = vec![T::default(); n];
        // SAFETY: sizes checked above
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), out.as_mut_ptr().cast::<u8>(), bytes.len());
        }
        out
    }

    #[test]
    fn integer_sum_and_max() {
        let a = bytes_of(&[1i32, 5, -3]);
        let mut b = bytes_of(&[10i32, 2, -7]);
        apply(LocalOp::Builtin(BuiltinOp::Sum), Some(BuiltinType::I32), 3, &a, &mut b).unwrap();
        assert_eq!(values_of::<i32>(&b), vec![11, 7, -10]);

        let mut c = bytes_of(&[10i32, 2, -7]);
        apply(LocalOp::Builtin(BuiltinOp::Max), Some(BuiltinType::I32), 3, &a, &mut c).unwrap();
        assert_eq!(values_of::<i32>(&c), vec![10, 5, -3]);
    }

    #[test]
    fn float_product() {
        let a = bytes_of(&[1.5f64, -2.0]);
        let mut b = bytes_of(&[2.0f64, 4.0]);
        apply(LocalOp::Builtin(BuiltinOp::Prod), Some(BuiltinType::F64), 2, &a, &mut b).unwrap();
        assert_eq!(values_of::<f64>(&b), vec![3.0, -8.0]);
    }

    #[test]
    fn logical_xor_on_bools() {
        let a = vec![1u8, 1, 0, 0];
        let mut b = vec![1u8, 0, 1, 0];
        apply(LocalOp::Builtin(BuiltinOp::LogicalXor), Some(BuiltinType::Bool), 4, &a, &mut b)
            .unwrap();
        assert_eq!(b, vec![0, 1, 1, 0]);
    }

    #[test]
    fn complex_product() {
        let a = bytes_of(&[1.0f32, 2.0]);
        let mut b = bytes_of(&[3.0f32, -1.0]);
        apply(LocalOp::Builtin(BuiltinOp::Prod), Some(BuiltinType::ComplexF32), 1, &a, &mut b)
            .unwrap();
        assert_eq!(values_of::<f32>(&b), vec![5.0, 5.0]);
    }

    #[test]
    fn bitwise_on_floats_is_rejected() {
        let a = bytes_of(&[1.0f32]);
        let mut b = bytes_of(&[1.0f32]);
        let err = apply(LocalOp::Builtin(BuiltinOp::BitAnd), Some(BuiltinType::F32), 1, &a, &mut b)
            .unwrap_err();
        assert_eq!(err.class(), Some(MpiErrorClass::Op));
    }

    #[test]
    fn builtin_on_derived_type_is_rejected() {
        let a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        assert!(apply(LocalOp::Builtin(BuiltinOp::Sum), None, 1, &a, &mut b).is_err());
    }
}
