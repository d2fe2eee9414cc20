//! Reduction operators.
//!
//! An [`op`] parameter wraps either a builtin functor from [`ops`] or any
//! `Fn(&T, &T) -> T`. Builtin functors map to the transport's stock operator
//! handles and need no commutativity tag. Other callables are registered as
//! a transient user operator for the duration of one call and must state
//! their commutativity through [`op_with`].
//!
//! The functors are [`Combine`] callables as well, so `op_with(ops::Plus,
//! Commutative)` reduces any element type implementing `Add`. A tagged
//! functor always takes the user-operator path; only [`op`] selects the
//! stock handle.
//!
//! ```
//! use mpiparams::operation::{op, op_with, ops, Commutative, ReductionOperator};
//!
//! let sum = op(ops::Plus);
//! assert_eq!(sum.identity::<i32>(), 0);
//! assert!(<mpiparams::operation::OpParam<ops::Plus> as ReductionOperator<i32>>::COMMUTATIVE);
//!
//! let merge = op_with(|a: &u64, b: &u64| a.max(b).to_owned(), Commutative);
//! # let _ = merge;
//!
//! type TaggedSum = mpiparams::operation::OpParam<ops::Plus, Commutative>;
//! assert_eq!(<TaggedSum as ReductionOperator<i32>>::BUILTIN, None);
//! ```

use crate::datatype::{Complex, MpiDatatype};
use crate::error::{Error, Result};
use crate::roles::{self, Parameter};
use crate::transport::{RawOp, Transport};
use std::marker::PhantomData;
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;

/// Predefined reduction operators.
///
/// These discriminants must stay in sync with the `MPIPARAMS_OP_*` defines in
/// `csrc/mpiparams.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BuiltinOp {
    /// `MPI_SUM`
    Sum = 0,
    /// `MPI_PROD`
    Prod = 1,
    /// `MPI_MIN`
    Min = 2,
    /// `MPI_MAX`
    Max = 3,
    /// `MPI_BAND`
    BitAnd = 4,
    /// `MPI_BOR`
    BitOr = 5,
    /// `MPI_BXOR`
    BitXor = 6,
    /// `MPI_LAND`
    LogicalAnd = 7,
    /// `MPI_LOR`
    LogicalOr = 8,
    /// `MPI_LXOR`
    LogicalXor = 9,
}

impl BuiltinOp {
    /// Every predefined operator, in discriminant order.
    pub const ALL: [BuiltinOp; 10] = [
        BuiltinOp::Sum,
        BuiltinOp::Prod,
        BuiltinOp::Min,
        BuiltinOp::Max,
        BuiltinOp::BitAnd,
        BuiltinOp::BitOr,
        BuiltinOp::BitXor,
        BuiltinOp::LogicalAnd,
        BuiltinOp::LogicalOr,
        BuiltinOp::LogicalXor,
    ];

    /// Look an operator up by its discriminant.
    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

/// Builtin functors, recognized and mapped to the stock operator handles.
pub mod ops {
    macro_rules! functor {
        ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
            $(
                $(#[$doc])*
                #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
                pub struct $name;
            )*
        };
    }

    functor! {
        /// `a + b`
        Plus,
        /// `a * b`
        Multiplies,
        /// The smaller operand
        Min,
        /// The larger operand
        Max,
        /// `a & b`
        BitAnd,
        /// `a | b`
        BitOr,
        /// `a ^ b`
        BitXor,
        /// `a && b`
        LogicalAnd,
        /// `a || b`
        LogicalOr,
        /// `a != b` on booleans
        LogicalXor,
    }
}

/// A builtin functor the transport supports for element type `T`.
///
/// Only implemented where the element type's category admits the operator:
/// arithmetic and ordering on integers and floats, sums and products on
/// complex numbers, bitwise operators on integers, logical ones on `bool`.
#[diagnostic::on_unimplemented(
    message = "`{Self}` is not a builtin reduction on `{T}`",
    note = "use `op_with(|a, b| .., Commutative)` for a user-defined reduction"
)]
pub trait BuiltinReduction<T>: Copy + Default + 'static {
    /// The stock operator.
    const OP: BuiltinOp;

    /// The neutral element: `identity() op x == x op identity() == x`.
    fn identity() -> T;

    /// Apply the operator.
    fn combine(a: T, b: T) -> T;
}

macro_rules! builtin_reduction {
    ($functor:ident, $op:ident, [$($ty:ty),*], $identity:expr, |$a:ident, $b:ident| $body:expr) => {
        $(
            impl BuiltinReduction<$ty> for ops::$functor {
                const OP: BuiltinOp = BuiltinOp::$op;

                fn identity() -> $ty {
                    $identity
                }

                fn combine($a: $ty, $b: $ty) -> $ty {
                    $body
                }
            }
        )*
    };
}

macro_rules! integer_reductions {
    ($($ty:ident),*) => {
        $(
            builtin_reduction!(Plus, Sum, [$ty], 0, |a, b| a.wrapping_add(b));
            builtin_reduction!(Multiplies, Prod, [$ty], 1, |a, b| a.wrapping_mul(b));
            builtin_reduction!(Min, Min, [$ty], $ty::MAX, |a, b| a.min(b));
            builtin_reduction!(Max, Max, [$ty], $ty::MIN, |a, b| a.max(b));
            builtin_reduction!(BitAnd, BitAnd, [$ty], !0, |a, b| a & b);
            builtin_reduction!(BitOr, BitOr, [$ty], 0, |a, b| a | b);
            builtin_reduction!(BitXor, BitXor, [$ty], 0, |a, b| a ^ b);
        )*
    };
}

integer_reductions!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! float_reductions {
    ($($ty:ident),*) => {
        $(
            builtin_reduction!(Plus, Sum, [$ty], 0.0, |a, b| a + b);
            builtin_reduction!(Multiplies, Prod, [$ty], 1.0, |a, b| a * b);
            builtin_reduction!(Min, Min, [$ty], $ty::INFINITY, |a, b| a.min(b));
            builtin_reduction!(Max, Max, [$ty], $ty::NEG_INFINITY, |a, b| a.max(b));
            builtin_reduction!(Plus, Sum, [Complex<$ty>], Complex::new(0.0, 0.0), |a, b| a + b);
            builtin_reduction!(
                Multiplies,
                Prod,
                [Complex<$ty>],
                Complex::new(1.0, 0.0),
                |a, b| a * b
            );
        )*
    };
}

float_reductions!(f32, f64);

builtin_reduction!(LogicalAnd, LogicalAnd, [bool], true, |a, b| a && b);
builtin_reduction!(LogicalOr, LogicalOr, [bool], false, |a, b| a || b);
builtin_reduction!(LogicalXor, LogicalXor, [bool], false, |a, b| a != b);

/// A binary callable a user operator applies elementwise.
///
/// Implemented for every `Fn(&T, &T) -> T` and for the [`ops`] functors over
/// element types with the matching `std::ops` or ordering trait.
pub trait Combine<T> {
    /// `a op b`, with `a` from the incoming buffer.
    fn combine(&self, a: &T, b: &T) -> T;
}

impl<T, F: Fn(&T, &T) -> T> Combine<T> for F {
    fn combine(&self, a: &T, b: &T) -> T {
        self(a, b)
    }
}

macro_rules! functor_combine {
    ($($functor:ident: $bound:path => |$a:ident, $b:ident| $body:expr;)*) => {
        $(
            impl<T: Copy + $bound> Combine<T> for ops::$functor {
                fn combine(&self, $a: &T, $b: &T) -> T {
                    $body
                }
            }
        )*
    };
}

functor_combine! {
    Plus: std::ops::Add<Output = T> => |a, b| *a + *b;
    Multiplies: std::ops::Mul<Output = T> => |a, b| *a * *b;
    Min: PartialOrd => |a, b| if b < a { *b } else { *a };
    Max: PartialOrd => |a, b| if b > a { *b } else { *a };
    BitAnd: std::ops::BitAnd<Output = T> => |a, b| *a & *b;
    BitOr: std::ops::BitOr<Output = T> => |a, b| *a | *b;
    BitXor: std::ops::BitXor<Output = T> => |a, b| *a ^ *b;
}

impl Combine<bool> for ops::LogicalAnd {
    fn combine(&self, a: &bool, b: &bool) -> bool {
        *a && *b
    }
}

impl Combine<bool> for ops::LogicalOr {
    fn combine(&self, a: &bool, b: &bool) -> bool {
        *a || *b
    }
}

impl Combine<bool> for ops::LogicalXor {
    fn combine(&self, a: &bool, b: &bool) -> bool {
        a != b
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Commutativity tag of a reduction operator.
pub trait Commutativity: sealed::Sealed + Copy + Default + 'static {
    /// `Some` for user operators, `None` for builtins.
    const COMMUTATIVE: Option<bool>;
}

/// The operator may combine operands in any order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Commutative;

/// The operator must combine operands in rank order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonCommutative;

/// No tag; selects the stock operator for builtin functors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Undefined;

impl sealed::Sealed for Commutative {}
impl sealed::Sealed for NonCommutative {}
impl sealed::Sealed for Undefined {}

impl Commutativity for Commutative {
    const COMMUTATIVE: Option<bool> = Some(true);
}

impl Commutativity for NonCommutative {
    const COMMUTATIVE: Option<bool> = Some(false);
}

impl Commutativity for Undefined {
    const COMMUTATIVE: Option<bool> = None;
}

/// The `op` parameter.
#[derive(Debug, Clone, Copy)]
pub struct OpParam<F, C = Undefined> {
    func: F,
    _commutativity: PhantomData<C>,
}

impl<F, C> Parameter for OpParam<F, C> {
    type Role = roles::Op;
}

impl<F: Copy + Default + 'static> OpParam<F, Undefined> {
    /// Neutral element of a builtin functor for `T`.
    pub fn identity<T>(&self) -> T
    where
        F: BuiltinReduction<T>,
    {
        F::identity()
    }
}

/// A builtin functor as the `op` parameter.
pub fn op<F>(func: F) -> OpParam<F, Undefined> {
    op_with(func, Undefined)
}

/// A reduction operator with an explicit commutativity tag.
pub fn op_with<F, C: Commutativity>(func: F, _commutativity: C) -> OpParam<F, C> {
    OpParam {
        func,
        _commutativity: PhantomData,
    }
}

/// An operator parameter usable to reduce values of type `T`.
#[diagnostic::on_unimplemented(
    message = "`{Self}` cannot reduce values of type `{T}`",
    note = "builtin functors select the stock operator without a tag: `op(ops::Plus)`",
    note = "closures need an explicit tag: `op_with(|a, b| .., Commutative)` or `op_with(.., NonCommutative)`"
)]
pub trait ReductionOperator<T: MpiDatatype> {
    /// Whether operands may be reordered. Builtins count as commutative.
    const COMMUTATIVE: bool;

    /// The stock operator, for builtin functors.
    const BUILTIN: Option<crate::operation::BuiltinOp>;

    /// Obtain a handle valid until the returned guard is dropped.
    fn acquire<'a>(&'a self, transport: &'a dyn Transport) -> Result<ScopedOp<'a>>;

    /// Neutral element, where one is known.
    fn identity(&self) -> Option<T> {
        None
    }
}

impl<T, F> ReductionOperator<T> for OpParam<F, Undefined>
where
    T: MpiDatatype,
    F: BuiltinReduction<T>,
{
    const COMMUTATIVE: bool = true;
    const BUILTIN: Option<BuiltinOp> = Some(F::OP);

    fn acquire<'a>(&'a self, transport: &'a dyn Transport) -> Result<ScopedOp<'a>> {
        Ok(ScopedOp {
            raw: transport.builtin_op(F::OP),
            owner: None,
        })
    }

    fn identity(&self) -> Option<T> {
        Some(F::identity())
    }
}

macro_rules! user_reduction {
    ($tag:ty, $commute:expr) => {
        impl<T, F> ReductionOperator<T> for OpParam<F, $tag>
        where
            T: MpiDatatype,
            F: Combine<T>,
        {
            const COMMUTATIVE: bool = $commute;
            const BUILTIN: Option<BuiltinOp> = None;

            fn acquire<'a>(&'a self, transport: &'a dyn Transport) -> Result<ScopedOp<'a>> {
                create_user_op::<T, F>(&self.func, $commute, transport)
            }
        }
    };
}

user_reduction!(Commutative, true);
user_reduction!(NonCommutative, false);

fn create_user_op<'a, T, F>(
    func: &'a F,
    commute: bool,
    transport: &'a dyn Transport,
) -> Result<ScopedOp<'a>>
where
    T: MpiDatatype,
    F: Combine<T>,
{
    // Captureless callables are rebuilt from their type inside the trampoline.
    let ctx = if std::mem::size_of::<F>() == 0 {
        std::ptr::null_mut()
    } else {
        (func as *const F).cast_mut().cast::<c_void>()
    };
    let raw = transport
        .op_create(reduce_trampoline::<T, F>, ctx, commute)
        .map_err(|err| Error::OperatorConstruction(err.to_string()))?;
    tracing::debug!(
        handle = raw.0,
        ty = std::any::type_name::<T>(),
        commute,
        "created user operator"
    );
    Ok(ScopedOp {
        raw,
        owner: Some(transport),
    })
}

/// C-ABI entry point of a user operator: `inout[i] = f(in[i], inout[i])`.
///
/// # Safety
///
/// `invec` and `inoutvec` must hold `len` values of `T`, possibly unaligned.
/// `ctx` must point to a live `F`, or be anything if `F` is zero-sized.
unsafe extern "C" fn reduce_trampoline<T, F>(
    invec: *const c_void,
    inoutvec: *mut c_void,
    len: c_int,
    ctx: *mut c_void,
) where
    T: MpiDatatype,
    F: Combine<T>,
{
    let func: &F = if std::mem::size_of::<F>() == 0 {
        NonNull::<F>::dangling().as_ref()
    } else {
        &*ctx.cast_const().cast::<F>()
    };
    let input = invec.cast::<T>();
    let inout = inoutvec.cast::<T>();
    for i in 0..usize::try_from(len).unwrap_or(0) {
        let a = input.add(i).read_unaligned();
        let b = inout.add(i).read_unaligned();
        inout.add(i).write_unaligned(func.combine(&a, &b));
    }
}

/// An operator handle scoped to one call. User operators are freed on drop.
#[derive(Debug)]
pub struct ScopedOp<'a> {
    raw: RawOp,
    owner: Option<&'a dyn Transport>,
}

impl ScopedOp<'_> {
    /// The handle to pass to the transport.
    pub fn raw(&self) -> RawOp {
        self.raw
    }

    /// True if this is a stock operator.
    pub fn is_builtin(&self) -> bool {
        self.owner.is_none()
    }
}

impl Drop for ScopedOp<'_> {
    fn drop(&mut self) {
        if let Some(transport) = self.owner.take() {
            match transport.op_free(self.raw) {
                Ok(()) => tracing::debug!(handle = self.raw.0, "released user operator"),
                Err(err) => {
                    tracing::warn!(handle = self.raw.0, %err, "failed to release user operator");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;

    fn commutative<T: MpiDatatype, O: ReductionOperator<T>>(_: &O) -> bool {
        O::COMMUTATIVE
    }

    #[test]
    fn builtin_values_match_c_defines() {
        for (i, op) in BuiltinOp::ALL.iter().enumerate() {
            assert_eq!(*op as i32, i as i32);
            assert_eq!(BuiltinOp::from_raw(i as i32), Some(*op));
        }
        assert_eq!(BuiltinOp::from_raw(10), None);
    }

    #[test]
    fn identities() {
        assert_eq!(op(ops::Plus).identity::<i64>(), 0);
        assert_eq!(op(ops::Multiplies).identity::<u8>(), 1);
        assert_eq!(op(ops::Min).identity::<i16>(), i16::MAX);
        assert_eq!(op(ops::Max).identity::<u32>(), 0);
        assert_eq!(op(ops::Min).identity::<f32>(), f32::INFINITY);
        assert_eq!(op(ops::BitAnd).identity::<u16>(), u16::MAX);
        assert_eq!(op(ops::BitAnd).identity::<i8>(), -1);
        assert!(op(ops::LogicalAnd).identity::<bool>());
        assert_eq!(
            op(ops::Multiplies).identity::<Complex<f64>>(),
            Complex::new(1.0, 0.0)
        );
    }

    #[test]
    fn builtin_functors_use_stock_handles() {
        let transport = LocalTransport::single();
        let sum = op(ops::Plus);
        let scoped = ReductionOperator::<f64>::acquire(&sum, &transport).unwrap();
        assert!(scoped.is_builtin());
        assert_eq!(scoped.raw(), transport.builtin_op(BuiltinOp::Sum));
        assert_eq!(
            <OpParam<ops::Max> as ReductionOperator<i32>>::BUILTIN,
            Some(BuiltinOp::Max)
        );
    }

    #[test]
    fn user_operator_is_released_on_drop() {
        let transport = LocalTransport::single();
        let merge = op_with(|a: &i32, b: &i32| a * 10 + b, NonCommutative);
        assert!(!commutative::<i32, _>(&merge));
        let raw = {
            let scoped = ReductionOperator::<i32>::acquire(&merge, &transport).unwrap();
            assert!(!scoped.is_builtin());
            scoped.raw()
        };
        assert!(transport.op_free(raw).is_err(), "handle was already freed");
    }

    fn run_trampoline<F: Combine<i32>>(func: &F, input: &[i32], inout: &mut [i32]) {
        let ctx = if std::mem::size_of::<F>() == 0 {
            std::ptr::null_mut()
        } else {
            (func as *const F).cast_mut().cast::<c_void>()
        };
        unsafe {
            reduce_trampoline::<i32, F>(
                input.as_ptr().cast(),
                inout.as_mut_ptr().cast(),
                input.len() as c_int,
                ctx,
            );
        }
    }

    #[test]
    fn trampoline_applies_stateless_and_capturing_callables() {
        let input = [10i32, 20, 30];

        let mut inout = [1i32, 2, 3];
        run_trampoline(&|a: &i32, b: &i32| a - b, &input, &mut inout);
        assert_eq!(inout, [9, 18, 27]);

        let offset = 100;
        run_trampoline(&move |a: &i32, b: &i32| a + b + offset, &input, &mut inout);
        assert_eq!(inout, [119, 138, 157]);
    }

    #[test]
    fn tagged_functors_register_a_user_operator() {
        let transport = LocalTransport::single();
        let sum = op_with(ops::Plus, Commutative);
        assert!(commutative::<i32, _>(&sum));
        assert_eq!(<OpParam<ops::Plus, Commutative> as ReductionOperator<i32>>::BUILTIN, None);
        let scoped = ReductionOperator::<i32>::acquire(&sum, &transport).unwrap();
        assert!(!scoped.is_builtin());

        let input = [4i32, -2, 7];
        let mut inout = [1i32, 5, 7];
        run_trampoline(&ops::Max, &input, &mut inout);
        assert_eq!(inout, [4, 5, 7]);
        run_trampoline(&ops::BitXor, &input, &mut inout);
        assert_eq!(inout, [0, -2 ^ 5, 0]);
        assert!(ops::LogicalXor.combine(&true, &false));
    }

    #[test]
    fn trampoline_tolerates_unaligned_buffers() {
        fn call<F: Fn(&i64, &i64) -> i64>(_: F, input: &[u8], inout: &mut [u8]) {
            unsafe {
                reduce_trampoline::<i64, F>(
                    input.as_ptr().cast(),
                    inout.as_mut_ptr().cast(),
                    2,
                    std::ptr::null_mut(),
                );
            }
        }

        let mut input = vec![0u8; 1 + 2 * 8];
        let mut inout = vec![0u8; 1 + 2 * 8];
        for (i, v) in [3i64, 4].iter().enumerate() {
            input[1 + i * 8..9 + i * 8].copy_from_slice(&v.to_ne_bytes());
            inout[1 + i * 8..9 + i * 8].copy_from_slice(&(v * 10).to_ne_bytes());
        }
        call(|a: &i64, b: &i64| a * b, &input[1..], &mut inout[1..]);
        let second = i64::from_ne_bytes(inout[9..17].try_into().unwrap());
        assert_eq!(second, 160);
    }
}
