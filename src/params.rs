//! Named-parameter factories.
//!
//! Each factory builds the argument of one role. What the argument is made
//! from decides the buffer's properties:
//!
//! | Argument | Storage | Default policy |
//! |----------|---------|----------------|
//! | `&container` | [`Ref`], read-only | |
//! | `&mut container` | [`RefMut`], writable | `NoResize` |
//! | `container` (moved in) | [`Owned`] by the caller, returned in the result | `NoResize` |
//! | `&x` / `&mut x` / `x` for a scalar | [`SingleRef`] / [`SingleMut`] / [`SingleOwned`] | `NoResize` |
//! | [`alloc_new`], [`alloc_container_of`] | [`Owned`] by the library, extractable | `ResizeToFit` |
//! | [`ignore`] | [`Empty`] | |
//!
//! Containers are `Vec<T>`, slices, arrays and boxed slices. Scalars are the
//! predefined element types and every type registered with
//! [`impl_contiguous_datatype!`](crate::impl_contiguous_datatype) or
//! [`impl_struct_datatype!`](crate::impl_struct_datatype).
//!
//! ```
//! use mpiparams::local;
//! use mpiparams::params::{alloc_new, recv_buf, root, send_recv_buf};
//!
//! local::run(3, |mpi| {
//!     let world = mpi.world();
//!     let mut value = if world.rank() == 0 { 42 } else { 0 };
//!     world.bcast((send_recv_buf(&mut value), root(0))).unwrap();
//!     assert_eq!(value, 42);
//!     let _ = recv_buf(alloc_new::<Vec<f32>>());
//! });
//! ```

use crate::buffer::{
    Caller, Container, ContainerMut, DataBuffer, Empty, In, InOut, Library, NoResize, Out, Owned,
    Ref, RefMut, ResizableContainer, ResizeToFit, SingleMut, SingleOwned, Storage, StorageMut,
};
use crate::request::PooledRequest;
use crate::roles::{self, Parameter, Role};
use crate::status::Status;
use crate::transport::{RawDatatype, SendMode};
use std::marker::PhantomData;

pub use crate::operation::{op, op_with, ops, Commutative, NonCommutative};

#[cfg(feature = "serialization")]
pub use crate::serialization::{
    as_deserializable, as_deserializable_with, as_serialized, as_serialized_with,
};

/// Anything a buffer factory accepts.
#[diagnostic::on_unimplemented(
    message = "`{Self}` cannot be used as a buffer",
    note = "pass a container (`Vec<T>`, slice, array, boxed slice), a registered scalar, `alloc_new::<C>()` or `ignore::<T>()`, by reference or by value"
)]
pub trait IntoStorage {
    /// The storage it becomes.
    type Storage: Storage;

    /// Convert.
    fn into_storage(self) -> Self::Storage;
}

impl<'a, C: Container + ?Sized> IntoStorage for &'a C {
    type Storage = Ref<'a, C>;

    fn into_storage(self) -> Ref<'a, C> {
        Ref(self)
    }
}

impl<'a, C: ContainerMut + ?Sized> IntoStorage for &'a mut C {
    type Storage = RefMut<'a, C>;

    fn into_storage(self) -> RefMut<'a, C> {
        RefMut(self)
    }
}

macro_rules! owned_containers {
    ($(impl<$($g:ident),* $(; const $n:ident: usize)?> for $ty:ty;)*) => {
        $(
            impl<$($g: Copy + 'static,)* $(const $n: usize)?> IntoStorage for $ty {
                type Storage = Owned<$ty, Caller>;

                fn into_storage(self) -> Self::Storage {
                    Owned::new(self)
                }
            }
        )*
    };
}

owned_containers! {
    impl<T> for Vec<T>;
    impl<T; const N: usize> for [T; N];
    impl<T> for Box<[T]>;
}

/// Request a container the library allocates and sizes.
///
/// The resulting buffer defaults to `ResizeToFit` and is the only kind whose
/// storage can be [`extract`](DataBuffer::extract)ed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocNew<C>(PhantomData<C>);

/// A library-allocated container of type `C`.
pub fn alloc_new<C: ResizableContainer>() -> AllocNew<C> {
    AllocNew(PhantomData)
}

/// A library-allocated `Vec<T>`.
pub fn alloc_container_of<T: Copy + Default + 'static>() -> AllocNew<Vec<T>> {
    AllocNew(PhantomData)
}

/// A container type constructor, applied to an element type by
/// [`alloc_new_using`].
pub trait ContainerFamily {
    /// The container holding `T`.
    type Of<T: Copy + Default + 'static>: ResizableContainer<Elem = T>;
}

/// `Vec<_>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VecFamily;

impl ContainerFamily for VecFamily {
    type Of<T: Copy + Default + 'static> = Vec<T>;
}

/// A library-allocated container from family `F`. The element type may be
/// left to inference: `alloc_new_using::<VecFamily, _>()`.
pub fn alloc_new_using<F: ContainerFamily, T: Copy + Default + 'static>() -> AllocNew<F::Of<T>> {
    AllocNew(PhantomData)
}

impl<C: ResizableContainer> IntoStorage for AllocNew<C> {
    type Storage = Owned<C, Library>;

    fn into_storage(self) -> Owned<C, Library> {
        Owned::new(C::default())
    }
}

/// Placeholder for a buffer this rank does not provide.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignore<T>(PhantomData<T>);

/// An empty input of element type `T`, e.g. the send buffer of a scatter on
/// a non-root rank.
pub fn ignore<T: Copy + 'static>() -> Ignore<T> {
    Ignore(PhantomData)
}

impl<T: Copy + 'static> IntoStorage for Ignore<T> {
    type Storage = Empty<T>;

    fn into_storage(self) -> Empty<T> {
        Empty::new()
    }
}

#[doc(hidden)]
pub mod __private {
    use crate::buffer::{Caller, SingleMut, SingleOwned, SingleRef};

    pub fn single_owned<T>(value: T) -> SingleOwned<T, Caller> {
        SingleOwned::new(value)
    }

    pub fn single_ref<T>(value: &T) -> SingleRef<'_, T> {
        SingleRef(value)
    }

    pub fn single_mut<T>(value: &mut T) -> SingleMut<'_, T> {
        SingleMut(value)
    }
}

/// Lets a scalar type be passed to the buffer factories as a single element.
///
/// Invoked by the datatype registration macros; rarely needed directly.
#[macro_export]
macro_rules! impl_scalar_parameters {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::params::IntoStorage for $ty {
                type Storage = $crate::buffer::SingleOwned<$ty, $crate::buffer::Caller>;

                fn into_storage(self) -> Self::Storage {
                    $crate::params::__private::single_owned(self)
                }
            }

            impl<'a> $crate::params::IntoStorage for &'a $ty {
                type Storage = $crate::buffer::SingleRef<'a, $ty>;

                fn into_storage(self) -> Self::Storage {
                    $crate::params::__private::single_ref(self)
                }
            }

            impl<'a> $crate::params::IntoStorage for &'a mut $ty {
                type Storage = $crate::buffer::SingleMut<'a, $ty>;

                fn into_storage(self) -> Self::Storage {
                    $crate::params::__private::single_mut(self)
                }
            }
        )*
    };
}

impl_scalar_parameters!(
    i8,
    i16,
    i32,
    i64,
    isize,
    u8,
    u16,
    u32,
    u64,
    usize,
    f32,
    f64,
    bool,
    char,
    crate::datatype::Complex<f32>,
    crate::datatype::Complex<f64>,
);

type DefaultPolicyOf<X> = <<X as IntoStorage>::Storage as Storage>::DefaultPolicy;

// ============================================================================
// Buffers
// ============================================================================

/// The data this rank sends.
pub fn send_buf<X: IntoStorage>(data: X) -> DataBuffer<roles::SendBuf, In, X::Storage, NoResize> {
    DataBuffer::new(data.into_storage())
}

/// Where this rank receives.
///
/// Caller storage is never resized unless a growing policy is selected with
/// [`grow_only`](DataBuffer::grow_only) or
/// [`resize_to_fit`](DataBuffer::resize_to_fit).
pub fn recv_buf<X>(data: X) -> DataBuffer<roles::RecvBuf, Out, X::Storage, DefaultPolicyOf<X>>
where
    X: IntoStorage,
    X::Storage: StorageMut,
{
    DataBuffer::new(data.into_storage())
}

/// Data that is both sent and overwritten, e.g. by a broadcast.
pub fn send_recv_buf<X>(data: X) -> DataBuffer<roles::SendRecvBuf, InOut, X::Storage, DefaultPolicyOf<X>>
where
    X: IntoStorage,
    X::Storage: StorageMut,
{
    DataBuffer::new(data.into_storage())
}

/// The result `exscan` reports on rank 0.
pub fn values_on_rank_0<X: IntoStorage>(
    values: X,
) -> DataBuffer<roles::ValuesOnRank0, In, X::Storage, NoResize> {
    DataBuffer::new(values.into_storage())
}

// ============================================================================
// Counts and displacements
// ============================================================================

/// Output counts the library allocates.
pub type CountsOut<R> = DataBuffer<R, Out, Owned<Vec<i32>, Library>, ResizeToFit>;

/// A single output count the library allocates.
pub type CountOut<R> = DataBuffer<R, Out, SingleOwned<i32, Library>, NoResize>;

macro_rules! vector_factories {
    ($($role:ident => $input:ident $(, $output:ident, $output_into:ident)?;)*) => {
        $(
            #[doc = concat!("Given `", stringify!($input), "`, one entry per rank.")]
            pub fn $input<X>(values: X) -> DataBuffer<roles::$role, In, X::Storage, NoResize>
            where
                X: IntoStorage,
                X::Storage: Storage<Elem = i32>,
            {
                DataBuffer::new(values.into_storage())
            }

            $(
                #[doc = concat!("Ask for the `", stringify!($input), "` the operation computes.")]
                pub fn $output() -> CountsOut<roles::$role> {
                    DataBuffer::new(Owned::new(Vec::new()))
                }

                #[doc = concat!("Write the computed `", stringify!($input), "` into caller storage.")]
                pub fn $output_into<X>(
                    values: X,
                ) -> DataBuffer<roles::$role, Out, X::Storage, DefaultPolicyOf<X>>
                where
                    X: IntoStorage,
                    X::Storage: StorageMut<Elem = i32>,
                {
                    DataBuffer::new(values.into_storage())
                }
            )?
        )*
    };
}

vector_factories! {
    SendCounts => send_counts;
    RecvCounts => recv_counts, recv_counts_out, recv_counts_out_into;
    SendDispls => send_displs, send_displs_out, send_displs_out_into;
    RecvDispls => recv_displs, recv_displs_out, recv_displs_out_into;
}

macro_rules! count_factories {
    ($($role:ident => $input:ident, $output:ident, $output_into:ident;)*) => {
        $(
            #[doc = concat!("Given `", stringify!($input), "`.")]
            pub fn $input(count: i32) -> DataBuffer<roles::$role, In, SingleOwned<i32, Caller>, NoResize> {
                DataBuffer::new(SingleOwned::new(count))
            }

            #[doc = concat!("Ask for the `", stringify!($input), "` the operation used.")]
            pub fn $output() -> CountOut<roles::$role> {
                DataBuffer::new(SingleOwned::new(0))
            }

            #[doc = concat!("Write the `", stringify!($input), "` the operation used into `count`.")]
            pub fn $output_into(count: &mut i32) -> DataBuffer<roles::$role, Out, SingleMut<'_, i32>, NoResize> {
                DataBuffer::new(SingleMut(count))
            }
        )*
    };
}

count_factories! {
    RecvCount => recv_count, recv_count_out, recv_count_out_into;
    SendRecvCount => send_recv_count, send_recv_count_out, send_recv_count_out_into;
}

// ============================================================================
// Scalars
// ============================================================================

/// A rank, or one of the special ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    /// A rank of the communicator
    Value(i32),
    /// Any source (`MPI_ANY_SOURCE`); receives and probes only
    Any,
    /// No process (`MPI_PROC_NULL`); the transfer completes immediately
    Null,
}

impl From<i32> for Rank {
    fn from(rank: i32) -> Self {
        Rank::Value(rank)
    }
}

/// A message tag, or the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// A tag in `0..=tag_upper_bound`
    Value(i32),
    /// Any tag (`MPI_ANY_TAG`); receives and probes only
    Any,
}

impl From<i32> for Tag {
    fn from(tag: i32) -> Self {
        Tag::Value(tag)
    }
}

/// The `root` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootParam(pub(crate) i32);

impl Parameter for RootParam {
    type Role = roles::Root;
}

/// The `tag` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagParam(pub(crate) Tag);

impl Parameter for TagParam {
    type Role = roles::Tag;
}

/// A `source` or `destination` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankParam<R> {
    pub(crate) rank: Rank,
    _role: PhantomData<R>,
}

impl<R: Role> Parameter for RankParam<R> {
    type Role = R;
}

/// An explicit datatype parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeParam<R> {
    pub(crate) datatype: RawDatatype,
    _role: PhantomData<R>,
}

impl<R: Role> Parameter for TypeParam<R> {
    type Role = R;
}

/// The `send_mode` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendModeParam(pub(crate) SendMode);

impl Parameter for SendModeParam {
    type Role = roles::SendMode;
}

/// The `request` parameter.
#[derive(Debug)]
pub struct RequestParam<Q>(pub(crate) Q);

impl<Q> Parameter for RequestParam<Q> {
    type Role = roles::Request;
}

/// Root of a rooted collective. Defaults to the communicator's root.
pub fn root(rank: i32) -> RootParam {
    RootParam(rank)
}

/// Receiver of a point-to-point message.
pub fn destination(rank: impl Into<Rank>) -> RankParam<roles::Destination> {
    RankParam {
        rank: rank.into(),
        _role: PhantomData,
    }
}

/// Sender to receive from. Defaults to [`Rank::Any`].
pub fn source(rank: impl Into<Rank>) -> RankParam<roles::Source> {
    RankParam {
        rank: rank.into(),
        _role: PhantomData,
    }
}

/// Message tag. Sends default to 0, receives to [`Tag::Any`].
pub fn tag(tag: impl Into<Tag>) -> TagParam {
    TagParam(tag.into())
}

/// Send in the given mode. Defaults to [`SendMode::Standard`].
pub fn send_mode(mode: SendMode) -> SendModeParam {
    SendModeParam(mode)
}

macro_rules! type_factories {
    ($($role:ident => $name:ident;)*) => {
        $(
            #[doc = concat!("Use `datatype` instead of the one registered for the `", stringify!($role), "` elements.")]
            pub fn $name(datatype: RawDatatype) -> TypeParam<roles::$role> {
                TypeParam {
                    datatype,
                    _role: PhantomData,
                }
            }
        )*
    };
}

type_factories! {
    SendType => send_type;
    RecvType => recv_type;
    SendRecvType => send_recv_type;
}

/// Issue a nonblocking operation into a pooled request.
pub fn request<'p, 'buf>(slot: PooledRequest<'p, 'buf>) -> RequestParam<PooledRequest<'p, 'buf>> {
    RequestParam(slot)
}

// ============================================================================
// Statuses
// ============================================================================

/// Return the status in the result.
pub fn status_out() -> DataBuffer<roles::Status, Out, SingleOwned<Status, Library>, NoResize> {
    DataBuffer::new(SingleOwned::new(Status::default()))
}

/// Write the status into `status`.
pub fn status(status: &mut Status) -> DataBuffer<roles::Status, Out, SingleMut<'_, Status>, NoResize> {
    DataBuffer::new(SingleMut(status))
}

/// Return one status per pooled request in the result.
pub fn statuses_out() -> DataBuffer<roles::Statuses, Out, Owned<Vec<Status>, Library>, ResizeToFit> {
    DataBuffer::new(Owned::new(Vec::new()))
}

/// Write one status per pooled request into caller storage.
pub fn statuses<X>(statuses: X) -> DataBuffer<roles::Statuses, Out, X::Storage, DefaultPolicyOf<X>>
where
    X: IntoStorage,
    X::Storage: StorageMut<Elem = Status>,
{
    DataBuffer::new(statuses.into_storage())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Allocation, BufferDirection, ResizePolicyKind, ValueCategory};
    use proptest::prelude::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    type ExtractableOut = DataBuffer<roles::RecvBuf, Out, Owned<Vec<i32>, Library>, ResizeToFit>;
    type CallerOut<'a> = DataBuffer<roles::RecvBuf, Out, RefMut<'a, Vec<i32>>, NoResize>;

    // Only library-allocated storage is extractable.
    assert_impl_all!(Owned<Vec<i32>, Library>: crate::buffer::ExtractableStorage);
    assert_not_impl_any!(Owned<Vec<i32>, Caller>: crate::buffer::ExtractableStorage);
    assert_not_impl_any!(RefMut<'static, Vec<i32>>: crate::buffer::ExtractableStorage);
    assert_not_impl_any!(Ref<'static, [i32]>: crate::buffer::ExtractableStorage, StorageMut);
    assert_impl_all!(ExtractableOut: crate::buffer::OutBuffer);
    assert_impl_all!(CallerOut<'static>: crate::buffer::OutBuffer);

    #[test]
    fn argument_form_decides_storage() {
        let data = vec![1, 2];
        assert_eq!(send_buf(&data).ownership(), crate::buffer::Ownership::Referencing);
        assert_eq!(send_buf(data.clone()).ownership(), crate::buffer::Ownership::Owning);
        assert_eq!(send_buf([1, 2, 3]).size(), 3);
        assert_eq!(send_buf(&7u8).value_category(), ValueCategory::Single);
        assert_eq!(send_buf(ignore::<f64>()).direction(), BufferDirection::Ignored);

        let out = recv_buf(alloc_container_of::<u64>());
        assert_eq!(out.allocation(), Allocation::Library);
        assert_eq!(out.resize_policy(), ResizePolicyKind::ResizeToFit);
    }

    #[test]
    fn container_family_directive_allocates_like_alloc_new() {
        let out = recv_buf(alloc_new_using::<VecFamily, f32>());
        assert_eq!(out.allocation(), Allocation::Library);
        assert_eq!(out.resize_policy(), ResizePolicyKind::ResizeToFit);
        assert_eq!(out.extract(), Vec::<f32>::new());

        let _: AllocNew<Vec<u16>> = alloc_new_using::<VecFamily, _>();
    }

    #[test]
    fn count_factories() {
        assert_eq!(recv_count(4).get_single_element(), 4);
        assert_eq!(recv_counts_out().resize_policy(), ResizePolicyKind::ResizeToFit);
        let mut n = 0;
        let mut slot = recv_count_out_into(&mut n);
        slot.as_mut_slice()[0] = 9;
        assert_eq!(n, 9);
        assert_eq!(send_counts(vec![1, 2]).as_slice(), &[1, 2]);
    }

    #[test]
    fn ranks_and_tags() {
        assert_eq!(destination(3).rank, Rank::Value(3));
        assert_eq!(source(Rank::Any).rank, Rank::Any);
        assert_eq!(tag(Tag::Any).0, Tag::Any);
        assert_eq!(root(1).parameter_type(), roles::ParameterType::Root);
        assert_eq!(send_mode(SendMode::Synchronous).0, SendMode::Synchronous);
    }

    #[test]
    fn status_factories() {
        let mut status_slot = Status::default();
        {
            let mut out = status(&mut status_slot);
            out.as_mut_slice()[0].tag = 4;
        }
        assert_eq!(status_slot.tag, 4);
        assert_eq!(statuses_out().size(), 0);
    }

    proptest! {
        #[test]
        fn grow_only_keeps_the_larger_size(pre in 0usize..64, required in 0usize..64) {
            let mut data = vec![1u8; pre];
            let mut buffer = recv_buf(&mut data).grow_only();
            buffer.resize_if_requested(|| required).unwrap();
            prop_assert_eq!(buffer.size(), pre.max(required));
            prop_assert!(data[..pre].iter().all(|&x| x == 1));
        }

        #[test]
        fn resize_to_fit_matches_exactly(pre in 0usize..64, required in 0usize..64) {
            let mut buffer = recv_buf(vec![0i16; pre]).resize_to_fit();
            buffer.resize_if_requested(|| required).unwrap();
            prop_assert_eq!(buffer.size(), required);
        }

        #[test]
        fn no_resize_fails_exactly_when_too_small(pre in 0usize..64, required in 0usize..64) {
            let mut data = vec![0f32; pre];
            let mut buffer = recv_buf(&mut data);
            let outcome = buffer.resize_if_requested(|| required);
            prop_assert_eq!(outcome.is_ok(), pre >= required);
            prop_assert_eq!(buffer.size(), pre);
        }
    }
}
