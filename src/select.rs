//! Parameter selection and validation.
//!
//! Every wrapped operation declares an argument record: one slot per role it
//! knows, each slot a type parameter that defaults to [`Absent`]. Passing a
//! tuple of named parameters folds them into the record with [`Collect`]:
//! each parameter lands in the slot of its role through [`Accept`], which is
//! only implemented while that slot is still `Absent`. Hence
//!
//! - a parameter whose role the operation does not know has no `Accept` impl,
//! - a role given twice finds its slot already filled, also without impl,
//! - a required role left out leaves `Absent` in a slot the operation bounds
//!   by [`Required`].
//!
//! All three are compile errors. Optional slots are read through the slot
//! traits below, whose `Absent` impls supply the defaults. None of this
//! exists at run time.

use crate::buffer::{
    ApplyPolicy, DataBuffer, In, InBuffer, Library, Out, OutBuffer, Owned, ResizeToFit,
    SingleStorage, Storage, StorageMut, Writable,
};
use crate::datatype::MpiDatatype;
use crate::error::Result;
use crate::operation::OpParam;
use crate::params::{
    RankParam, Rank, RequestParam, RootParam, SendModeParam, Tag, TagParam, TypeParam,
};
use crate::request::{PooledRequest, Request};
use crate::result::{NotPresent, ResultPart};
use crate::roles::{self, Parameter, Role};
use crate::transport::{RawDatatype, RawRequest, SendMode};
use crate::Communicator;

/// An empty slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Absent;

/// Place parameter `P` of role `R` into a record.
#[diagnostic::on_unimplemented(
    message = "this operation does not accept a `{R}` parameter here",
    label = "unknown or duplicate parameter",
    note = "every parameter may be passed at most once, and only roles the operation lists are accepted"
)]
pub trait Accept<P, R> {
    /// The record with the slot filled.
    type Output;

    /// Fill the slot.
    fn accept(self, param: P) -> Self::Output;
}

/// A parameter pack: one named parameter, or a tuple of them.
#[diagnostic::on_unimplemented(
    message = "`{Self}` is not a valid parameter pack for this operation",
    note = "pass one named parameter or a tuple of them, each role at most once"
)]
pub trait Collect<Rec> {
    /// The filled record.
    type Output;

    /// Fold the parameters into `rec`.
    fn collect_into(self, rec: Rec) -> Self::Output;
}

/// Implemented by every parameter of role `R`, and not by [`Absent`].
#[diagnostic::on_unimplemented(
    message = "missing required parameter `{R}`",
    label = "this call needs a `{R}` parameter"
)]
pub trait Required<R: Role> {}

impl<R: Role, P: Parameter<Role = R>> Required<R> for P {}

impl<Rec> Collect<Rec> for () {
    type Output = Rec;

    fn collect_into(self, rec: Rec) -> Rec {
        rec
    }
}

macro_rules! collect_tuple {
    () => {};
    ($head:ident $(, $tail:ident)*) => {
        impl<Rec, $head: Parameter, $($tail),*> Collect<Rec> for ($head, $($tail,)*)
        where
            Rec: Accept<$head, $head::Role>,
            ($($tail,)*): Collect<<Rec as Accept<$head, $head::Role>>::Output>,
        {
            type Output =
                <($($tail,)*) as Collect<<Rec as Accept<$head, $head::Role>>::Output>>::Output;

            #[allow(non_snake_case)]
            fn collect_into(self, rec: Rec) -> Self::Output {
                let ($head, $($tail,)*) = self;
                ($($tail,)*).collect_into(rec.accept($head))
            }
        }

        collect_tuple!($($tail),*);
    };
}

collect_tuple!(A, B, C, D, E, F, G, H, I);

macro_rules! collect_single {
    ($(impl<$($g:ident),*> for $ty:ty;)*) => {
        $(
            impl<Rec, $($g),*> Collect<Rec> for $ty
            where
                $ty: Parameter,
                Rec: Accept<$ty, <$ty as Parameter>::Role>,
            {
                type Output = <Rec as Accept<$ty, <$ty as Parameter>::Role>>::Output;

                fn collect_into(self, rec: Rec) -> Self::Output {
                    rec.accept(self)
                }
            }
        )*
    };
}

collect_single! {
    impl<R, D, S, P> for DataBuffer<R, D, S, P>;
    impl<R> for RankParam<R>;
    impl<R> for TypeParam<R>;
    impl<> for RootParam;
    impl<> for TagParam;
    impl<> for SendModeParam;
    impl<Q> for RequestParam<Q>;
    impl<F, C> for OpParam<F, C>;
}

/// Declares an argument record.
macro_rules! parameter_set {
    ($(#[$doc:meta])* $name:ident { $($field:ident: $role:ident),* $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $name<$($role = Absent),*> {
            $(
                #[doc = concat!("The `", stringify!($field), "` slot")]
                pub $field: $role,
            )*
        }

        parameter_set!(@accept $name [] [$($field: $role),*]);
    };
    (@accept $name:ident [$($bf:ident: $br:ident),*] []) => {};
    (
        @accept $name:ident [$($bf:ident: $br:ident),*]
        [$f:ident: $r:ident $(, $af:ident: $ar:ident)*]
    ) => {
        impl<Param, $($br,)* $($ar,)*> Accept<Param, roles::$r> for $name<$($br,)* Absent, $($ar,)*>
        where
            Param: Parameter<Role = roles::$r>,
        {
            type Output = $name<$($br,)* Param, $($ar,)*>;

            fn accept(self, param: Param) -> Self::Output {
                $name {
                    $($bf: self.$bf,)*
                    $f: param,
                    $($af: self.$af,)*
                }
            }
        }

        parameter_set!(@accept $name [$($bf: $br,)* $f: $r] [$($af: $ar),*]);
    };
}

parameter_set! {
    /// Arguments of [`Communicator::bcast`](crate::Communicator::bcast).
    BcastArgs {
        send_recv_buf: SendRecvBuf,
        send_recv_count: SendRecvCount,
        root: Root,
        send_recv_type: SendRecvType,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::gather`](crate::Communicator::gather).
    GatherArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        root: Root,
        send_type: SendType,
        recv_type: RecvType,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::gatherv`](crate::Communicator::gatherv).
    GathervArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        recv_counts: RecvCounts,
        recv_displs: RecvDispls,
        root: Root,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::scatter`](crate::Communicator::scatter).
    ScatterArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        recv_count: RecvCount,
        root: Root,
        send_type: SendType,
        recv_type: RecvType,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::scatterv`](crate::Communicator::scatterv).
    ScattervArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        send_counts: SendCounts,
        send_displs: SendDispls,
        recv_count: RecvCount,
        root: Root,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::allgather`](crate::Communicator::allgather).
    AllgatherArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        send_type: SendType,
        recv_type: RecvType,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::allgatherv`](crate::Communicator::allgatherv).
    AllgathervArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        recv_counts: RecvCounts,
        recv_displs: RecvDispls,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::alltoall`](crate::Communicator::alltoall).
    AlltoallArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        send_type: SendType,
        recv_type: RecvType,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::alltoallv`](crate::Communicator::alltoallv).
    AlltoallvArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        send_counts: SendCounts,
        send_displs: SendDispls,
        recv_counts: RecvCounts,
        recv_displs: RecvDispls,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::reduce`](crate::Communicator::reduce).
    ReduceArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        op: Op,
        root: Root,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::allreduce`](crate::Communicator::allreduce),
    /// [`scan`](crate::Communicator::scan).
    AllreduceArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        op: Op,
    }
}

parameter_set! {
    /// Arguments of
    /// [`Communicator::allreduce_inplace`](crate::Communicator::allreduce_inplace).
    AllreduceInplaceArgs {
        send_recv_buf: SendRecvBuf,
        op: Op,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::exscan`](crate::Communicator::exscan).
    ExscanArgs {
        send_buf: SendBuf,
        recv_buf: RecvBuf,
        op: Op,
        values_on_rank_0: ValuesOnRank0,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::send`](crate::Communicator::send).
    SendArgs {
        send_buf: SendBuf,
        destination: Destination,
        tag: Tag,
        send_mode: SendMode,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::isend`](crate::Communicator::isend).
    IsendArgs {
        send_buf: SendBuf,
        destination: Destination,
        tag: Tag,
        send_mode: SendMode,
        request: Request,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::recv`](crate::Communicator::recv).
    RecvArgs {
        recv_buf: RecvBuf,
        source: Source,
        tag: Tag,
        recv_count: RecvCount,
        status: Status,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::irecv`](crate::Communicator::irecv).
    IrecvArgs {
        recv_buf: RecvBuf,
        source: Source,
        tag: Tag,
        recv_count: RecvCount,
        status: Status,
        request: Request,
    }
}

parameter_set! {
    /// Arguments of [`Communicator::probe`](crate::Communicator::probe) and
    /// [`iprobe`](crate::Communicator::iprobe).
    ProbeArgs {
        source: Source,
        tag: Tag,
    }
}

// ============================================================================
// Slots
// ============================================================================

/// An optional input buffer of element type `T`.
///
/// Also covers the `ignore` placeholder, which reads as absent.
pub trait MaybeIn<T> {
    /// The elements, if given.
    fn elements(&self) -> Option<&[T]>;
}

impl<T> MaybeIn<T> for Absent {
    fn elements(&self) -> Option<&[T]> {
        None
    }
}

impl<B: InBuffer> MaybeIn<B::Elem> for B {
    fn elements(&self) -> Option<&[B::Elem]> {
        if self.ignored() {
            None
        } else {
            Some(InBuffer::elements(self))
        }
    }
}

/// A receive buffer of element type `T`; absent means a library-allocated
/// `Vec<T>` resized to fit.
pub trait RecvBufSlot<T> {
    /// The buffer the operation writes.
    type Buffer: OutBuffer<Elem = T>;

    /// Resolve the slot.
    fn into_buffer(self) -> Self::Buffer;
}

impl<T: MpiDatatype + Default> RecvBufSlot<T> for Absent {
    type Buffer = DataBuffer<roles::RecvBuf, Out, Owned<Vec<T>, Library>, ResizeToFit>;

    fn into_buffer(self) -> Self::Buffer {
        DataBuffer::new(Owned::new(Vec::new()))
    }
}

impl<B: OutBuffer> RecvBufSlot<B::Elem> for B {
    type Buffer = B;

    fn into_buffer(self) -> B {
        self
    }
}

/// A single count: given by the caller, requested as output, or absent.
pub trait CountSlot {
    /// Contribution to the result.
    type Part: ResultPart;

    /// The caller's count, if given.
    fn given(&self) -> Option<i32>;

    /// Record the count the operation used.
    fn store(&mut self, count: i32);

    /// Hand the slot over to the result.
    fn finish(self) -> Self::Part;
}

impl CountSlot for Absent {
    type Part = NotPresent;

    fn given(&self) -> Option<i32> {
        None
    }

    fn store(&mut self, _count: i32) {}

    fn finish(self) -> NotPresent {
        NotPresent
    }
}

impl<R, S, P> CountSlot for DataBuffer<R, In, S, P>
where
    R: Role,
    S: SingleStorage<Elem = i32>,
    P: crate::buffer::ResizePolicy,
{
    type Part = NotPresent;

    fn given(&self) -> Option<i32> {
        Some(self.get_single_element())
    }

    fn store(&mut self, _count: i32) {}

    fn finish(self) -> NotPresent {
        NotPresent
    }
}

impl<R, S, P> CountSlot for DataBuffer<R, Out, S, P>
where
    R: Role,
    S: SingleStorage<Elem = i32> + StorageMut,
    P: crate::buffer::ResizePolicy,
{
    type Part = S::Returned;

    fn given(&self) -> Option<i32> {
        None
    }

    fn store(&mut self, count: i32) {
        if let Some(slot) = self.as_mut_slice().first_mut() {
            *slot = count;
        }
    }

    fn finish(self) -> S::Returned {
        self.into_part()
    }
}

/// Per-rank counts or displacements: given, requested as output, or absent.
pub trait VecSlot {
    /// Contribution to the result.
    type Part: ResultPart;

    /// The caller's values, if given.
    fn given(&self) -> Option<&[i32]>;

    /// Record the values the operation used.
    fn store(&mut self, values: &[i32]) -> Result<()>;

    /// Hand the slot over to the result.
    fn finish(self) -> Self::Part;
}

impl VecSlot for Absent {
    type Part = NotPresent;

    fn given(&self) -> Option<&[i32]> {
        None
    }

    fn store(&mut self, _values: &[i32]) -> Result<()> {
        Ok(())
    }

    fn finish(self) -> NotPresent {
        NotPresent
    }
}

impl<R, S, P> VecSlot for DataBuffer<R, In, S, P>
where
    R: Role,
    S: Storage<Elem = i32>,
    P: crate::buffer::ResizePolicy,
{
    type Part = NotPresent;

    fn given(&self) -> Option<&[i32]> {
        Some(self.as_slice())
    }

    fn store(&mut self, _values: &[i32]) -> Result<()> {
        Ok(())
    }

    fn finish(self) -> NotPresent {
        NotPresent
    }
}

impl<R, S, P> VecSlot for DataBuffer<R, Out, S, P>
where
    R: Role,
    S: StorageMut<Elem = i32>,
    P: ApplyPolicy<S>,
{
    type Part = S::Returned;

    fn given(&self) -> Option<&[i32]> {
        None
    }

    fn store(&mut self, values: &[i32]) -> Result<()> {
        self.resize_if_requested(|| values.len())?;
        self.as_mut_slice()[..values.len()].copy_from_slice(values);
        Ok(())
    }

    fn finish(self) -> S::Returned {
        self.into_part()
    }
}

/// The `root` slot. Absent means the communicator's default root.
pub trait RootSlot {
    /// The given root.
    fn root(&self) -> Option<i32>;
}

impl RootSlot for Absent {
    fn root(&self) -> Option<i32> {
        None
    }
}

impl RootSlot for RootParam {
    fn root(&self) -> Option<i32> {
        Some(self.0)
    }
}

/// The `tag` slot.
pub trait TagSlot {
    /// The given tag.
    fn tag(&self) -> Option<Tag>;
}

impl TagSlot for Absent {
    fn tag(&self) -> Option<Tag> {
        None
    }
}

impl TagSlot for TagParam {
    fn tag(&self) -> Option<Tag> {
        Some(self.0)
    }
}

/// The `source` and `destination` slots.
pub trait RankSlot {
    /// The given rank.
    fn rank(&self) -> Option<Rank>;
}

impl RankSlot for Absent {
    fn rank(&self) -> Option<Rank> {
        None
    }
}

impl<R: Role> RankSlot for RankParam<R> {
    fn rank(&self) -> Option<Rank> {
        Some(self.rank)
    }
}

/// The explicit datatype slots.
pub trait TypeSlot {
    /// The given datatype.
    fn datatype(&self) -> Option<RawDatatype>;
}

impl TypeSlot for Absent {
    fn datatype(&self) -> Option<RawDatatype> {
        None
    }
}

impl<R: Role> TypeSlot for TypeParam<R> {
    fn datatype(&self) -> Option<RawDatatype> {
        Some(self.datatype)
    }
}

/// The `send_mode` slot. Absent means standard mode.
pub trait SendModeSlot {
    /// The mode to send in.
    fn mode(&self) -> SendMode;
}

impl SendModeSlot for Absent {
    fn mode(&self) -> SendMode {
        SendMode::Standard
    }
}

impl SendModeSlot for SendModeParam {
    fn mode(&self) -> SendMode {
        self.0
    }
}

/// The `status` slot of an operation or a request completion.
pub trait StatusSlot {
    /// Contribution to the result.
    type Part: ResultPart;

    /// Record the status.
    fn store(&mut self, status: crate::status::Status);

    /// Hand the slot over to the result.
    fn finish(self) -> Self::Part;
}

impl StatusSlot for Absent {
    type Part = NotPresent;

    fn store(&mut self, _status: crate::status::Status) {}

    fn finish(self) -> NotPresent {
        NotPresent
    }
}

impl<D, S, P> StatusSlot for DataBuffer<roles::Status, D, S, P>
where
    D: Writable,
    S: SingleStorage<Elem = crate::status::Status> + StorageMut,
    P: crate::buffer::ResizePolicy,
{
    type Part = D::Part<S>;

    fn store(&mut self, status: crate::status::Status) {
        if let Some(slot) = self.as_mut_slice().first_mut() {
            *slot = status;
        }
    }

    fn finish(self) -> D::Part<S> {
        self.into_part()
    }
}

/// The `statuses` slot of a pool completion.
pub trait StatusesSlot {
    /// Contribution to the result.
    type Part: ResultPart;

    /// Record one status per pooled request, resizing per policy.
    fn store(&mut self, statuses: &[crate::status::Status]) -> Result<()>;

    /// Hand the slot over to the result.
    fn finish(self) -> Self::Part;
}

impl<D, S, P> StatusesSlot for DataBuffer<roles::Statuses, D, S, P>
where
    D: Writable,
    S: StorageMut<Elem = crate::status::Status>,
    P: ApplyPolicy<S>,
{
    type Part = D::Part<S>;

    fn store(&mut self, statuses: &[crate::status::Status]) -> Result<()> {
        self.resize_if_requested(|| statuses.len())?;
        self.as_mut_slice()[..statuses.len()].copy_from_slice(statuses);
        Ok(())
    }

    fn finish(self) -> D::Part<S> {
        self.into_part()
    }
}

/// The `request` slot. Absent means a fresh [`Request`] owned by the result.
pub trait RequestSlot {
    /// The handle the operation was issued into.
    type Handle;

    /// Install the request issued on `comm`.
    fn start(self, comm: &Communicator, raw: RawRequest) -> Self::Handle;
}

impl RequestSlot for Absent {
    type Handle = Request;

    fn start(self, comm: &Communicator, raw: RawRequest) -> Request {
        let mut request = Request::null(comm.context());
        request.start(raw);
        request
    }
}

impl<'p, 'buf> RequestSlot for RequestParam<PooledRequest<'p, 'buf>> {
    type Handle = PooledRequest<'p, 'buf>;

    fn start(self, _comm: &Communicator, raw: RawRequest) -> PooledRequest<'p, 'buf> {
        let mut pooled = self.0;
        pooled.start(raw);
        pooled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{op, ops};
    use crate::params::{recv_buf, root, send_buf, tag};
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    type SendRef<'a> = DataBuffer<roles::SendBuf, In, crate::buffer::Ref<'a, [i32]>, crate::buffer::NoResize>;
    type RootOnly = ReduceArgs<Absent, Absent, Absent, RootParam>;

    // Each role is accepted once.
    assert_impl_all!(ReduceArgs: Accept<RootParam, roles::Root>);
    assert_not_impl_any!(RootOnly: Accept<RootParam, roles::Root>);
    // Roles the operation does not list are rejected.
    assert_not_impl_any!(ReduceArgs: Accept<TagParam, roles::Tag>);
    // Required roles.
    assert_impl_all!(RootParam: Required<roles::Root>);
    assert_not_impl_any!(Absent: Required<roles::SendBuf>, Required<roles::Op>);

    #[test]
    fn tuples_fill_slots_in_any_order() {
        let data = [1, 2, 3];
        let args = (root(2), send_buf(&data[..]), op(ops::Plus)).collect_into(<ReduceArgs>::default());
        assert_eq!(args.root.0, 2);
        assert_eq!(args.send_buf.size(), 3);
        let _: &SendRef<'_> = &args.send_buf;
    }

    #[test]
    fn single_parameter_is_a_pack() {
        let args = root(1).collect_into(<ReduceArgs>::default());
        assert_eq!(RootSlot::root(&args.root), Some(1));
        assert_eq!(RootSlot::root(&args.recv_buf), None);
    }

    #[test]
    fn defaults_of_absent_slots() {
        assert_eq!(Absent.mode(), SendMode::Standard);
        assert_eq!(TagSlot::tag(&Absent), None);
        assert_eq!(CountSlot::given(&Absent), None);
        let buffer = RecvBufSlot::<u16>::into_buffer(Absent);
        assert!(buffer.is_empty());
        assert_eq!(TagSlot::tag(&tag(5)), Some(Tag::Value(5)));
    }

    #[test]
    fn output_counts_are_recorded() {
        let mut given = vec![0i32; 2];
        let mut caller = recv_buf(&mut given);
        assert_eq!(OutBuffer::len(&caller), 2);
        caller.elements_mut()[1] = 3;
        assert_eq!(given, vec![0, 3]);

        let mut out = crate::params::recv_count_out();
        assert_eq!(CountSlot::given(&out), None);
        CountSlot::store(&mut out, 12);
        assert_eq!(CountSlot::finish(out).into_value(), 12);

        let mut counts = crate::params::recv_counts_out();
        VecSlot::store(&mut counts, &[1, 2, 3]).unwrap();
        assert_eq!(VecSlot::finish(counts).into_value(), vec![1, 2, 3]);

        let fixed = crate::params::send_counts(&[4, 5][..]);
        assert_eq!(VecSlot::given(&fixed), Some(&[4, 5][..]));
    }
}
