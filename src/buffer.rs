//! Data buffers.
//!
//! A [`DataBuffer`] wraps one argument of a wrapped operation. Everything an
//! operation needs to know about the argument lives in its type:
//!
//! | Type parameter | Meaning | Values |
//! |----------------|---------|--------|
//! | `R` | Role | a marker from [`roles`](crate::roles) |
//! | `D` | Direction | [`In`], [`Out`], [`InOut`] |
//! | `S` | Storage | [`Ref`], [`RefMut`], [`Owned`], [`SingleRef`], [`SingleMut`], [`SingleOwned`], [`Empty`] |
//! | `P` | Resize policy | [`NoResize`], [`GrowOnly`], [`ResizeToFit`] |
//!
//! The storage in turn fixes modifiability, ownership, allocation source and
//! value category. Constant storage ([`Ref`], [`SingleRef`], [`Empty`]) never
//! implements [`StorageMut`], so it can never back an output. Only storage the
//! library allocated implements [`ExtractableStorage`].
//!
//! Buffers are normally built with the factories in [`params`](crate::params):
//!
//! ```
//! use mpiparams::buffer::{BufferDirection, ResizePolicyKind};
//! use mpiparams::params::{alloc_new, recv_buf, send_buf};
//!
//! let data = vec![1, 2, 3];
//! let input = send_buf(&data);
//! assert_eq!(input.size(), 3);
//! assert_eq!(input.direction(), BufferDirection::In);
//!
//! let mut output = recv_buf(alloc_new::<Vec<i32>>());
//! assert_eq!(output.resize_policy(), ResizePolicyKind::ResizeToFit);
//! output.resize_if_requested(|| 5).unwrap();
//! assert_eq!(output.extract(), vec![0; 5]);
//! ```

use crate::datatype::MpiDatatype;
use crate::error::{Error, Result};
use crate::result::{NotPresent, Present, ResultPart};
use crate::roles::{Parameter, Role};
use std::fmt;
use std::marker::PhantomData;

mod sealed {
    pub trait Sealed {}
}

// ============================================================================
// Properties
// ============================================================================

/// Run-time view of a buffer's direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferDirection {
    /// Read by the operation
    In,
    /// Written by the operation
    Out,
    /// Read, then overwritten
    InOut,
    /// Placeholder for an argument this rank does not provide
    Ignored,
}

/// Whether a buffer references caller storage or holds its storage by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Borrows caller storage for the duration of the call
    Referencing,
    /// Holds the storage by value
    Owning,
}

/// Who allocated a buffer's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Allocation {
    /// The caller
    Caller,
    /// The library, on the caller's request
    Library,
}

/// Shape of the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueCategory {
    /// A range of elements with a run-time size
    Contiguous,
    /// Exactly one element
    Single,
    /// No elements
    Empty,
}

/// Run-time view of a resize policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResizePolicyKind {
    /// Never resize; too small a buffer is an error
    NoResize,
    /// Grow when too small, never shrink
    GrowOnly,
    /// Always match the required size exactly
    ResizeToFit,
}

// ============================================================================
// Directions
// ============================================================================

/// Read by the operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct In;

/// Written by the operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Out;

/// Read, then overwritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InOut;

/// A buffer direction.
pub trait Direction: sealed::Sealed + Copy + Default + 'static {
    /// Run-time name, for buffers that are not placeholders.
    const DIRECTION: BufferDirection;

    /// What the buffer contributes to the operation's result.
    type Part<S: Storage>: ResultPart;

    /// Turn the buffer's storage into its result contribution.
    fn part<S: Storage>(storage: S) -> Self::Part<S>;
}

/// A direction the operation writes to.
pub trait Writable: Direction {}

impl sealed::Sealed for In {}
impl sealed::Sealed for Out {}
impl sealed::Sealed for InOut {}

impl Direction for In {
    const DIRECTION: BufferDirection = BufferDirection::In;
    type Part<S: Storage> = NotPresent;

    fn part<S: Storage>(_storage: S) -> NotPresent {
        NotPresent
    }
}

impl Direction for Out {
    const DIRECTION: BufferDirection = BufferDirection::Out;
    type Part<S: Storage> = S::Returned;

    fn part<S: Storage>(storage: S) -> S::Returned {
        storage.into_returned()
    }
}

impl Direction for InOut {
    const DIRECTION: BufferDirection = BufferDirection::InOut;
    type Part<S: Storage> = S::Returned;

    fn part<S: Storage>(storage: S) -> S::Returned {
        storage.into_returned()
    }
}

impl Writable for Out {}
impl Writable for InOut {}

// ============================================================================
// Resize policies
// ============================================================================

/// Never resize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoResize;

/// Grow when too small, never shrink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrowOnly;

/// Always resize to the required size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeToFit;

/// A resize policy.
pub trait ResizePolicy: sealed::Sealed + Copy + Default + 'static {
    /// Run-time name.
    const KIND: ResizePolicyKind;
}

impl sealed::Sealed for NoResize {}
impl sealed::Sealed for GrowOnly {}
impl sealed::Sealed for ResizeToFit {}

impl ResizePolicy for NoResize {
    const KIND: ResizePolicyKind = ResizePolicyKind::NoResize;
}

impl ResizePolicy for GrowOnly {
    const KIND: ResizePolicyKind = ResizePolicyKind::GrowOnly;
}

impl ResizePolicy for ResizeToFit {
    const KIND: ResizePolicyKind = ResizePolicyKind::ResizeToFit;
}

/// A policy applicable to storage `S`.
///
/// [`NoResize`] applies to any modifiable storage; the growing policies need
/// storage that can change its length.
#[diagnostic::on_unimplemented(
    message = "resize policy `{Self}` cannot be applied to `{S}`",
    note = "only growable containers such as `Vec<T>` support `grow_only` and `resize_to_fit`"
)]
pub trait ApplyPolicy<S: StorageMut>: ResizePolicy {
    /// Make `storage` hold at least `required` elements, or fail.
    fn apply(storage: &mut S, required: usize) -> Result<()>;
}

impl<S: StorageMut> ApplyPolicy<S> for NoResize {
    fn apply(storage: &mut S, required: usize) -> Result<()> {
        let actual = storage.as_slice().len();
        if actual < required {
            return Err(Error::SizePolicyViolated { required, actual });
        }
        Ok(())
    }
}

impl<S: ResizableStorage> ApplyPolicy<S> for GrowOnly {
    fn apply(storage: &mut S, required: usize) -> Result<()> {
        if storage.as_slice().len() < required {
            storage.resize(required);
        }
        Ok(())
    }
}

impl<S: ResizableStorage> ApplyPolicy<S> for ResizeToFit {
    fn apply(storage: &mut S, required: usize) -> Result<()> {
        storage.resize(required);
        Ok(())
    }
}

// ============================================================================
// Allocation markers
// ============================================================================

/// Storage the caller allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller;

/// Storage the library allocated on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Library;

/// Who allocated owned storage.
pub trait AllocationSource: sealed::Sealed + Copy + Default + 'static {
    /// Run-time name.
    const ALLOCATION: Allocation;
    /// Output policy when the caller picks none.
    type DefaultPolicy: ResizePolicy;
}

impl sealed::Sealed for Caller {}
impl sealed::Sealed for Library {}

impl AllocationSource for Caller {
    const ALLOCATION: Allocation = Allocation::Caller;
    type DefaultPolicy = NoResize;
}

impl AllocationSource for Library {
    const ALLOCATION: Allocation = Allocation::Library;
    type DefaultPolicy = ResizeToFit;
}

// ============================================================================
// Containers
// ============================================================================

/// A contiguous run of elements.
#[diagnostic::on_unimplemented(
    message = "`{Self}` is not a contiguous container",
    note = "use a `Vec<T>`, a slice, an array or a boxed slice"
)]
pub trait Container {
    /// Element type.
    type Elem: Copy + 'static;

    /// The elements.
    fn as_slice(&self) -> &[Self::Elem];
}

/// A container whose elements may be overwritten.
pub trait ContainerMut: Container {
    /// The elements, writable.
    fn as_mut_slice(&mut self) -> &mut [Self::Elem];
}

/// A container that can change its length. `Default` is its empty state.
pub trait ResizableContainer: ContainerMut + Default {
    /// Set the length, filling new slots with default values.
    fn resize(&mut self, len: usize);
}

impl<T: Copy + 'static> Container for Vec<T> {
    type Elem = T;

    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T: Copy + 'static> ContainerMut for Vec<T> {
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Copy + Default + 'static> ResizableContainer for Vec<T> {
    fn resize(&mut self, len: usize) {
        Vec::resize(self, len, T::default());
    }
}

impl<T: Copy + 'static> Container for [T] {
    type Elem = T;

    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T: Copy + 'static> ContainerMut for [T] {
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Copy + 'static, const N: usize> Container for [T; N] {
    type Elem = T;

    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T: Copy + 'static, const N: usize> ContainerMut for [T; N] {
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Copy + 'static> Container for Box<[T]> {
    type Elem = T;

    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T: Copy + 'static> ContainerMut for Box<[T]> {
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

// ============================================================================
// Storage
// ============================================================================

/// How a buffer holds its elements.
pub trait Storage {
    /// Element type.
    type Elem: Copy + 'static;
    /// The concrete storage [`DataBuffer::underlying`] exposes.
    type Target: ?Sized;
    /// What an output of this storage contributes to the result.
    type Returned: ResultPart;
    /// Output policy when the caller picks none.
    type DefaultPolicy: ResizePolicy;

    /// Referencing or owning.
    const OWNERSHIP: Ownership;
    /// Caller or library allocated.
    const ALLOCATION: Allocation;
    /// Whether the elements may be written.
    const MODIFIABLE: bool;
    /// Contiguous, single or empty.
    const CATEGORY: ValueCategory;

    /// The elements.
    fn as_slice(&self) -> &[Self::Elem];

    /// The concrete storage.
    fn underlying(&self) -> &Self::Target;

    /// Consume the storage into its result contribution.
    fn into_returned(self) -> Self::Returned;
}

/// Storage whose elements may be written.
#[diagnostic::on_unimplemented(
    message = "`{Self}` is read-only and cannot back an output buffer",
    note = "pass a mutable reference (`&mut x`), a value, or `alloc_new::<Vec<T>>()`"
)]
pub trait StorageMut: Storage {
    /// The elements, writable.
    fn as_mut_slice(&mut self) -> &mut [Self::Elem];

    /// The concrete storage, writable.
    fn underlying_mut(&mut self) -> &mut Self::Target;
}

/// Storage that can change its length.
pub trait ResizableStorage: StorageMut {
    /// Set the length.
    fn resize(&mut self, len: usize);
}

/// Storage of exactly one element.
pub trait SingleStorage: Storage {
    /// The element.
    fn get(&self) -> Self::Elem;
}

/// Storage the library allocated, which the caller may take.
#[diagnostic::on_unimplemented(
    message = "`{Self}` was not allocated by the library and cannot be extracted",
    note = "only buffers built from `alloc_new`, `alloc_container_of` or an `*_out()` factory are extractable"
)]
pub trait ExtractableStorage: Storage {
    /// The extracted value.
    type Value;

    /// Take the storage.
    fn extract(self) -> Self::Value;
}

/// Borrowed, read-only container.
pub struct Ref<'a, C: ?Sized>(pub(crate) &'a C);

/// Borrowed, writable container.
pub struct RefMut<'a, C: ?Sized>(pub(crate) &'a mut C);

/// Container held by value.
pub struct Owned<C, A> {
    pub(crate) container: C,
    _allocation: PhantomData<A>,
}

/// Borrowed, read-only single element.
pub struct SingleRef<'a, T>(pub(crate) &'a T);

/// Borrowed, writable single element.
pub struct SingleMut<'a, T>(pub(crate) &'a mut T);

/// Single element held by value.
pub struct SingleOwned<T, A> {
    pub(crate) value: T,
    _allocation: PhantomData<A>,
}

/// No elements.
pub struct Empty<T>(PhantomData<T>);

impl<C, A> Owned<C, A> {
    pub(crate) fn new(container: C) -> Self {
        Owned {
            container,
            _allocation: PhantomData,
        }
    }
}

impl<T, A> SingleOwned<T, A> {
    pub(crate) fn new(value: T) -> Self {
        SingleOwned {
            value,
            _allocation: PhantomData,
        }
    }
}

impl<T> Empty<T> {
    pub(crate) fn new() -> Self {
        Empty(PhantomData)
    }
}

impl<C: Container + ?Sized> Storage for Ref<'_, C> {
    type Elem = C::Elem;
    type Target = C;
    type Returned = NotPresent;
    type DefaultPolicy = NoResize;

    const OWNERSHIP: Ownership = Ownership::Referencing;
    const ALLOCATION: Allocation = Allocation::Caller;
    const MODIFIABLE: bool = false;
    const CATEGORY: ValueCategory = ValueCategory::Contiguous;

    fn as_slice(&self) -> &[C::Elem] {
        self.0.as_slice()
    }

    fn underlying(&self) -> &C {
        self.0
    }

    fn into_returned(self) -> NotPresent {
        NotPresent
    }
}

impl<C: ContainerMut + ?Sized> Storage for RefMut<'_, C> {
    type Elem = C::Elem;
    type Target = C;
    type Returned = NotPresent;
    type DefaultPolicy = NoResize;

    const OWNERSHIP: Ownership = Ownership::Referencing;
    const ALLOCATION: Allocation = Allocation::Caller;
    const MODIFIABLE: bool = true;
    const CATEGORY: ValueCategory = ValueCategory::Contiguous;

    fn as_slice(&self) -> &[C::Elem] {
        self.0.as_slice()
    }

    fn underlying(&self) -> &C {
        self.0
    }

    fn into_returned(self) -> NotPresent {
        NotPresent
    }
}

impl<C: ContainerMut + ?Sized> StorageMut for RefMut<'_, C> {
    fn as_mut_slice(&mut self) -> &mut [C::Elem] {
        self.0.as_mut_slice()
    }

    fn underlying_mut(&mut self) -> &mut C {
        self.0
    }
}

impl<C: ResizableContainer> ResizableStorage for RefMut<'_, C> {
    fn resize(&mut self, len: usize) {
        self.0.resize(len);
    }
}

impl<C: ContainerMut, A: AllocationSource> Storage for Owned<C, A> {
    type Elem = C::Elem;
    type Target = C;
    type Returned = Present<C>;
    type DefaultPolicy = A::DefaultPolicy;

    const OWNERSHIP: Ownership = Ownership::Owning;
    const ALLOCATION: Allocation = A::ALLOCATION;
    const MODIFIABLE: bool = true;
    const CATEGORY: ValueCategory = ValueCategory::Contiguous;

    fn as_slice(&self) -> &[C::Elem] {
        self.container.as_slice()
    }

    fn underlying(&self) -> &C {
        &self.container
    }

    fn into_returned(self) -> Present<C> {
        Present(self.container)
    }
}

impl<C: ContainerMut, A: AllocationSource> StorageMut for Owned<C, A> {
    fn as_mut_slice(&mut self) -> &mut [C::Elem] {
        self.container.as_mut_slice()
    }

    fn underlying_mut(&mut self) -> &mut C {
        &mut self.container
    }
}

impl<C: ResizableContainer, A: AllocationSource> ResizableStorage for Owned<C, A> {
    fn resize(&mut self, len: usize) {
        self.container.resize(len);
    }
}

impl<C: ContainerMut> ExtractableStorage for Owned<C, Library> {
    type Value = C;

    fn extract(self) -> C {
        self.container
    }
}

impl<T: Copy + 'static> Storage for SingleRef<'_, T> {
    type Elem = T;
    type Target = T;
    type Returned = NotPresent;
    type DefaultPolicy = NoResize;

    const OWNERSHIP: Ownership = Ownership::Referencing;
    const ALLOCATION: Allocation = Allocation::Caller;
    const MODIFIABLE: bool = false;
    const CATEGORY: ValueCategory = ValueCategory::Single;

    fn as_slice(&self) -> &[T] {
        std::slice::from_ref(self.0)
    }

    fn underlying(&self) -> &T {
        self.0
    }

    fn into_returned(self) -> NotPresent {
        NotPresent
    }
}

impl<T: Copy + 'static> SingleStorage for SingleRef<'_, T> {
    fn get(&self) -> T {
        *self.0
    }
}

impl<T: Copy + 'static> Storage for SingleMut<'_, T> {
    type Elem = T;
    type Target = T;
    type Returned = NotPresent;
    type DefaultPolicy = NoResize;

    const OWNERSHIP: Ownership = Ownership::Referencing;
    const ALLOCATION: Allocation = Allocation::Caller;
    const MODIFIABLE: bool = true;
    const CATEGORY: ValueCategory = ValueCategory::Single;

    fn as_slice(&self) -> &[T] {
        std::slice::from_ref(self.0)
    }

    fn underlying(&self) -> &T {
        self.0
    }

    fn into_returned(self) -> NotPresent {
        NotPresent
    }
}

impl<T: Copy + 'static> StorageMut for SingleMut<'_, T> {
    fn as_mut_slice(&mut self) -> &mut [T] {
        std::slice::from_mut(self.0)
    }

    fn underlying_mut(&mut self) -> &mut T {
        self.0
    }
}

impl<T: Copy + 'static> SingleStorage for SingleMut<'_, T> {
    fn get(&self) -> T {
        *self.0
    }
}

impl<T: Copy + 'static, A: AllocationSource> Storage for SingleOwned<T, A> {
    type Elem = T;
    type Target = T;
    type Returned = Present<T>;
    type DefaultPolicy = NoResize;

    const OWNERSHIP: Ownership = Ownership::Owning;
    const ALLOCATION: Allocation = A::ALLOCATION;
    const MODIFIABLE: bool = true;
    const CATEGORY: ValueCategory = ValueCategory::Single;

    fn as_slice(&self) -> &[T] {
        std::slice::from_ref(&self.value)
    }

    fn underlying(&self) -> &T {
        &self.value
    }

    fn into_returned(self) -> Present<T> {
        Present(self.value)
    }
}

impl<T: Copy + 'static, A: AllocationSource> StorageMut for SingleOwned<T, A> {
    fn as_mut_slice(&mut self) -> &mut [T] {
        std::slice::from_mut(&mut self.value)
    }

    fn underlying_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Copy + 'static, A: AllocationSource> SingleStorage for SingleOwned<T, A> {
    fn get(&self) -> T {
        self.value
    }
}

impl<T: Copy + 'static> ExtractableStorage for SingleOwned<T, Library> {
    type Value = T;

    fn extract(self) -> T {
        self.value
    }
}

impl<T: Copy + 'static> Storage for Empty<T> {
    type Elem = T;
    type Target = [T];
    type Returned = NotPresent;
    type DefaultPolicy = NoResize;

    const OWNERSHIP: Ownership = Ownership::Owning;
    const ALLOCATION: Allocation = Allocation::Caller;
    const MODIFIABLE: bool = false;
    const CATEGORY: ValueCategory = ValueCategory::Empty;

    fn as_slice(&self) -> &[T] {
        &[]
    }

    fn underlying(&self) -> &[T] {
        &[]
    }

    fn into_returned(self) -> NotPresent {
        NotPresent
    }
}

// ============================================================================
// DataBuffer
// ============================================================================

/// One buffer argument of a wrapped operation.
pub struct DataBuffer<R, D, S, P> {
    storage: S,
    _marker: PhantomData<(R, D, P)>,
}

impl<R: Role, D: Direction, S: Storage, P: ResizePolicy> DataBuffer<R, D, S, P> {
    pub(crate) fn new(storage: S) -> Self {
        DataBuffer {
            storage,
            _marker: PhantomData,
        }
    }

    /// Pointer to the first element.
    pub fn data(&self) -> *const S::Elem {
        self.storage.as_slice().as_ptr()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.storage.as_slice().len()
    }

    /// The elements.
    pub fn as_slice(&self) -> &[S::Elem] {
        self.storage.as_slice()
    }

    /// The concrete storage.
    pub fn underlying(&self) -> &S::Target {
        self.storage.underlying()
    }

    /// Direction at run time; placeholders report `Ignored`.
    pub fn direction(&self) -> BufferDirection {
        if S::CATEGORY == ValueCategory::Empty {
            BufferDirection::Ignored
        } else {
            D::DIRECTION
        }
    }

    /// The resize policy.
    pub fn resize_policy(&self) -> ResizePolicyKind {
        P::KIND
    }

    /// Referencing or owning.
    pub fn ownership(&self) -> Ownership {
        S::OWNERSHIP
    }

    /// Caller or library allocated.
    pub fn allocation(&self) -> Allocation {
        S::ALLOCATION
    }

    /// Whether the storage may be written.
    pub fn is_modifiable(&self) -> bool {
        S::MODIFIABLE
    }

    /// Contiguous, single or empty.
    pub fn value_category(&self) -> ValueCategory {
        S::CATEGORY
    }

    /// True for the `ignore` placeholder.
    pub fn is_ignored(&self) -> bool {
        S::CATEGORY == ValueCategory::Empty
    }

    /// The element of a single-element buffer.
    pub fn get_single_element(&self) -> S::Elem
    where
        S: SingleStorage,
    {
        self.storage.get()
    }

    /// Take the storage out of a library-allocated buffer.
    pub fn extract(self) -> S::Value
    where
        S: ExtractableStorage,
    {
        self.storage.extract()
    }

    /// This buffer's contribution to the operation result.
    pub fn into_part(self) -> D::Part<S> {
        D::part(self.storage)
    }
}

impl<R: Role, D: Writable, S: StorageMut, P: ResizePolicy> DataBuffer<R, D, S, P> {
    /// The elements, writable.
    pub fn as_mut_slice(&mut self) -> &mut [S::Elem] {
        self.storage.as_mut_slice()
    }

    /// The concrete storage, writable.
    pub fn underlying_mut(&mut self) -> &mut S::Target {
        self.storage.underlying_mut()
    }

    /// Apply the resize policy against the size `required` computes.
    ///
    /// `required` runs at most once.
    pub fn resize_if_requested(&mut self, required: impl FnOnce() -> usize) -> Result<()>
    where
        P: ApplyPolicy<S>,
    {
        P::apply(&mut self.storage, required())
    }

    /// The same buffer under resize policy `Q`.
    pub fn with_policy<Q: ResizePolicy>(self) -> DataBuffer<R, D, S, Q> {
        DataBuffer::new(self.storage)
    }

    /// Always resize to the required size.
    pub fn resize_to_fit(self) -> DataBuffer<R, D, S, ResizeToFit>
    where
        S: ResizableStorage,
    {
        self.with_policy()
    }

    /// Grow when too small.
    pub fn grow_only(self) -> DataBuffer<R, D, S, GrowOnly>
    where
        S: ResizableStorage,
    {
        self.with_policy()
    }

    /// Never resize.
    pub fn no_resize(self) -> DataBuffer<R, D, S, NoResize> {
        self.with_policy()
    }
}

impl<R: Role, D, S, P> Parameter for DataBuffer<R, D, S, P> {
    type Role = R;
}

impl<R: Role, D: Direction, S: Storage, P: ResizePolicy> fmt::Debug for DataBuffer<R, D, S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("role", &R::PARAMETER)
            .field("direction", &self.direction())
            .field("ownership", &S::OWNERSHIP)
            .field("allocation", &S::ALLOCATION)
            .field("policy", &P::KIND)
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// What operations see
// ============================================================================

/// A buffer an operation reads.
pub trait InBuffer {
    /// Element type.
    type Elem: MpiDatatype;

    /// The elements to send.
    fn elements(&self) -> &[Self::Elem];

    /// True for the `ignore` placeholder.
    fn ignored(&self) -> bool;
}

impl<R, D, S, P> InBuffer for DataBuffer<R, D, S, P>
where
    R: Role,
    D: Direction,
    S: Storage,
    S::Elem: MpiDatatype,
    P: ResizePolicy,
{
    type Elem = S::Elem;

    fn elements(&self) -> &[S::Elem] {
        self.as_slice()
    }

    fn ignored(&self) -> bool {
        self.is_ignored()
    }
}

/// A buffer an operation writes.
#[diagnostic::on_unimplemented(
    message = "`{Self}` cannot receive data",
    note = "output buffers need writable storage: `&mut v`, a value moved in, or `alloc_new::<Vec<T>>()`"
)]
pub trait OutBuffer {
    /// Element type.
    type Elem: MpiDatatype;
    /// Contribution to the operation result.
    type Part: ResultPart;

    /// Current number of elements.
    fn len(&self) -> usize;

    /// True if the buffer holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for single-element storage, whose length is fixed at one.
    fn is_single(&self) -> bool;

    /// Apply the resize policy for `required` elements and return the
    /// writable elements.
    fn prepare(&mut self, required: usize) -> Result<&mut [Self::Elem]>;

    /// The elements, writable, without resizing.
    fn elements_mut(&mut self) -> &mut [Self::Elem];

    /// Hand the storage over to the result.
    fn finish(self) -> Self::Part;
}

impl<R, D, S, P> OutBuffer for DataBuffer<R, D, S, P>
where
    R: Role,
    D: Writable,
    S: StorageMut,
    S::Elem: MpiDatatype,
    P: ApplyPolicy<S>,
{
    type Elem = S::Elem;
    type Part = D::Part<S>;

    fn len(&self) -> usize {
        self.size()
    }

    fn is_single(&self) -> bool {
        S::CATEGORY == ValueCategory::Single
    }

    fn prepare(&mut self, required: usize) -> Result<&mut [S::Elem]> {
        self.resize_if_requested(|| required)?;
        Ok(self.as_mut_slice())
    }

    fn elements_mut(&mut self) -> &mut [S::Elem] {
        self.as_mut_slice()
    }

    fn finish(self) -> D::Part<S> {
        self.into_part()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{alloc_new, ignore, recv_buf, send_buf, send_recv_buf};
    use crate::roles;

    #[test]
    fn referencing_input_exposes_caller_storage() {
        let data = [4u16, 5, 6];
        let buffer = send_buf(&data);
        assert_eq!(buffer.data(), data.as_ptr());
        assert_eq!(buffer.size(), 3);
        assert_eq!(buffer.ownership(), Ownership::Referencing);
        assert_eq!(buffer.allocation(), Allocation::Caller);
        assert!(!buffer.is_modifiable());
        assert_eq!(buffer.underlying(), &[4, 5, 6]);
    }

    #[test]
    fn no_resize_checks_without_touching() {
        let mut out = vec![0i32; 2];
        let mut buffer = recv_buf(&mut out);
        assert_eq!(buffer.resize_policy(), ResizePolicyKind::NoResize);
        buffer.resize_if_requested(|| 2).unwrap();
        let err = buffer.resize_if_requested(|| 3).unwrap_err();
        assert!(matches!(
            err,
            Error::SizePolicyViolated {
                required: 3,
                actual: 2
            }
        ));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn grow_only_never_shrinks() {
        let mut out = vec![7i32; 4];
        let mut buffer = recv_buf(&mut out).grow_only();
        buffer.resize_if_requested(|| 2).unwrap();
        assert_eq!(buffer.size(), 4);
        buffer.resize_if_requested(|| 6).unwrap();
        assert_eq!(buffer.size(), 6);
        assert_eq!(out, vec![7, 7, 7, 7, 0, 0]);
    }

    #[test]
    fn size_function_runs_once() {
        let mut calls = 0;
        let mut buffer = recv_buf(alloc_new::<Vec<f64>>());
        buffer
            .resize_if_requested(|| {
                calls += 1;
                3
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(buffer.size(), 3);
    }

    #[test]
    fn library_allocation_is_extractable() {
        let mut buffer = recv_buf(alloc_new::<Vec<u8>>());
        assert_eq!(buffer.allocation(), Allocation::Library);
        buffer.resize_if_requested(|| 2).unwrap();
        buffer.as_mut_slice().copy_from_slice(&[1, 2]);
        assert_eq!(buffer.extract(), vec![1, 2]);
    }

    #[test]
    fn single_elements() {
        let value = 42i64;
        assert_eq!(send_buf(&value).get_single_element(), 42);
        assert_eq!(send_buf(9u8).value_category(), ValueCategory::Single);

        let mut slot = 0i64;
        let mut buffer = send_recv_buf(&mut slot);
        assert_eq!(buffer.direction(), BufferDirection::InOut);
        buffer.as_mut_slice()[0] = 5;
        assert_eq!(buffer.get_single_element(), 5);
        assert!(buffer.resize_if_requested(|| 2).is_err());
    }

    #[test]
    fn ignored_buffers_report_no_elements() {
        let buffer = send_buf(ignore::<i32>());
        assert!(buffer.is_ignored());
        assert_eq!(buffer.direction(), BufferDirection::Ignored);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn moved_in_outputs_are_returned() {
        let buffer = recv_buf(vec![0u32; 3]);
        assert_eq!(buffer.allocation(), Allocation::Caller);
        let Present(returned) = buffer.into_part();
        assert_eq!(returned, vec![0, 0, 0]);

        let input = send_buf(vec![1u32]);
        let NotPresent = input.into_part();
    }

    #[test]
    fn debug_names_the_role() {
        let data = [1i32];
        let text = format!("{:?}", send_buf(&data));
        assert!(text.contains("SendBuf"), "{text}");
        assert_eq!(send_buf(&data).parameter_type(), roles::SendBuf::PARAMETER);
    }
}
