//! MPI datatype trait, type categories and the datatype registry.
//!
//! [`MpiDatatype`] maps a Rust element type to a transport datatype. Primitive
//! types map to predefined datatypes; aggregates either travel as a
//! contiguous run of bytes ([`impl_contiguous_datatype!`]) or as a struct
//! datatype built from their field layout ([`impl_struct_datatype!`]).
//!
//! # Supported Types
//!
//! | Rust Type      | MPI Equivalent           | Category  |
//! |----------------|--------------------------|-----------|
//! | `i8`..`i64`    | `MPI_INT8_T`..`MPI_INT64_T` | Integer |
//! | `u8`..`u64`    | `MPI_UINT8_T`..`MPI_UINT64_T` | Integer |
//! | `isize`/`usize`| 64-bit integers          | Integer   |
//! | `f32`, `f64`   | `MPI_FLOAT`, `MPI_DOUBLE` | Floating |
//! | `bool`         | `MPI_C_BOOL`             | Logical   |
//! | `char`         | `MPI_UINT32_T`           | Character |
//! | [`Complex<f32>`], [`Complex<f64>`] | `MPI_C_FLOAT_COMPLEX`, `MPI_C_DOUBLE_COMPLEX` | Complex |
//!
//! Derived datatypes are built on first use, cached per element type in the
//! [`DatatypeRegistry`] and freed before the transport is finalized.

use crate::error::{Error, Result};
use crate::transport::{RawDatatype, Transport};
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Add, Mul};

/// Predefined datatypes.
///
/// These discriminants must stay in sync with the `MPIPARAMS_TYPE_*` defines
/// in `csrc/mpiparams.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BuiltinType {
    /// `MPI_INT8_T`
    I8 = 0,
    /// `MPI_INT16_T`
    I16 = 1,
    /// `MPI_INT32_T`
    I32 = 2,
    /// `MPI_INT64_T`
    I64 = 3,
    /// `MPI_UINT8_T`
    U8 = 4,
    /// `MPI_UINT16_T`
    U16 = 5,
    /// `MPI_UINT32_T`
    U32 = 6,
    /// `MPI_UINT64_T`
    U64 = 7,
    /// `MPI_FLOAT`
    F32 = 8,
    /// `MPI_DOUBLE`
    F64 = 9,
    /// `MPI_C_BOOL`
    Bool = 10,
    /// Unicode scalar value, carried as `MPI_UINT32_T`
    Char = 11,
    /// `MPI_BYTE`
    Byte = 12,
    /// `MPI_C_FLOAT_COMPLEX`
    ComplexF32 = 13,
    /// `MPI_C_DOUBLE_COMPLEX`
    ComplexF64 = 14,
}

impl BuiltinType {
    /// Every predefined datatype, in discriminant order.
    pub const ALL: [BuiltinType; 15] = [
        BuiltinType::I8,
        BuiltinType::I16,
        BuiltinType::I32,
        BuiltinType::I64,
        BuiltinType::U8,
        BuiltinType::U16,
        BuiltinType::U32,
        BuiltinType::U64,
        BuiltinType::F32,
        BuiltinType::F64,
        BuiltinType::Bool,
        BuiltinType::Char,
        BuiltinType::Byte,
        BuiltinType::ComplexF32,
        BuiltinType::ComplexF64,
    ];

    /// Category of this datatype.
    pub fn category(self) -> TypeCategory {
        match self {
            BuiltinType::I8
            | BuiltinType::I16
            | BuiltinType::I32
            | BuiltinType::I64
            | BuiltinType::U8
            | BuiltinType::U16
            | BuiltinType::U32
            | BuiltinType::U64 => TypeCategory::Integer,
            BuiltinType::F32 | BuiltinType::F64 => TypeCategory::Floating,
            BuiltinType::Bool => TypeCategory::Logical,
            BuiltinType::Char => TypeCategory::Character,
            BuiltinType::Byte => TypeCategory::Byte,
            BuiltinType::ComplexF32 | BuiltinType::ComplexF64 => TypeCategory::Complex,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            BuiltinType::I8 | BuiltinType::U8 | BuiltinType::Bool | BuiltinType::Byte => 1,
            BuiltinType::I16 | BuiltinType::U16 => 2,
            BuiltinType::I32 | BuiltinType::U32 | BuiltinType::F32 | BuiltinType::Char => 4,
            BuiltinType::I64 | BuiltinType::U64 | BuiltinType::F64 | BuiltinType::ComplexF32 => 8,
            BuiltinType::ComplexF64 => 16,
        }
    }

    /// Look a datatype up by its discriminant.
    pub fn from_raw(raw: i32) -> Option<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

/// Classification of element types, which decides the builtin reduction
/// operators available for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    /// Signed and unsigned integers
    Integer,
    /// Floating point numbers
    Floating,
    /// Booleans
    Logical,
    /// Raw bytes
    Byte,
    /// Complex numbers
    Complex,
    /// Aggregates (contiguous or struct layouts)
    Struct,
    /// Characters
    Character,
}

/// How a type is described to the transport.
#[derive(Debug, Clone, Copy)]
pub enum DatatypeKind {
    /// A predefined datatype
    Builtin(BuiltinType),
    /// `size_of::<T>()` bytes, as a contiguous datatype of `MPI_BYTE`
    Contiguous,
    /// A struct datatype built from the returned layout
    Struct(fn() -> StructLayout),
}

/// Trait for types that can be used in MPI communication operations.
///
/// # Safety
///
/// The datatype described by [`KIND`](Self::KIND) must cover exactly the
/// bytes of a value of `Self`, and every bit pattern the transport may write
/// into those bytes must be a valid `Self`. Use [`impl_contiguous_datatype!`]
/// or [`impl_struct_datatype!`] rather than implementing this by hand.
///
/// # Example
///
/// ```
/// use mpiparams::{MpiDatatype, TypeCategory};
///
/// assert_eq!(f64::category(), TypeCategory::Floating);
/// assert_eq!(i32::category(), TypeCategory::Integer);
/// ```
pub unsafe trait MpiDatatype: Copy + 'static {
    /// How the type is described to the transport.
    const KIND: DatatypeKind;

    /// The category the type belongs to.
    fn category() -> TypeCategory {
        match Self::KIND {
            DatatypeKind::Builtin(builtin) => builtin.category(),
            DatatypeKind::Contiguous | DatatypeKind::Struct(_) => TypeCategory::Struct,
        }
    }
}

macro_rules! impl_mpi_datatype {
    ($($ty:ty => $builtin:expr),* $(,)?) => {
        $(
            unsafe impl MpiDatatype for $ty {
                const KIND: DatatypeKind = DatatypeKind::Builtin($builtin);
            }
        )*
    };
}

impl_mpi_datatype! {
    i8 => BuiltinType::I8,
    i16 => BuiltinType::I16,
    i32 => BuiltinType::I32,
    i64 => BuiltinType::I64,
    u8 => BuiltinType::U8,
    u16 => BuiltinType::U16,
    u32 => BuiltinType::U32,
    u64 => BuiltinType::U64,
    f32 => BuiltinType::F32,
    f64 => BuiltinType::F64,
    bool => BuiltinType::Bool,
    char => BuiltinType::Char,
    Complex<f32> => BuiltinType::ComplexF32,
    Complex<f64> => BuiltinType::ComplexF64,
}

#[cfg(target_pointer_width = "64")]
impl_mpi_datatype! {
    isize => BuiltinType::I64,
    usize => BuiltinType::U64,
}

#[cfg(target_pointer_width = "32")]
impl_mpi_datatype! {
    isize => BuiltinType::I32,
    usize => BuiltinType::U32,
}

/// A complex number laid out as C's `float _Complex` / `double _Complex`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Complex<T> {
    /// Real part
    pub re: T,
    /// Imaginary part
    pub im: T,
}

impl<T> Complex<T> {
    /// Create a complex number from its parts.
    pub const fn new(re: T, im: T) -> Self {
        Complex { re, im }
    }
}

impl<T: Add<Output = T>> Add for Complex<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl<T> Mul for Complex<T>
where
    T: Copy + Add<Output = T> + Mul<Output = T> + std::ops::Sub<Output = T>,
{
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

/// Field layout of a struct datatype.
#[derive(Debug, Clone)]
pub struct StructLayout {
    extent: usize,
    fields: Vec<FieldLayout>,
}

impl StructLayout {
    /// Start a layout for a type whose values span `extent` bytes.
    pub fn new(extent: usize) -> Self {
        StructLayout {
            extent,
            fields: Vec::new(),
        }
    }

    /// Add a field of type `F` at byte `offset`.
    pub fn field<F: MpiDatatype>(mut self, offset: usize) -> Self {
        self.fields.push(FieldLayout {
            offset,
            count: 1,
            resolve: resolve_datatype::<F>,
        });
        self
    }

    /// Add a fixed-size array field `[F; count]` at byte `offset`.
    pub fn array_field<F: MpiDatatype>(mut self, offset: usize, count: usize) -> Self {
        self.fields.push(FieldLayout {
            offset,
            count,
            resolve: resolve_datatype::<F>,
        });
        self
    }

    /// Number of bytes between consecutive values.
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if no fields were added.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

type Resolver = fn(&DatatypeRegistry, &dyn Transport) -> Result<RawDatatype>;

#[derive(Debug, Clone, Copy)]
struct FieldLayout {
    offset: usize,
    count: usize,
    resolve: Resolver,
}

fn resolve_datatype<T: MpiDatatype>(
    registry: &DatatypeRegistry,
    transport: &dyn Transport,
) -> Result<RawDatatype> {
    registry.datatype::<T>(transport)
}

/// Registers a `Copy` aggregate as a contiguous run of bytes.
///
/// The type travels as `size_of::<T>()` bytes; it carries the
/// [`TypeCategory::Struct`] category, so only user-defined reduction
/// operators apply to it.
///
/// # Example
///
/// ```
/// #[derive(Clone, Copy, Default)]
/// #[repr(C)]
/// struct TopK {
///     values: [i32; 4],
/// }
///
/// mpiparams::impl_contiguous_datatype!(TopK);
/// ```
#[macro_export]
macro_rules! impl_contiguous_datatype {
    ($($ty:ty),+ $(,)?) => {
        $(
            unsafe impl $crate::MpiDatatype for $ty {
                const KIND: $crate::DatatypeKind = $crate::DatatypeKind::Contiguous;
            }
            $crate::impl_scalar_parameters!($ty);
        )+
    };
}

/// Registers a `Copy` struct through its field layout.
///
/// Every listed field type must itself implement [`MpiDatatype`]. Fields not
/// listed are not transferred.
///
/// # Example
///
/// ```
/// #[derive(Clone, Copy, Default)]
/// #[repr(C)]
/// struct Particle {
///     position: f64,
///     id: i32,
/// }
///
/// mpiparams::impl_struct_datatype!(Particle { position: f64, id: i32 });
/// ```
#[macro_export]
macro_rules! impl_struct_datatype {
    ($ty:ident { $($field:ident : $fty:ty),+ $(,)? }) => {
        unsafe impl $crate::MpiDatatype for $ty {
            const KIND: $crate::DatatypeKind = $crate::DatatypeKind::Struct(|| {
                $crate::StructLayout::new(::std::mem::size_of::<$ty>())
                    $(.field::<$fty>(::std::mem::offset_of!($ty, $field)))+
            });
        }
        $crate::impl_scalar_parameters!($ty);
    };
}

/// Caches the datatype handle of every element type used so far.
///
/// Predefined datatypes are looked up directly; derived ones are built,
/// committed and cached on first use and freed by
/// [`free_all`](Self::free_all).
#[derive(Debug, Default)]
pub struct DatatypeRegistry {
    derived: RefCell<HashMap<TypeId, RawDatatype>>,
}

impl DatatypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The datatype of `T`, building it if necessary.
    pub fn datatype<T: MpiDatatype>(&self, transport: &dyn Transport) -> Result<RawDatatype> {
        let layout = match T::KIND {
            DatatypeKind::Builtin(builtin) => return Ok(transport.builtin_datatype(builtin)),
            DatatypeKind::Contiguous => None,
            DatatypeKind::Struct(layout) => Some(layout()),
        };

        let key = TypeId::of::<T>();
        if let Some(&datatype) = self.derived.borrow().get(&key) {
            return Ok(datatype);
        }

        let datatype = match layout {
            None => {
                let size = i32::try_from(std::mem::size_of::<T>()).map_err(|_| {
                    Error::InvalidArgument(format!(
                        "type {} is too large for a contiguous datatype",
                        std::any::type_name::<T>()
                    ))
                })?;
                let byte = transport.builtin_datatype(BuiltinType::Byte);
                transport.type_contiguous(size, byte)?
            }
            Some(layout) => self.build_struct(&layout, transport)?,
        };
        transport.type_commit(datatype)?;
        tracing::debug!(
            ty = std::any::type_name::<T>(),
            handle = datatype.0,
            "registered derived datatype"
        );
        self.derived.borrow_mut().insert(key, datatype);
        Ok(datatype)
    }

    fn build_struct(&self, layout: &StructLayout, transport: &dyn Transport) -> Result<RawDatatype> {
        if layout.is_empty() {
            return Err(Error::InvalidArgument(
                "struct datatype needs at least one field".into(),
            ));
        }
        let mut blocklengths = Vec::with_capacity(layout.len());
        let mut displacements = Vec::with_capacity(layout.len());
        let mut types = Vec::with_capacity(layout.len());
        for field in &layout.fields {
            blocklengths.push(i32::try_from(field.count).map_err(|_| {
                Error::InvalidArgument(format!("array field of {} elements", field.count))
            })?);
            displacements.push(field.offset as isize);
            types.push((field.resolve)(self, transport)?);
        }
        transport.type_create_struct(&blocklengths, &displacements, &types, layout.extent as isize)
    }

    /// Number of derived datatypes currently registered.
    pub fn len(&self) -> usize {
        self.derived.borrow().len()
    }

    /// True if no derived datatype is registered.
    pub fn is_empty(&self) -> bool {
        self.derived.borrow().is_empty()
    }

    /// Free every derived datatype. Must run before the transport is finalized.
    pub fn free_all(&self, transport: &dyn Transport) {
        for (_, datatype) in self.derived.borrow_mut().drain() {
            if let Err(err) = transport.type_free(datatype) {
                tracing::warn!(handle = datatype.0, %err, "failed to free derived datatype");
            } else {
                tracing::debug!(handle = datatype.0, "freed derived datatype");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;

    #[derive(Clone, Copy, Default, Debug, PartialEq)]
    #[repr(C)]
    struct Pair {
        left: f64,
        right: i32,
    }

    crate::impl_struct_datatype!(Pair { left: f64, right: i32 });

    #[derive(Clone, Copy, Default, Debug, PartialEq)]
    #[repr(C)]
    struct Blob {
        bytes: [u8; 12],
    }

    crate::impl_contiguous_datatype!(Blob);

    #[test]
    fn builtin_values_match_c_defines() {
        for (i, ty) in BuiltinType::ALL.iter().enumerate() {
            assert_eq!(*ty as i32, i as i32, "{ty:?} should have value {i}");
            assert_eq!(BuiltinType::from_raw(i as i32), Some(*ty));
        }
        assert_eq!(BuiltinType::from_raw(15), None);
        assert_eq!(BuiltinType::from_raw(-1), None);
    }

    #[test]
    fn builtin_sizes_match_rust_types() {
        assert_eq!(BuiltinType::I16.size(), std::mem::size_of::<i16>());
        assert_eq!(BuiltinType::Char.size(), std::mem::size_of::<char>());
        assert_eq!(BuiltinType::Bool.size(), std::mem::size_of::<bool>());
        assert_eq!(
            BuiltinType::ComplexF64.size(),
            std::mem::size_of::<Complex<f64>>()
        );
    }

    #[test]
    fn categories() {
        assert_eq!(u64::category(), TypeCategory::Integer);
        assert_eq!(f32::category(), TypeCategory::Floating);
        assert_eq!(bool::category(), TypeCategory::Logical);
        assert_eq!(char::category(), TypeCategory::Character);
        assert_eq!(Complex::<f64>::category(), TypeCategory::Complex);
        assert_eq!(Pair::category(), TypeCategory::Struct);
        assert_eq!(Blob::category(), TypeCategory::Struct);
    }

    #[test]
    fn registry_caches_derived_datatypes() {
        let transport = LocalTransport::single();
        let registry = DatatypeRegistry::new();

        let builtin = registry.datatype::<i32>(&transport).unwrap();
        assert_eq!(builtin, transport.builtin_datatype(BuiltinType::I32));
        assert!(registry.is_empty(), "builtin types are never cached");

        let pair = registry.datatype::<Pair>(&transport).unwrap();
        let again = registry.datatype::<Pair>(&transport).unwrap();
        assert_eq!(pair, again);
        assert_eq!(
            transport.type_size(pair).unwrap(),
            std::mem::size_of::<Pair>()
        );

        let blob = registry.datatype::<Blob>(&transport).unwrap();
        assert_ne!(pair, blob);
        assert_eq!(transport.type_size(blob).unwrap(), 12);
        assert_eq!(registry.len(), 2);

        registry.free_all(&transport);
        assert!(registry.is_empty());
    }

    #[test]
    fn complex_arithmetic() {
        let a = Complex::new(1.0f64, 2.0);
        let b = Complex::new(3.0f64, -1.0);
        assert_eq!(a + b, Complex::new(4.0, 1.0));
        assert_eq!(a * b, Complex::new(5.0, 5.0));
    }
}
