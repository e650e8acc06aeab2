//! # dotnet-marshal
//!
//! Structure marshaling for P/Invoke interop: converts managed values to and from flat
//! native buffers.
//!
//! Blittable types are copied byte for byte. Everything else goes through marshal,
//! unmarshal and destroy stubs generated ahead of time and looked up per type through a
//! [`StubRegistry`]. Layout facts come from a [`TypeInfoProvider`].
//!
//! ```ignore
//! let types = Arc::new(TypeRegistry::new());
//! let point = types.define(
//!     TypeDecl::structure("Point")
//!         .field("x", FieldKind::Scalar(Scalar::Int32))
//!         .field("y", FieldKind::Scalar(Scalar::Int32)),
//! )?;
//! let engine = MarshalEngine::new(types, Arc::new(StubRegistry::empty()));
//!
//! let v = ManagedValue::instantiate(&point);
//! let mut buf = vec![0u8; engine.native_size(&point)?];
//! unsafe { engine.to_native(&v, NativePtr::from_slice(&mut buf), false)? };
//! ```
pub mod config;
pub mod engine;
pub mod error;
pub mod heap;
pub mod layout;
pub mod legacy;
pub mod pointer;
pub mod stubs;
pub mod types;
pub mod value;

pub use config::MarshalConfig;
pub use engine::MarshalEngine;
pub use error::{LayoutError, MarshalError, MarshalResult, StubLoadError};
pub use heap::{CoTaskMemHeap, NativeAllocator};
pub use layout::{FieldLayoutManager, HasLayout, LayoutManager, Scalar};
pub use legacy::{LegacyScalarAccess, ScalarWidth};
pub use pointer::NativePtr;
pub use stubs::{
    CopyDispatch, LibraryStubSource, MarshalStubSet, NativeStub, ReleaseDispatch,
    StaticStubSource, StubRegistry, StubSource,
};
pub use types::{
    FieldKind, GenericState, LayoutClass, TypeDecl, TypeHandle, TypeInfoProvider, TypeKind,
    TypeRegistry,
};
pub use value::{DefaultPinning, ManagedValue, PinGuard, PinningService};
