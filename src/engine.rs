//! Conversion of managed values to and from native buffers.
//!
//! Every call is self-contained: the engine keeps no per-call state, and the only shared
//! mutable resource it touches is the [`StubRegistry`] cache. Values are pinned only for
//! the duration of a raw copy or stub invocation.
use crate::{
    config::MarshalConfig,
    error::{MarshalError, MarshalResult},
    heap::{CoTaskMemHeap, NativeAllocator},
    legacy::LegacyScalarAccess,
    pointer::NativePtr,
    stubs::{CopyDispatch, ReleaseDispatch, StubRegistry, STUB_SUCCESS},
    types::{LayoutClass, TypeHandle, TypeInfoProvider},
    value::{DefaultPinning, ManagedValue, PinningService},
};
use std::{mem::size_of, ptr, sync::Arc};
use tracing::{debug, trace, warn};

pub struct MarshalEngine {
    types: Arc<dyn TypeInfoProvider>,
    stubs: Arc<StubRegistry>,
    pinning: Arc<dyn PinningService>,
    heap: Arc<dyn NativeAllocator>,
    config: MarshalConfig,
}

impl MarshalEngine {
    pub fn new(types: Arc<dyn TypeInfoProvider>, stubs: Arc<StubRegistry>) -> Self {
        Self {
            types,
            stubs,
            pinning: Arc::new(DefaultPinning),
            heap: Arc::new(CoTaskMemHeap::new()),
            config: MarshalConfig::default(),
        }
    }

    pub fn with_pinning(mut self, pinning: Arc<dyn PinningService>) -> Self {
        self.pinning = pinning;
        self
    }

    /// Allocator for the temporary buffers of the legacy read path.
    pub fn with_heap(mut self, heap: Arc<dyn NativeAllocator>) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_config(mut self, config: MarshalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn types(&self) -> &dyn TypeInfoProvider {
        &*self.types
    }

    pub fn stubs(&self) -> &StubRegistry {
        &self.stubs
    }

    pub fn heap(&self) -> &dyn NativeAllocator {
        &*self.heap
    }

    pub fn config(&self) -> &MarshalConfig {
        &self.config
    }

    pub fn legacy(&self) -> LegacyScalarAccess<'_> {
        LegacyScalarAccess::new(self)
    }

    fn require_closed(&self, ty: &TypeHandle, param: &'static str) -> MarshalResult<()> {
        if self.types.is_generic(ty) {
            return Err(MarshalError::generic_type(param, ty.name()));
        }
        Ok(())
    }

    fn require_layout(&self, ty: &TypeHandle, param: &'static str) -> MarshalResult<()> {
        if self.types.layout_class(ty) == LayoutClass::Invalid {
            return Err(MarshalError::missing_layout(param, ty.name()));
        }
        Ok(())
    }

    fn check_status(&self, ty: &TypeHandle, what: &str, status: i32) -> MarshalResult<()> {
        trace!("{} stub for {} returned {}", what, ty.name(), status);
        if status != STUB_SUCCESS {
            debug!("{} stub for {} failed with status {}", what, ty.name(), status);
            return Err(MarshalError::MarshalFailure {
                type_name: ty.name().to_string(),
                status,
            });
        }
        Ok(())
    }

    fn check_capacity(&self, value: &ManagedValue, size: usize) -> MarshalResult<()> {
        if value.field_size() < size {
            return Err(MarshalError::invalid_argument(
                "structure",
                format!(
                    "'{}' instance holds {} field bytes but its native size is {}",
                    value.type_handle().name(),
                    value.field_size(),
                    size
                ),
            ));
        }
        Ok(())
    }

    fn check_alignment(&self, buffer: NativePtr, ty: &TypeHandle) {
        if !self.config.validate_alignment {
            return;
        }
        let align = self.types.native_alignment(ty);
        if !buffer.is_aligned_to(align) {
            warn!(
                "native buffer {:?} for {} is not aligned to {} bytes",
                buffer,
                ty.name(),
                align
            );
        }
    }

    /// Pins `value` and hands `f` the address of its first field.
    fn with_field_start(
        &self,
        value: &ManagedValue,
        mut f: impl FnMut(NativePtr) -> MarshalResult<()>,
    ) -> MarshalResult<()> {
        let displacement = value.field_start_displacement() * size_of::<usize>();
        self.pinning.with_pinned(value, &mut |base| {
            // SAFETY: storage is `displacement` header bytes followed by the fields.
            let fields = unsafe { base.byte_add(displacement) };
            f(fields)
        })
    }

    /// Size in bytes of the native representation of `ty`.
    pub fn native_size(&self, ty: &TypeHandle) -> MarshalResult<usize> {
        self.require_closed(ty, "t")?;
        self.types.native_size(ty)
    }

    pub fn size_of_value<'a>(
        &self,
        value: impl Into<Option<&'a ManagedValue>>,
    ) -> MarshalResult<usize> {
        let value = value
            .into()
            .ok_or_else(|| MarshalError::null_argument("structure"))?;
        self.native_size(value.type_handle())
    }

    /// Byte offset of `field_name` in the native representation of `ty`.
    pub fn field_offset(&self, ty: &TypeHandle, field_name: &str) -> MarshalResult<usize> {
        if field_name.is_empty() {
            return Err(MarshalError::null_argument("fieldName"));
        }
        self.require_closed(ty, "t")?;
        self.types.field_offset(ty, field_name)
    }

    /// Whether `value` can be pinned and handed out by address as-is.
    pub fn is_pinnable<'a>(&self, value: impl Into<Option<&'a ManagedValue>>) -> bool {
        value
            .into()
            .map_or(true, |v| self.types.is_blittable(v.type_handle()))
    }

    /// Resolves the stubs of `ty` now rather than on first use.
    pub fn prelink(&self, ty: &TypeHandle) -> MarshalResult<()> {
        self.require_closed(ty, "t")?;
        self.stubs.prelink(ty);
        Ok(())
    }

    /// Writes the native representation of `value` into `dest`.
    ///
    /// With `delete_old`, whatever was previously marshaled into `dest` is destroyed first
    /// so its native sub-resources are not leaked. If a stub fails, `dest` may be partially
    /// written; cleaning it up is the caller's job.
    ///
    /// # Safety
    ///
    /// `dest` must be null or valid for writes of `native_size` bytes. With `delete_old`, it
    /// must hold a value previously marshaled for the same type.
    pub unsafe fn to_native<'a>(
        &self,
        value: impl Into<Option<&'a ManagedValue>>,
        dest: NativePtr,
        delete_old: bool,
    ) -> MarshalResult<()> {
        let value = value
            .into()
            .ok_or_else(|| MarshalError::null_argument("structure"))?;
        if dest.is_null() {
            return Err(MarshalError::null_argument("ptr"));
        }
        let ty = value.type_handle();
        self.require_closed(ty, "structure")?;

        if delete_old {
            unsafe { self.destroy(dest, ty)? };
        }

        self.require_layout(ty, "structure")?;
        let blittable = self.types.is_blittable(ty);
        let dispatch = CopyDispatch::new(blittable, self.stubs.try_marshal_stub(ty))
            .ok_or_else(|| missing_stub(ty, "marshal"))?;
        trace!("to_native {} -> {:?} via {:?}", ty.name(), dest, dispatch);

        match dispatch {
            CopyDispatch::Stub(stub) => self.with_field_start(value, |fields| {
                // SAFETY: the stub was generated for this type; `dest` is vouched for by
                // the caller.
                let status = unsafe { stub.call_marshal(fields, dest) };
                self.check_status(ty, "marshal", status)
            }),
            CopyDispatch::RawCopy => {
                let size = self.types.native_size(ty)?;
                self.check_capacity(value, size)?;
                self.check_alignment(dest, ty);
                self.with_field_start(value, |fields| {
                    // SAFETY: the field region holds at least `size` bytes; `dest` is
                    // vouched for by the caller.
                    unsafe { ptr::copy_nonoverlapping(fields.as_ptr(), dest.as_ptr(), size) };
                    Ok(())
                })
            }
        }
    }

    fn populate(&self, src: NativePtr, target: &ManagedValue) -> MarshalResult<()> {
        let ty = target.type_handle();
        self.require_layout(ty, "structure")?;
        let blittable = self.types.is_blittable(ty);
        let dispatch = CopyDispatch::new(blittable, self.stubs.try_unmarshal_stub(ty))
            .ok_or_else(|| missing_stub(ty, "unmarshal"))?;
        trace!("from_native {:?} -> {} via {:?}", src, ty.name(), dispatch);

        match dispatch {
            CopyDispatch::Stub(stub) => self.with_field_start(target, |fields| {
                // SAFETY: as in `to_native`, with the roles of the buffers swapped.
                let status = unsafe { stub.call_marshal(src, fields) };
                self.check_status(ty, "unmarshal", status)
            }),
            CopyDispatch::RawCopy => {
                let size = self.types.native_size(ty)?;
                self.check_capacity(target, size)?;
                self.check_alignment(src, ty);
                self.with_field_start(target, |fields| {
                    // SAFETY: as in `to_native`.
                    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), fields.as_ptr(), size) };
                    Ok(())
                })
            }
        }
    }

    /// Reads a fresh instance of `ty` from `src`. Value types come back boxed.
    ///
    /// # Safety
    ///
    /// `src` must be null or valid for reads of `native_size(ty)` bytes holding a native
    /// representation of `ty`.
    pub unsafe fn from_native_new<'a>(
        &self,
        src: NativePtr,
        ty: impl Into<Option<&'a TypeHandle>>,
    ) -> MarshalResult<ManagedValue> {
        if src.is_null() {
            return Err(MarshalError::null_argument("ptr"));
        }
        let ty = ty
            .into()
            .ok_or_else(|| MarshalError::null_argument("structureType"))?;
        self.require_closed(ty, "structureType")?;
        if self.types.is_interface(ty) || self.types.is_delegate(ty) {
            return Err(MarshalError::invalid_argument(
                "structureType",
                format!("Cannot create an instance of '{}'.", ty.name()),
            ));
        }

        let value = ManagedValue::instantiate(ty);
        self.populate(src, &value)?;
        Ok(value)
    }

    /// Reads `src` into the existing instance `target`.
    ///
    /// Boxed value-type targets are only accepted when `allow_boxed_target` is set. Unboxed
    /// value-type storage and reference types are always accepted.
    ///
    /// # Safety
    ///
    /// As for [`MarshalEngine::from_native_new`], for the target's type.
    pub unsafe fn from_native_into<'a>(
        &self,
        src: NativePtr,
        target: impl Into<Option<&'a ManagedValue>>,
        allow_boxed_target: bool,
    ) -> MarshalResult<()> {
        if src.is_null() {
            return Err(MarshalError::null_argument("ptr"));
        }
        let target = target
            .into()
            .ok_or_else(|| MarshalError::null_argument("structure"))?;
        let ty = target.type_handle();
        if !allow_boxed_target && self.types.is_value_type(ty) && target.has_type_header() {
            return Err(MarshalError::invalid_argument(
                "structure",
                "The structure must not be a value class.",
            ));
        }
        self.require_closed(ty, "structure")?;
        self.populate(src, target)
    }

    /// Releases the native sub-resources held by a buffer previously filled by
    /// [`MarshalEngine::to_native`]. The buffer itself stays owned by the caller.
    ///
    /// A no-op for blittable types. Calling it twice on a stub-backed buffer is only safe if
    /// the type's destroy stub tolerates it.
    ///
    /// # Safety
    ///
    /// `buffer` must be null or hold a native representation of `ty`.
    pub unsafe fn destroy<'a>(
        &self,
        buffer: NativePtr,
        ty: impl Into<Option<&'a TypeHandle>>,
    ) -> MarshalResult<()> {
        if buffer.is_null() {
            return Err(MarshalError::null_argument("ptr"));
        }
        let ty = ty
            .into()
            .ok_or_else(|| MarshalError::null_argument("structuretype"))?;
        self.require_closed(ty, "t")?;

        if self.types.is_enum(ty) || self.types.is_interface(ty) || self.types.is_delegate(ty) {
            return Err(MarshalError::invalid_argument(
                "structuretype",
                format!(
                    "The specified structure '{}' must be blittable or have layout information.",
                    ty.name()
                ),
            ));
        }

        if self.types.is_blittable(ty) {
            return Ok(());
        }

        self.require_layout(ty, "structuretype")?;
        let (stub, invalid_layout) = self.stubs.destroy_stub(ty);
        if invalid_layout {
            return Err(MarshalError::missing_layout("structuretype", ty.name()));
        }

        match ReleaseDispatch::new(stub) {
            ReleaseDispatch::Stub(stub) => {
                trace!("destroy {} at {:?}", ty.name(), buffer);
                // SAFETY: the caller vouches that `buffer` holds a marshaled `ty`.
                let status = unsafe { stub.call_destroy(buffer) };
                self.check_status(ty, "destroy", status)
            }
            ReleaseDispatch::NotRequired => Ok(()),
        }
    }
}

fn missing_stub(ty: &TypeHandle, what: &str) -> MarshalError {
    MarshalError::invalid_argument(
        "structure",
        format!(
            "No {} stub is available for non-blittable type '{}'.",
            what,
            ty.name()
        ),
    )
}
