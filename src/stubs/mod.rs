//! Ahead-of-time marshal stubs and the per-type cache that resolves them.
//!
//! A [`StubSource`] knows which stubs exist for a type (a static table, or symbols exported
//! by a native library). [`StubRegistry`] sits in front of it and memoizes the answer per
//! type.
//!
//! ## Concurrency
//!
//! The registry is meant to be shared (`Arc<StubRegistry>`) between threads. Lookups of
//! cached types only take a shard read lock. A miss takes the shard write lock for the
//! duration of [`StubSource::resolve`], so each type is materialized at most once even when
//! many threads miss at the same time. `resolve` must therefore not call back into the
//! registry.
use crate::types::TypeHandle;
use dashmap::DashMap;
use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

mod library;
mod native;
mod table;

pub use library::LibraryStubSource;
pub use native::{DestroyStubFn, MarshalStubFn, NativeStub, STUB_SUCCESS};
pub use table::StaticStubSource;

/// The stubs available for one type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarshalStubSet {
    pub marshal: Option<NativeStub>,
    pub unmarshal: Option<NativeStub>,
    pub destroy: Option<NativeStub>,
    /// The type has no marshaling metadata at all.
    pub invalid_layout: bool,
}

impl MarshalStubSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalid_layout() -> Self {
        Self {
            invalid_layout: true,
            ..Self::default()
        }
    }

    pub fn with_marshal(mut self, f: MarshalStubFn) -> Self {
        self.marshal = Some(NativeStub::marshal(f));
        self
    }

    pub fn with_unmarshal(mut self, f: MarshalStubFn) -> Self {
        self.unmarshal = Some(NativeStub::marshal(f));
        self
    }

    pub fn with_destroy(mut self, f: DestroyStubFn) -> Self {
        self.destroy = Some(NativeStub::destroy(f));
        self
    }
}

/// How a marshal or unmarshal is carried out for a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyDispatch {
    RawCopy,
    Stub(NativeStub),
}

impl CopyDispatch {
    /// Blittable types fall back to a raw copy, everything else needs a stub. `None` means a
    /// required stub is missing.
    pub fn new(blittable: bool, stub: Option<NativeStub>) -> Option<Self> {
        match (stub, blittable) {
            (Some(s), _) => Some(CopyDispatch::Stub(s)),
            (None, true) => Some(CopyDispatch::RawCopy),
            (None, false) => None,
        }
    }
}

/// How a native buffer's sub-resources are released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseDispatch {
    NotRequired,
    Stub(NativeStub),
}

impl ReleaseDispatch {
    pub fn new(stub: Option<NativeStub>) -> Self {
        stub.map_or(ReleaseDispatch::NotRequired, ReleaseDispatch::Stub)
    }
}

/// Supplies stub entry points from ahead-of-time metadata.
pub trait StubSource: Send + Sync {
    fn resolve(&self, ty: &TypeHandle) -> MarshalStubSet;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStat {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
}

impl Display for CacheStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits: {:>8}, misses: {:>8}, hit_rate: {:>6.2}%, size: {:>8}",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.size
        )
    }
}

pub struct StubRegistry {
    source: Arc<dyn StubSource>,
    cache: DashMap<TypeHandle, MarshalStubSet>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StubRegistry {
    pub fn new(source: Arc<dyn StubSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A registry that knows no stubs; every type is treated as raw-copy or unmarshalable.
    pub fn empty() -> Self {
        Self::new(Arc::new(StaticStubSource::new()))
    }

    fn stubs_for(&self, ty: &TypeHandle) -> MarshalStubSet {
        if let Some(set) = self.cache.get(ty) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return *set;
        }
        *self.cache.entry(ty.clone()).or_insert_with(|| {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let set = self.source.resolve(ty);
            tracing::debug!(
                "resolved stubs for {}: marshal={:?} unmarshal={:?} destroy={:?} invalid_layout={}",
                ty.name(),
                set.marshal,
                set.unmarshal,
                set.destroy,
                set.invalid_layout
            );
            set
        })
    }

    pub fn try_marshal_stub(&self, ty: &TypeHandle) -> Option<NativeStub> {
        self.stubs_for(ty).marshal
    }

    pub fn try_unmarshal_stub(&self, ty: &TypeHandle) -> Option<NativeStub> {
        self.stubs_for(ty).unmarshal
    }

    /// The destroy stub, and whether the type lacks marshaling metadata entirely.
    pub fn destroy_stub(&self, ty: &TypeHandle) -> (Option<NativeStub>, bool) {
        let set = self.stubs_for(ty);
        (set.destroy, set.invalid_layout)
    }

    /// Resolves and caches the stubs for `ty` ahead of first use.
    pub fn prelink(&self, ty: &TypeHandle) {
        self.stubs_for(ty);
    }

    pub fn cache_stats(&self) -> CacheStat {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStat {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size: self.cache.len(),
        }
    }
}
