use super::{MarshalStubSet, StubSource};
use crate::types::TypeHandle;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory stub table keyed by type name. Types without an entry get an empty set.
#[derive(Default)]
pub struct StaticStubSource {
    entries: DashMap<String, MarshalStubSet>,
    resolutions: AtomicUsize,
}

impl StaticStubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, type_name: impl Into<String>, stubs: MarshalStubSet) {
        self.entries.insert(type_name.into(), stubs);
    }

    /// How many times `resolve` has been asked, cached or not.
    pub fn resolution_count(&self) -> usize {
        self.resolutions.load(Ordering::Acquire)
    }
}

impl StubSource for StaticStubSource {
    fn resolve(&self, ty: &TypeHandle) -> MarshalStubSet {
        self.resolutions.fetch_add(1, Ordering::AcqRel);
        self.entries
            .get(ty.name())
            .map(|s| *s)
            .unwrap_or_default()
    }
}
