use super::{MarshalStubSet, NativeStub, StubSource};
use crate::{config::MarshalConfig, error::StubLoadError, types::TypeHandle};
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};

/// Resolves stubs exported by a native library. For a type `Ns.Point` the library is
/// expected to export `Ns_Point__marshal`, `Ns_Point__unmarshal` and `Ns_Point__destroy`,
/// plus `Ns_Point__invalid_layout` when the type has no marshaling metadata.
pub struct LibraryStubSource {
    name: String,
    library: Library,
}

fn find_library_path(root: &Path, name: &str) -> Option<PathBuf> {
    let exact = root.join(name);
    if exact.exists() {
        return Some(exact);
    }

    #[cfg(target_os = "linux")]
    let extensions = &[".so", ".dylib", ".dll"];
    #[cfg(target_os = "macos")]
    let extensions = &[".dylib", ".so", ".dll"];
    #[cfg(target_os = "windows")]
    let extensions = &[".dll", ".so", ".dylib"];
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    let extensions = &[".so", ".dll", ".dylib"];

    for prefix in ["", "lib"] {
        for ext in extensions {
            let path = root.join(format!("{}{}{}", prefix, name, ext));
            if path.exists() {
                return Some(path);
            }
        }
    }

    // versioned names, e.g. libstubs.so.1
    if let Ok(entries) = root.read_dir() {
        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name();
            let s = file_name.to_string_lossy();
            let stem = s.strip_prefix("lib").unwrap_or(&s);
            if stem.starts_with(name) && (s.contains(".so.") || s.contains(".dylib.")) {
                return Some(entry.path());
            }
        }
    }

    None
}

/// Symbol prefix for a type: every character outside `[A-Za-z0-9_]` becomes `_`.
pub(crate) fn symbol_prefix(type_name: &str) -> String {
    type_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl LibraryStubSource {
    pub fn open(root: impl AsRef<Path>, name: &str) -> Result<Self, StubLoadError> {
        let root = root.as_ref();
        let path = find_library_path(root, name)
            .ok_or_else(|| StubLoadError::LibraryNotFound(name.to_string()))?;

        tracing::debug!("loading stub library '{}' from {:?}", name, path);
        let library = unsafe { Library::new(&path) }
            .map_err(|e| StubLoadError::LoadError(name.to_string(), e.to_string()))?;
        tracing::debug!("loaded stub library '{}'", name);

        Ok(Self {
            name: name.to_string(),
            library,
        })
    }

    /// Opens the library named by the configuration, if one is configured.
    pub fn from_config(config: &MarshalConfig) -> Option<Result<Self, StubLoadError>> {
        config
            .stub_library
            .as_deref()
            .map(|name| Self::open(&config.stub_path, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, name: &str) -> Option<NativeStub> {
        let sym: Result<Symbol<unsafe extern "C" fn()>, _> =
            unsafe { self.library.get(name.as_bytes()) };
        match sym {
            Ok(sym) => Some(NativeStub::from_fun(*sym)),
            Err(_) => {
                tracing::trace!("'{}' does not export '{}'", self.name, name);
                None
            }
        }
    }
}

impl StubSource for LibraryStubSource {
    fn resolve(&self, ty: &TypeHandle) -> MarshalStubSet {
        let prefix = symbol_prefix(ty.name());
        MarshalStubSet {
            marshal: self.symbol(&format!("{}__marshal", prefix)),
            unmarshal: self.symbol(&format!("{}__unmarshal", prefix)),
            destroy: self.symbol(&format!("{}__destroy", prefix)),
            invalid_layout: self
                .symbol(&format!("{}__invalid_layout", prefix))
                .is_some(),
        }
    }
}
