/// Configuration-specific tests for feature flags and environment-driven settings
use dotnet_marshal::{
    config::{STUB_LIBRARY_VAR, STUB_PATH_VAR, VALIDATE_ALIGNMENT_VAR},
    FieldKind, LibraryStubSource, ManagedValue, MarshalConfig, MarshalEngine, NativePtr, Scalar,
    StubLoadError, StubRegistry, TypeDecl, TypeRegistry,
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};

fn lookup(pairs: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<&str, &str> = pairs.iter().copied().collect();
    move |k| map.get(k).map(|v| v.to_string())
}

// ============================================================================
// Default configuration (no features)
// ============================================================================

#[test]
#[cfg(not(feature = "memory-validation"))]
fn test_alignment_validation_off_by_default() {
    assert!(!MarshalConfig::default().validate_alignment);
    let config = MarshalConfig::from_lookup(lookup(&[(VALIDATE_ALIGNMENT_VAR, "1")]));
    assert!(config.validate_alignment);
}

// ============================================================================
// Memory validation configuration (memory-validation feature)
// ============================================================================

#[test]
#[cfg(feature = "memory-validation")]
fn test_alignment_validation_forced_on() {
    assert!(MarshalConfig::default().validate_alignment);
    let config = MarshalConfig::from_lookup(lookup(&[(VALIDATE_ALIGNMENT_VAR, "false")]));
    assert!(config.validate_alignment);
}

// ============================================================================
// Common configuration behavior
// ============================================================================

#[test]
fn test_stub_library_settings() {
    let config = MarshalConfig::from_lookup(lookup(&[
        (STUB_PATH_VAR, "/opt/interop"),
        (STUB_LIBRARY_VAR, "marshal_stubs"),
    ]));
    assert_eq!(config.stub_path, PathBuf::from("/opt/interop"));
    assert_eq!(config.stub_library.as_deref(), Some("marshal_stubs"));
}

#[test]
fn test_missing_stub_library_is_an_error() {
    let config = MarshalConfig {
        stub_path: std::env::temp_dir(),
        stub_library: Some("no-such-marshal-stubs-91c2".into()),
        ..MarshalConfig::default()
    };
    let err = LibraryStubSource::from_config(&config)
        .expect("library is configured")
        .err()
        .expect("library does not exist");
    assert!(matches!(err, StubLoadError::LibraryNotFound(_)));
}

#[test]
fn test_misaligned_buffer_still_copies() {
    let types = Arc::new(TypeRegistry::new());
    let wide = types
        .define(TypeDecl::structure("Wide").field("v", FieldKind::Scalar(Scalar::Int64)))
        .unwrap();
    let engine = MarshalEngine::new(types, Arc::new(StubRegistry::empty())).with_config(
        MarshalConfig {
            validate_alignment: true,
            ..MarshalConfig::default()
        },
    );

    let value = ManagedValue::instantiate(&wide);
    value
        .write_field_bytes(0, &0x0102_0304_0506_0708i64.to_ne_bytes())
        .unwrap();

    let mut buf = [0u8; 9];
    let misaligned = unsafe { NativePtr::from_slice(&mut buf).byte_add(1) };
    unsafe { engine.to_native(&value, misaligned, false) }.unwrap();
    assert_eq!(buf[1..], 0x0102_0304_0506_0708i64.to_ne_bytes());
}
