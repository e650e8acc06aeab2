use thiserror::Error;

pub type MarshalResult<T> = Result<T, MarshalError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarshalError {
    #[error("Invalid argument '{param}': {message}")]
    InvalidArgument { param: &'static str, message: String },

    #[error("Operation is not supported: {0}")]
    Unsupported(String),

    /// Raised instead of a null-argument error on the legacy read path, whose callers
    /// expect access-violation semantics.
    #[error("Attempted to read or write protected memory")]
    MemoryFault,

    #[error("Argument '{param}' is out of range: {message}")]
    OutOfRange { param: &'static str, message: String },

    #[error("Marshal stub for '{type_name}' returned status {status}")]
    MarshalFailure { type_name: String, status: i32 },

    #[error("Insufficient native memory to allocate {0} bytes")]
    OutOfMemory(usize),
}

impl MarshalError {
    pub fn invalid_argument(param: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            param,
            message: message.into(),
        }
    }

    pub fn null_argument(param: &'static str) -> Self {
        Self::invalid_argument(param, "Value cannot be null.")
    }

    pub fn generic_type(param: &'static str, type_name: &str) -> Self {
        Self::invalid_argument(
            param,
            format!("The specified type '{}' must not be generic.", type_name),
        )
    }

    pub fn missing_layout(param: &'static str, type_name: &str) -> Self {
        Self::invalid_argument(
            param,
            format!(
                "Type '{}' cannot be marshaled as an unmanaged structure; \
                 no meaningful size or offset can be computed.",
                type_name
            ),
        )
    }

    pub fn out_of_range(param: &'static str, message: impl Into<String>) -> Self {
        Self::OutOfRange {
            param,
            message: message.into(),
        }
    }
}

impl From<LayoutError> for MarshalError {
    fn from(e: LayoutError) -> Self {
        MarshalError::invalid_argument("type", e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    #[error("Explicit layout of '{type_name}' requires an offset for field '{field}'")]
    MissingExplicitOffset { type_name: String, field: String },
    #[error("Field '{field}' is declared more than once on '{type_name}'")]
    DuplicateField { type_name: String, field: String },
    #[error("Field '{field}' of '{type_name}' embeds '{nested}', which has no native layout")]
    NestedWithoutLayout {
        type_name: String,
        field: String,
        nested: String,
    },
    #[error("Type '{0}' is already defined")]
    AlreadyDefined(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StubLoadError {
    #[error("Unable to find stub library '{0}'")]
    LibraryNotFound(String),
    #[error("Failed to load stub library '{0}': {1}")]
    LoadError(String, String),
}
