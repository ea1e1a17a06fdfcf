use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO Error")]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Unable to read address {0:#x}")]
    ReadPtrError(usize),
    #[error("Unable to write to address {0:#x}")]
    WritePtrError(usize),
    #[error("Null address given")]
    NullAddress,
    #[error("Empty memory range given")]
    EmptyRange,
    #[error("Could not change protection of {len} bytes at {address:#x}: {reason}")]
    ProtectionChangeFailed {
        address: usize,
        len: usize,
        reason: String,
    },
    #[error("Could not create pattern `{0}`")]
    PatternError(String),
    #[error("Patch '{name}' has invalid signature for module `{module}`")]
    SignatureNotFound { name: String, module: String },
    #[error("Patch '{name}' has malformed replacement bytes: {reason}")]
    MalformedReplacementBytes { name: String, reason: String },
    #[error("Patch '{0}' is already applied")]
    AlreadyApplied(String),
    #[error("Patch '{0}' is not applied")]
    NotApplied(String),
    #[error("Unknown patch '{0}'")]
    UnknownPatchName(String),
}

impl From<hex::FromHexError> for PatchError {
    fn from(error: hex::FromHexError) -> PatchError {
        PatchError::PatternError(format!("{}", error))
    }
}

impl From<regex::Error> for PatchError {
    fn from(error: regex::Error) -> PatchError {
        PatchError::PatternError(format!("{}", error))
    }
}
