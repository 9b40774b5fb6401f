use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid resource address: {0}")]
    InvalidAddress(String),

    #[error("invalid load request: {0}")]
    InvalidRequest(String),

    #[error("invalid session field: {0}")]
    InvalidField(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("unknown XNAT host: {0}")]
    #[diagnostic(help("add the host to the `hosts` list in xnat-sync.json or pass a full URL"))]
    UnknownHost(String),

    #[error("authentication failed for {uri}")]
    #[diagnostic(help("check the username and the XNAT_PASSWORD environment variable"))]
    AuthenticationFailure { uri: String },

    #[error("XNAT request failed: {0}")]
    XnatHttp(String),

    #[error("XNAT returned status {status}: {message}")]
    XnatStatus { status: u16, message: String },

    #[error("failed to extract {archive}: {message}")]
    ExtractionFailure { archive: String, message: String },

    #[error("local DICOM index is not initialized")]
    IndexUninitialized,

    #[error("DICOM index error: {0}")]
    DicomIndex(String),

    #[error("no file could be loaded: {0}")]
    DispatchFailure(String),

    #[error("expected exactly one manifest in {directory}, found {count}")]
    ManifestAmbiguity { directory: String, count: usize },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SyncError {
    pub(crate) fn extraction(archive: impl ToString, message: impl ToString) -> Self {
        SyncError::ExtractionFailure {
            archive: archive.to_string(),
            message: message.to_string(),
        }
    }
}
