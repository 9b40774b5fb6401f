use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::SyncError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionType {
    #[serde(rename = "scene download")]
    SceneDownload,
    #[serde(rename = "scene upload")]
    SceneUpload,
    #[serde(rename = "scene upload - unlinked")]
    SceneUploadUnlinked,
    #[serde(rename = "dicom download")]
    DicomDownload,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::SceneDownload => "scene download",
            SessionType::SceneUpload => "scene upload",
            SessionType::SceneUploadUnlinked => "scene upload - unlinked",
            SessionType::DicomDownload => "dicom download",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "scene download" => Ok(SessionType::SceneDownload),
            "scene upload" => Ok(SessionType::SceneUpload),
            "scene upload - unlinked" => Ok(SessionType::SceneUploadUnlinked),
            "dicom download" => Ok(SessionType::DicomDownload),
            other => Err(SyncError::InvalidField(format!("sessionType = {other}"))),
        }
    }
}

/// The closed set of keys a session carries, in ledger order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    Host,
    Username,
    SaveLevel,
    SaveUri,
    FileName,
    SessionStart,
    SessionType,
}

impl SessionField {
    pub const ALL: [SessionField; 7] = [
        SessionField::Host,
        SessionField::Username,
        SessionField::SaveLevel,
        SessionField::SaveUri,
        SessionField::FileName,
        SessionField::SessionStart,
        SessionField::SessionType,
    ];

    pub fn key(self) -> &'static str {
        match self {
            SessionField::Host => "host",
            SessionField::Username => "username",
            SessionField::SaveLevel => "saveLevel",
            SessionField::SaveUri => "saveUri",
            SessionField::FileName => "fileName",
            SessionField::SessionStart => "sessionStart",
            SessionField::SessionType => "sessionType",
        }
    }
}

impl FromStr for SessionField {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SessionField::ALL
            .into_iter()
            .find(|field| field.key() == value)
            .ok_or_else(|| SyncError::InvalidField(value.to_string()))
    }
}

/// Provenance of one load or save. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    host: String,
    username: String,
    save_level: String,
    save_uri: String,
    file_name: String,
    session_start: DateTime<Utc>,
    session_type: SessionType,
}

impl Session {
    pub fn builder(session_type: SessionType) -> SessionBuilder {
        SessionBuilder::new(session_type)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn save_level(&self) -> &str {
        &self.save_level
    }

    pub fn save_uri(&self) -> &str {
        &self.save_uri
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn value(&self, field: SessionField) -> String {
        match field {
            SessionField::Host => self.host.clone(),
            SessionField::Username => self.username.clone(),
            SessionField::SaveLevel => self.save_level.clone(),
            SessionField::SaveUri => self.save_uri.clone(),
            SessionField::FileName => self.file_name.clone(),
            SessionField::SessionStart => self
                .session_start
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            SessionField::SessionType => self.session_type.to_string(),
        }
    }

    /// The ledger block: one `key:\tvalue` line per field and a blank separator.
    pub fn to_block(&self) -> String {
        let mut block = String::new();
        for field in SessionField::ALL {
            block.push_str(field.key());
            block.push_str(":\t");
            block.push_str(&self.value(field));
            block.push('\n');
        }
        block.push('\n');
        block
    }
}

#[derive(Debug, Clone)]
pub struct SessionBuilder {
    host: String,
    username: String,
    save_level: String,
    save_uri: String,
    file_name: String,
    session_start: DateTime<Utc>,
    session_type: SessionType,
}

impl SessionBuilder {
    pub fn new(session_type: SessionType) -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            save_level: String::new(),
            save_uri: String::new(),
            file_name: String::new(),
            session_start: Utc::now(),
            session_type,
        }
    }

    pub fn host(mut self, value: impl Into<String>) -> Self {
        self.host = value.into();
        self
    }

    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = value.into();
        self
    }

    pub fn save_level(mut self, value: impl Into<String>) -> Self {
        self.save_level = value.into();
        self
    }

    pub fn save_uri(mut self, value: impl Into<String>) -> Self {
        self.save_uri = value.into();
        self
    }

    pub fn file_name(mut self, value: impl Into<String>) -> Self {
        self.file_name = value.into();
        self
    }

    pub fn session_start(mut self, value: DateTime<Utc>) -> Self {
        self.session_start = value;
        self
    }

    /// String-keyed setter; keys outside the fixed set are rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<&mut Self, SyncError> {
        let field = key.parse::<SessionField>()?;
        check_value(field, value)?;
        match field {
            SessionField::Host => self.host = value.to_string(),
            SessionField::Username => self.username = value.to_string(),
            SessionField::SaveLevel => self.save_level = value.to_string(),
            SessionField::SaveUri => self.save_uri = value.to_string(),
            SessionField::FileName => self.file_name = value.to_string(),
            SessionField::SessionStart => {
                self.session_start = DateTime::parse_from_rfc3339(value)
                    .map_err(|err| SyncError::InvalidField(format!("sessionStart: {err}")))?
                    .with_timezone(&Utc);
            }
            SessionField::SessionType => self.session_type = value.parse()?,
        }
        Ok(self)
    }

    /// Fails with `InvalidField` when a value would break the one-line-per-key block.
    pub fn build(self) -> Result<Session, SyncError> {
        check_value(SessionField::Host, &self.host)?;
        check_value(SessionField::Username, &self.username)?;
        check_value(SessionField::SaveLevel, &self.save_level)?;
        check_value(SessionField::SaveUri, &self.save_uri)?;
        check_value(SessionField::FileName, &self.file_name)?;
        Ok(Session {
            host: self.host,
            username: self.username,
            save_level: self.save_level,
            save_uri: self.save_uri,
            file_name: self.file_name,
            session_start: self.session_start,
            session_type: self.session_type,
        })
    }
}

fn check_value(field: SessionField, value: &str) -> Result<(), SyncError> {
    if value.chars().any(char::is_control) {
        return Err(SyncError::InvalidField(format!(
            "{}: control characters are not allowed",
            field.key()
        )));
    }
    Ok(())
}

/// Append-only, write-only session log.
#[derive(Debug)]
pub struct SessionLedger {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl SessionLedger {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn record(&self, session: &Session) -> Result<(), SyncError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SyncError::Filesystem("session ledger lock poisoned".to_string()))?;
        Store::ensure_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", self.path)))?;
        file.write_all(session.to_block().as_bytes())
            .map_err(|err| SyncError::Filesystem(format!("append {}: {err}", self.path)))?;
        info!(
            session_type = %session.session_type(),
            file = session.file_name(),
            "recorded session"
        );
        Ok(())
    }
}
