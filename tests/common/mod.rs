#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use xnat_sync::address::RemoteAddress;
use xnat_sync::config::{HostSettings, ResolvedConfig};
use xnat_sync::error::SyncError;
use xnat_sync::host::HostApplication;
use xnat_sync::store::Store;
use xnat_sync::xnat::{CancelToken, Credentials, XnatClient};

pub const HOST_URL: &str = "https://xnat.test";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadMode {
    #[default]
    Serve,
    /// Cancels the token and leaves nothing behind.
    Cancel,
    /// Returns success without writing the destination.
    Silent,
    /// Rejects the credentials.
    Deny,
}

#[derive(Default)]
pub struct MockXnat {
    payloads: HashMap<String, Vec<u8>>,
    mode: DownloadMode,
    fail_upload: bool,
    downloads: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockXnat {
    pub fn with_mode(mode: DownloadMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn failing_upload() -> Self {
        Self {
            fail_upload: true,
            ..Self::default()
        }
    }

    pub fn serve(mut self, uri: &str, bytes: Vec<u8>) -> Self {
        self.payloads.insert(uri.to_string(), bytes);
        self
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }
}

impl XnatClient for MockXnat {
    fn download(
        &self,
        address: &RemoteAddress,
        _credentials: &Credentials,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        self.downloads.lock().unwrap().push(address.uri());
        match self.mode {
            DownloadMode::Cancel => {
                cancel.cancel();
                Ok(())
            }
            DownloadMode::Silent => Ok(()),
            DownloadMode::Deny => Err(SyncError::AuthenticationFailure {
                uri: address.uri(),
            }),
            DownloadMode::Serve => {
                let bytes = self.payloads.get(&address.uri()).ok_or_else(|| {
                    SyncError::XnatStatus {
                        status: 404,
                        message: address.uri(),
                    }
                })?;
                fs::write(destination, bytes).map_err(|err| SyncError::Filesystem(err.to_string()))
            }
        }
    }

    fn upload(
        &self,
        bundle: &Path,
        address: &RemoteAddress,
        _credentials: &Credentials,
    ) -> Result<(), SyncError> {
        if self.fail_upload {
            return Err(SyncError::XnatStatus {
                status: 500,
                message: "upload rejected".to_string(),
            });
        }
        let bytes = fs::read(bundle).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        self.uploads.lock().unwrap().push((address.uri(), bytes));
        Ok(())
    }
}

/// Host that records every file it is asked to load and refuses some extensions.
#[derive(Default)]
pub struct RecordingHost {
    rejected_extensions: Vec<String>,
    loaded: Mutex<Vec<Utf8PathBuf>>,
}

impl RecordingHost {
    pub fn rejecting(extension: &str) -> Self {
        Self {
            rejected_extensions: vec![extension.to_string()],
            loaded: Mutex::new(Vec::new()),
        }
    }

    pub fn loaded(&self) -> Vec<Utf8PathBuf> {
        self.loaded.lock().unwrap().clone()
    }
}

impl HostApplication for RecordingHost {
    fn load_file(&self, path: &Utf8Path) -> bool {
        let rejected = path
            .extension()
            .map(|ext| self.rejected_extensions.iter().any(|r| r == ext))
            .unwrap_or(false);
        if rejected || !path.as_std_path().is_file() {
            return false;
        }
        self.loaded.lock().unwrap().push(path.to_path_buf());
        true
    }
}

pub fn temp_store(temp: &TempDir) -> Store {
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    Store::new_with_paths(root.join("cache"), root.join("settings"))
}

pub fn test_config(use_cache: bool) -> ResolvedConfig {
    ResolvedConfig {
        hosts: vec![HostSettings {
            name: "test".to_string(),
            url: HOST_URL.to_string(),
            username: Some("alice".to_string()),
            use_cache,
        }],
        ..ResolvedConfig::default()
    }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn write_file(path: &Utf8Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    fs::write(path.as_std_path(), content).unwrap();
}

/// Number of session blocks in a ledger file.
pub fn ledger_blocks(path: &Utf8Path) -> usize {
    match fs::read_to_string(path.as_std_path()) {
        Ok(content) => content.lines().filter(|line| line.starts_with("host:\t")).count(),
        Err(_) => 0,
    }
}
