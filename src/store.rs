use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::address::RemoteAddress;
use crate::config::ResolvedConfig;
use crate::error::SyncError;

/// Local cache layout:
///
/// ```text
/// <cache_root>/downloads/projects/<P>/subjects/<S>/...   mirrored remote hierarchy
/// <cache_root>/uploads/<package>/...                     outbound scene packages
/// <cache_root>/dicom/index.json                          local DICOM index
/// <settings_dir>/sessions.log                            session ledger
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
    settings_dir: Utf8PathBuf,
}

impl Store {
    pub fn new(config: &ResolvedConfig) -> Result<Self, SyncError> {
        let dirs = BaseDirs::new();
        let cache_root = match &config.cache_root {
            Some(root) => root.clone(),
            None => dirs
                .as_ref()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("xnat-sync"))
                        .ok()
                })
                .ok_or_else(|| {
                    SyncError::Filesystem("unable to resolve cache directory".to_string())
                })?,
        };
        let settings_dir = match &config.settings_dir {
            Some(dir) => dir.clone(),
            None => dirs
                .as_ref()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(dirs.config_dir().join("xnat-sync")).ok()
                })
                .ok_or_else(|| {
                    SyncError::Filesystem("unable to resolve settings directory".to_string())
                })?,
        };

        Ok(Self {
            cache_root,
            settings_dir,
        })
    }

    pub fn new_with_paths(cache_root: Utf8PathBuf, settings_dir: Utf8PathBuf) -> Self {
        Self {
            cache_root,
            settings_dir,
        }
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn settings_dir(&self) -> &Utf8Path {
        &self.settings_dir
    }

    pub fn downloads_root(&self) -> Utf8PathBuf {
        self.cache_root.join("downloads")
    }

    pub fn uploads_root(&self) -> Utf8PathBuf {
        self.cache_root.join("uploads")
    }

    pub fn dicom_index_path(&self) -> Utf8PathBuf {
        self.cache_root.join("dicom").join("index.json")
    }

    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.settings_dir.join("sessions.log")
    }

    pub fn local_path(&self, address: &RemoteAddress) -> Utf8PathBuf {
        self.downloads_root().join(address.local_relative())
    }

    /// Where the bundle for a collection is written before extraction.
    pub fn archive_path(&self, collection: &RemoteAddress) -> Utf8PathBuf {
        let dir = self.local_path(collection);
        let name = dir.file_name().unwrap_or("bundle").to_string();
        dir.with_file_name(format!("{name}.zip"))
    }

    pub fn upload_dir(&self, package_name: &str) -> Utf8PathBuf {
        self.uploads_root().join(package_name)
    }

    pub fn upload_bundle_path(&self, package_name: &str) -> Utf8PathBuf {
        self.uploads_root().join(format!("{package_name}.zip"))
    }

    pub fn ensure_cache_root(&self) -> Result<(), SyncError> {
        fs::create_dir_all(self.downloads_root().as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::create_dir_all(self.uploads_root().as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    pub fn ensure_parent(path: &Utf8Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SyncError::Filesystem(format!("create {parent}: {err}")))?;
        }
        Ok(())
    }

    pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<(), SyncError> {
        if path.as_std_path().exists() {
            fs::remove_dir_all(path.as_std_path())
                .map_err(|err| SyncError::Filesystem(format!("remove {path}: {err}")))?;
        }
        Ok(())
    }

    pub fn remove_file_if_exists(path: &Utf8Path) -> Result<(), SyncError> {
        if path.as_std_path().is_file() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| SyncError::Filesystem(format!("remove {path}: {err}")))?;
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("xnat-sync")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), SyncError> {
        fs::create_dir_all(dest.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in walk_dir(source.as_std_path())? {
            let relative = entry
                .strip_prefix(source.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let target = dest.as_std_path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
                }
                fs::copy(&entry, &target).map_err(|err| SyncError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Every entry below `root`, directories included. A missing root yields nothing.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut items = Vec::new();
    if !root.is_dir() {
        return Ok(items);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

/// Regular files below `root` as UTF-8 paths, sorted; non-UTF-8 names are skipped.
pub fn walk_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SyncError> {
    let mut files = walk_dir(root.as_std_path())?
        .into_iter()
        .filter(|path| path.is_file())
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}
