use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::address::{QueryFormat, RemoteAddress};
use crate::error::SyncError;
use crate::fs_util::{self, ArchiveKind};
use crate::store::{Store, walk_files};
use crate::xnat::{CancelToken, Credentials, XnatClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractLayout {
    /// Every extracted file is moved directly under the extraction root.
    Flatten,
    /// The archive's directory structure is kept as-is.
    Preserve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched,
    Aborted,
}

/// One fetch-and-extract unit of work.
#[derive(Debug, Clone)]
pub struct BundleTask {
    pub source: RemoteAddress,
    pub archive_path: Utf8PathBuf,
    pub extraction_path: Utf8PathBuf,
    pub layout: ExtractLayout,
    inventory: Vec<Utf8PathBuf>,
}

impl BundleTask {
    /// A bundle download of `collection` (rendered with `?format=zip`).
    pub fn for_collection(store: &Store, collection: &RemoteAddress) -> Self {
        Self {
            source: collection.with_query(QueryFormat::Bundle),
            archive_path: store.archive_path(collection),
            extraction_path: store.local_path(collection),
            layout: ExtractLayout::Flatten,
            inventory: Vec::new(),
        }
    }

    /// A single remote file that is itself an archive, extracted next to it.
    pub fn for_packed_file(store: &Store, file: &RemoteAddress, layout: ExtractLayout) -> Self {
        let archive_path = store.local_path(file);
        let extraction_path = archive_path.with_extension("");
        Self {
            source: file.with_query(QueryFormat::Single),
            archive_path,
            extraction_path,
            layout,
            inventory: Vec::new(),
        }
    }

    pub fn inventory(&self) -> &[Utf8PathBuf] {
        &self.inventory
    }
}

pub struct Archive<'a, X: XnatClient> {
    client: &'a X,
    credentials: &'a Credentials,
}

impl<'a, X: XnatClient> Archive<'a, X> {
    pub fn new(client: &'a X, credentials: &'a Credentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    pub fn fetch_bundle(
        &self,
        task: &BundleTask,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, SyncError> {
        self.fetch_to(&task.source, &task.archive_path, cancel)
    }

    pub fn fetch_single(
        &self,
        address: &RemoteAddress,
        destination: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, SyncError> {
        self.fetch_to(address, destination, cancel)
    }

    fn fetch_to(
        &self,
        address: &RemoteAddress,
        destination: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, SyncError> {
        Store::ensure_parent(destination)?;
        Store::remove_file_if_exists(destination)?;
        info!(uri = %address, destination = %destination, "fetching");
        self.client.download(
            address,
            self.credentials,
            destination.as_std_path(),
            cancel,
        )?;

        if cancel.is_cancelled() {
            Store::remove_file_if_exists(destination)?;
            return Ok(FetchOutcome::Aborted);
        }
        if !destination.as_std_path().is_file() {
            debug!(destination = %destination, "fetch left no file behind");
            return Ok(FetchOutcome::Aborted);
        }
        Ok(FetchOutcome::Fetched)
    }

    /// Replaces the task's extraction directory with the archive's contents and
    /// returns the resulting inventory. Nothing is kept on failure.
    pub fn extract<'t>(&self, task: &'t mut BundleTask) -> Result<&'t [Utf8PathBuf], SyncError> {
        task.inventory.clear();
        match extract_into(task) {
            Ok(inventory) => {
                info!(
                    archive = %task.archive_path,
                    files = inventory.len(),
                    "extracted bundle"
                );
                task.inventory = inventory;
                Ok(&task.inventory)
            }
            Err(err) => {
                if let Err(cleanup) = Store::remove_dir_if_exists(&task.extraction_path) {
                    warn!(error = %cleanup, "failed to clean extraction directory");
                }
                Err(err)
            }
        }
    }
}

fn extract_into(task: &BundleTask) -> Result<Vec<Utf8PathBuf>, SyncError> {
    let archive = task.archive_path.as_std_path();
    if !archive.is_file() {
        return Err(SyncError::extraction(&task.archive_path, "archive is missing"));
    }
    let kind = fs_util::detect_archive(archive)?
        .ok_or_else(|| SyncError::extraction(&task.archive_path, "unrecognized archive format"))?;

    Store::remove_dir_if_exists(&task.extraction_path)?;
    fs::create_dir_all(task.extraction_path.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;

    match kind {
        ArchiveKind::Zip => fs_util::extract_zip(archive, task.extraction_path.as_std_path())?,
        ArchiveKind::Gzip => fs_util::extract_gzip(archive, task.extraction_path.as_std_path())?,
    }

    match task.layout {
        ExtractLayout::Flatten => flatten(&task.extraction_path),
        ExtractLayout::Preserve => walk_files(&task.extraction_path),
    }
}

/// Moves every nested file directly under `root`, renaming on basename collision,
/// then removes the emptied sub-directories.
fn flatten(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SyncError> {
    let files = walk_files(root)?;
    // root-level directories still occupy their names until pruned
    let mut taken = BTreeSet::new();
    for entry in fs::read_dir(root.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?
    {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        taken.insert(entry.file_name().to_string_lossy().into_owned());
    }

    let mut inventory = Vec::with_capacity(files.len());
    for path in files {
        if path.parent() == Some(root) {
            inventory.push(path);
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let target_name = unique_name(name, &taken);
        taken.insert(target_name.clone());
        let target = root.join(&target_name);
        fs::rename(path.as_std_path(), target.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("move {path} -> {target}: {err}")))?;
        inventory.push(target);
    }

    let entries = fs::read_dir(root.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
        if entry.path().is_dir() {
            fs::remove_dir_all(entry.path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
    }

    inventory.sort();
    Ok(inventory)
}

fn unique_name(name: &str, taken: &BTreeSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}
