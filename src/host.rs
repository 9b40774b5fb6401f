use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::config::FormatSettings;
use crate::dicom::Loadable;
use crate::error::SyncError;
use crate::store::{Store, walk_files};

/// The application the downloaded files are handed to.
pub trait HostApplication: Send + Sync {
    fn load_file(&self, path: &Utf8Path) -> bool;

    fn load_dicom(&self, loadable: &Loadable) -> bool {
        loadable
            .files
            .first()
            .map(|path| self.load_file(path))
            .unwrap_or(false)
    }
}

/// Writes the host's current scene into a prepared directory.
pub trait SceneSerializer {
    /// Returns the manifest file name when the serializer knows it.
    fn save(&self, directory: &Utf8Path) -> Result<Option<String>, SyncError>;
}

/// Host for headless use: a file "loads" when it is a non-empty regular file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCheckHost;

impl HostApplication for FileCheckHost {
    fn load_file(&self, path: &Utf8Path) -> bool {
        match path.as_std_path().metadata() {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                debug!(%path, bytes = meta.len(), "loaded file");
                true
            }
            Ok(_) => {
                warn!(%path, "not a loadable file");
                false
            }
            Err(err) => {
                warn!(%path, error = %err, "cannot load file");
                false
            }
        }
    }
}

/// Serializes a scene that already exists on disk by copying its directory.
#[derive(Debug, Clone)]
pub struct DirectorySceneSerializer {
    source: Utf8PathBuf,
    formats: FormatSettings,
}

impl DirectorySceneSerializer {
    pub fn new(source: Utf8PathBuf, formats: FormatSettings) -> Self {
        Self { source, formats }
    }
}

impl SceneSerializer for DirectorySceneSerializer {
    fn save(&self, directory: &Utf8Path) -> Result<Option<String>, SyncError> {
        if !self.source.as_std_path().is_dir() {
            return Err(SyncError::Filesystem(format!(
                "scene directory not found: {}",
                self.source
            )));
        }
        Store::copy_dir_recursive(&self.source, directory)?;
        let hint = walk_files(&self.source)?
            .into_iter()
            .filter(|path| path.parent() == Some(self.source.as_path()))
            .filter_map(|path| path.file_name().map(str::to_string))
            .find(|name| self.formats.is_manifest(name));
        Ok(hint)
    }
}
