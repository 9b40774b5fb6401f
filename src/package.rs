use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::FormatSettings;
use crate::error::SyncError;
use crate::fs_util;
use crate::host::SceneSerializer;
use crate::ledger::Session;
use crate::store::{Store, walk_files};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenePackage {
    pub name: String,
    pub directory: Utf8PathBuf,
    pub manifest: Utf8PathBuf,
    pub bundle: Option<Utf8PathBuf>,
}

pub struct ScenePackager<'a> {
    store: &'a Store,
    formats: &'a FormatSettings,
}

impl<'a> ScenePackager<'a> {
    pub fn new(store: &'a Store, formats: &'a FormatSettings) -> Self {
        Self { store, formats }
    }

    /// Serializes the scene into `<uploads>/<name>` with a `Data` sub-directory
    /// and locates its single manifest.
    pub fn package_scene(
        &self,
        session: &Session,
        serializer: &dyn SceneSerializer,
    ) -> Result<ScenePackage, SyncError> {
        let name = package_name(session.file_name())?;
        let directory = self.store.upload_dir(&name);
        Store::remove_dir_if_exists(&directory)?;
        fs::create_dir_all(directory.join("Data").as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("create {directory}: {err}")))?;

        let hint = serializer.save(&directory)?;
        let manifest = find_manifest(&directory, self.formats)?;
        if let Some(hint) = hint {
            if manifest.file_name() != Some(hint.as_str()) {
                warn!(%hint, found = %manifest, "serializer manifest hint does not match");
            }
        }
        info!(package = %name, manifest = %manifest, "packaged scene");

        Ok(ScenePackage {
            name,
            directory,
            manifest,
            bundle: None,
        })
    }

    pub fn compress(&self, package: &mut ScenePackage) -> Result<Utf8PathBuf, SyncError> {
        let bundle = self.store.upload_bundle_path(&package.name);
        Store::remove_file_if_exists(&bundle)?;
        Store::ensure_parent(&bundle)?;
        fs_util::compress_dir(&package.directory, &package.name, &bundle)?;
        info!(bundle = %bundle, "compressed scene package");
        package.bundle = Some(bundle.clone());
        Ok(bundle)
    }
}

/// The one manifest below `directory`, matched by extension.
pub fn find_manifest(directory: &Utf8Path, formats: &FormatSettings) -> Result<Utf8PathBuf, SyncError> {
    let mut manifests = walk_files(directory)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .map(|name| formats.is_manifest(name))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    if manifests.len() != 1 {
        return Err(SyncError::ManifestAmbiguity {
            directory: directory.to_string(),
            count: manifests.len(),
        });
    }
    Ok(manifests.remove(0))
}

/// Package directory name: the session file name without its extension.
pub fn package_name(file_name: &str) -> Result<String, SyncError> {
    let name = Utf8Path::new(file_name)
        .file_stem()
        .filter(|stem| !stem.is_empty() && *stem != "..")
        .ok_or_else(|| SyncError::InvalidField(format!("fileName = {file_name:?}")))?;
    Ok(name.to_string())
}
