use std::collections::{BTreeMap, BTreeSet, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::address::{Level, RemoteAddress};
use crate::config::FormatSettings;
use crate::dicom::{DicomIndex, IndexedFile};
use crate::store::walk_files;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CacheVerdict {
    pub hit: bool,
    /// Local files that matched, in request order.
    pub paths: Vec<Utf8PathBuf>,
}

impl CacheVerdict {
    pub fn miss() -> Self {
        Self::default()
    }
}

/// Read-only view answering whether requested remote files are already local.
pub struct LocalCacheIndex<'a> {
    formats: &'a FormatSettings,
}

impl<'a> LocalCacheIndex<'a> {
    pub fn new(formats: &'a FormatSettings) -> Self {
        Self { formats }
    }

    pub fn check_generic(&self, address: &RemoteAddress, destination_base: &Utf8Path) -> bool {
        destination_base
            .join(address.local_relative())
            .as_std_path()
            .is_file()
    }

    pub fn check_analyze_pair(
        &self,
        addresses: &[RemoteAddress],
        destination_base: &Utf8Path,
    ) -> CacheVerdict {
        let splitter = self.formats.analyze_splitter;
        let requested = addresses
            .iter()
            .filter_map(|address| analyze_key(address, splitter))
            .collect::<BTreeSet<_>>();
        if addresses.is_empty() || !destination_base.as_std_path().is_dir() {
            return CacheVerdict::miss();
        }

        let files = match walk_files(destination_base) {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, root = %destination_base, "cache walk failed");
                return CacheVerdict::miss();
            }
        };

        let mut matched: BTreeMap<String, Utf8PathBuf> = BTreeMap::new();
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            if !self.formats.is_analyze(name) {
                continue;
            }
            let relative = file.strip_prefix(destination_base).unwrap_or(file.as_path());
            let Some(key) = local_analyze_key(relative, splitter) else {
                continue;
            };
            if requested.contains(&key) {
                matched.entry(key).or_insert(file);
            }
        }

        let hit = matched.len() == addresses.len();
        debug!(
            requested = addresses.len(),
            matched = matched.len(),
            hit,
            "analyze cache check"
        );
        if !hit {
            return CacheVerdict::miss();
        }
        let paths = addresses
            .iter()
            .filter_map(|address| analyze_key(address, splitter))
            .filter_map(|key| matched.get(&key).cloned())
            .collect();
        CacheVerdict { hit, paths }
    }

    pub fn check_dicom(
        &self,
        addresses: &[RemoteAddress],
        destination_base: &Utf8Path,
        index: &dyn DicomIndex,
    ) -> CacheVerdict {
        if addresses.is_empty() || !index.is_initialized() {
            return CacheVerdict::miss();
        }
        let splitter = self.formats.dicom_splitter;

        let mut by_key: HashMap<String, IndexedFile> = HashMap::new();
        for patient in index.patients() {
            for study in index.studies(&patient) {
                for series in index.series(&patient, &study) {
                    for file in index.files(&patient, &study, &series) {
                        let Some(key) = local_dicom_key(&file.path, destination_base, splitter) else {
                            continue;
                        };
                        let newer = by_key
                            .get(&key)
                            .map(|existing| file.sequence > existing.sequence)
                            .unwrap_or(true);
                        if newer {
                            by_key.insert(key, file);
                        }
                    }
                }
            }
        }

        let mut paths = Vec::with_capacity(addresses.len());
        for address in addresses {
            let found = address
                .abbreviated_key(splitter)
                .and_then(|key| by_key.get(&key))
                .filter(|file| file.path.as_std_path().is_file());
            match found {
                Some(file) => paths.push(file.path.clone()),
                None => {
                    debug!(uri = %address, "dicom cache miss");
                    return CacheVerdict::miss();
                }
            }
        }
        CacheVerdict { hit: true, paths }
    }
}

/// `<id at splitter>/<basename>`, e.g. `E1/brain.hdr` for the experiments splitter.
pub fn analyze_key(address: &RemoteAddress, splitter: Level) -> Option<String> {
    Some(format!(
        "{}/{}",
        address.id_at(splitter)?,
        address.base_name()
    ))
}

fn local_analyze_key(relative: &Utf8Path, splitter: Level) -> Option<String> {
    let components = relative.components().map(|c| c.as_str()).collect::<Vec<_>>();
    let position = components
        .iter()
        .position(|component| *component == splitter.as_str())?;
    let segment = components.get(position + 1)?;
    let name = relative.file_name()?;
    Some(format!("{segment}/{name}"))
}

/// Everything after the first `<splitter>` component below `destination_base`,
/// joined with `/`; mirrors `RemoteAddress::abbreviated_key`.
fn local_dicom_key(path: &Utf8Path, destination_base: &Utf8Path, splitter: Level) -> Option<String> {
    let relative = path.strip_prefix(destination_base).unwrap_or(path);
    let components = relative
        .components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>();
    let position = components
        .iter()
        .position(|component| *component == splitter.as_str())?;
    let rest = &components[position + 1..];
    if rest.is_empty() {
        return None;
    }
    Some(rest.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_keys_match_address_keys() {
        let address: RemoteAddress =
            "/data/projects/P/subjects/S/experiments/E/scans/1/resources/DICOM/files/a.dcm"
                .parse()
                .unwrap();
        let root = Utf8Path::new("/home/u/projects/cache/downloads");
        let local = root.join(address.local_relative());
        assert_eq!(
            local_dicom_key(&local, root, Level::Projects),
            address.abbreviated_key(Level::Projects)
        );

        // a remote id spelled like a level name
        let address: RemoteAddress =
            "/data/projects/P/subjects/projects/experiments/E/scans/1/resources/DICOM/files/a.dcm"
                .parse()
                .unwrap();
        let local = root.join(address.local_relative());
        assert_eq!(
            local_dicom_key(&local, root, Level::Projects),
            address.abbreviated_key(Level::Projects)
        );

        let relative = Utf8Path::new("projects/P/subjects/S/experiments/E/scans/1/files/a.hdr");
        assert_eq!(
            local_analyze_key(relative, Level::Experiments).as_deref(),
            Some("E/a.hdr")
        );
    }
}
