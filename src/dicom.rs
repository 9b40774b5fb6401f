//! Local DICOM index: patient → study → series → files, persisted as JSON.
//!
//! Identity comes from the Part-10 header when one can be read, otherwise from
//! the mirrored remote hierarchy (`subjects/<S>/experiments/<E>/scans/<N>`).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::store::Store;

const HEADER_LIMIT: u64 = 1 << 20;
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const IMPLICIT_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
const EXPLICIT_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
const DEFLATED_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";

pub type SharedDicomIndex = Arc<Mutex<dyn DicomIndex>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomIdentity {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: Utf8PathBuf,
    /// Monotonic insertion counter; larger means more recently indexed.
    pub sequence: u64,
}

pub trait DicomIndex: Send {
    fn is_initialized(&self) -> bool;
    fn initialize(&mut self) -> Result<(), SyncError>;
    /// Fails with `IndexUninitialized` until `initialize` has run.
    fn insert(&mut self, path: &Utf8Path) -> Result<(), SyncError>;
    fn flush(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
    fn patients(&self) -> Vec<String>;
    fn studies(&self, patient: &str) -> Vec<String>;
    fn series(&self, patient: &str, study: &str) -> Vec<String>;
    fn files(&self, patient: &str, study: &str, series: &str) -> Vec<IndexedFile>;
}

/// Adds `path`, initializing the index and retrying exactly once if it reports
/// itself uninitialized.
pub fn insert_with_lazy_init(index: &mut dyn DicomIndex, path: &Utf8Path) -> Result<(), SyncError> {
    match index.insert(path) {
        Err(SyncError::IndexUninitialized) => {
            warn!("DICOM index not initialized, initializing before retry");
            index.initialize()?;
            index.insert(path)
        }
        other => other,
    }
}

type SeriesMap = BTreeMap<String, Vec<IndexedFile>>;
type StudyMap = BTreeMap<String, SeriesMap>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    next_sequence: u64,
    patients: BTreeMap<String, StudyMap>,
}

#[derive(Debug)]
pub struct LocalDicomIndex {
    path: Utf8PathBuf,
    state: Option<IndexState>,
    dirty: bool,
}

impl LocalDicomIndex {
    /// Loads the index at `path`; a missing file leaves it uninitialized.
    pub fn open(path: Utf8PathBuf) -> Result<Self, SyncError> {
        let state = if path.as_std_path().is_file() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| SyncError::DicomIndex(format!("read {path}: {err}")))?;
            let state: IndexState = serde_json::from_str(&content)
                .map_err(|err| SyncError::DicomIndex(format!("parse {path}: {err}")))?;
            Some(state)
        } else {
            None
        };
        Ok(Self {
            path,
            state,
            dirty: false,
        })
    }

    pub fn shared(self) -> SharedDicomIndex {
        Arc::new(Mutex::new(self))
    }

    fn persist(&self) -> Result<(), SyncError> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(state)
            .map_err(|err| SyncError::DicomIndex(err.to_string()))?;
        Store::write_bytes_atomic(&self.path, &content)
    }

    fn series_map(&self, patient: &str, study: &str) -> Option<&SeriesMap> {
        self.state
            .as_ref()
            .and_then(|state| state.patients.get(patient))
            .and_then(|studies| studies.get(study))
    }
}

impl DicomIndex for LocalDicomIndex {
    fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn initialize(&mut self) -> Result<(), SyncError> {
        if self.state.is_none() {
            self.state = Some(IndexState::default());
        }
        self.persist()
    }

    fn insert(&mut self, path: &Utf8Path) -> Result<(), SyncError> {
        let Some(state) = self.state.as_mut() else {
            return Err(SyncError::IndexUninitialized);
        };
        let identity = read_identity(path)
            .or_else(|| identity_from_path(path))
            .ok_or_else(|| SyncError::DicomIndex(format!("cannot identify series of {path}")))?;

        for studies in state.patients.values_mut() {
            for series in studies.values_mut() {
                for files in series.values_mut() {
                    files.retain(|file| file.path.as_path() != path);
                }
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .patients
            .entry(identity.patient_id)
            .or_default()
            .entry(identity.study_uid)
            .or_default()
            .entry(identity.series_uid)
            .or_default()
            .push(IndexedFile {
                path: path.to_path_buf(),
                sequence,
            });
        self.dirty = true;
        debug!(%path, sequence, "indexed DICOM file");
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SyncError> {
        if self.dirty {
            self.persist()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn patients(&self) -> Vec<String> {
        self.state
            .as_ref()
            .map(|state| state.patients.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn studies(&self, patient: &str) -> Vec<String> {
        self.state
            .as_ref()
            .and_then(|state| state.patients.get(patient))
            .map(|studies| studies.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn series(&self, patient: &str, study: &str) -> Vec<String> {
        self.series_map(patient, study)
            .map(|series| series.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn files(&self, patient: &str, study: &str, series: &str) -> Vec<IndexedFile> {
        self.series_map(patient, study)
            .and_then(|map| map.get(series))
            .cloned()
            .unwrap_or_default()
    }
}

/// A coherent volume the host can load in one go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Loadable {
    pub name: String,
    pub files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFiles {
    pub series_uid: String,
    pub files: Vec<Utf8PathBuf>,
}

/// Turns per-series file groups into loadables.
pub trait DicomPlugin: Send + Sync {
    fn examine(&self, groups: &[SeriesFiles]) -> Vec<Loadable>;
}

/// One loadable per non-empty series.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesPlugin;

impl DicomPlugin for SeriesPlugin {
    fn examine(&self, groups: &[SeriesFiles]) -> Vec<Loadable> {
        groups
            .iter()
            .filter(|group| !group.files.is_empty())
            .map(|group| Loadable {
                name: group.series_uid.clone(),
                files: group.files.clone(),
            })
            .collect()
    }
}

/// Re-queries the index, keeps each series' files that are in `wanted`, and
/// returns the loadable with the most files (the first one on ties).
pub fn select_loadable(
    index: &dyn DicomIndex,
    wanted: &BTreeSet<Utf8PathBuf>,
    plugin: &dyn DicomPlugin,
) -> Option<Loadable> {
    let mut groups = Vec::new();
    for patient in index.patients() {
        for study in index.studies(&patient) {
            for series in index.series(&patient, &study) {
                let files = index
                    .files(&patient, &study, &series)
                    .into_iter()
                    .map(|file| file.path)
                    .filter(|path| wanted.contains(path))
                    .collect::<Vec<_>>();
                if !files.is_empty() {
                    groups.push(SeriesFiles {
                        series_uid: series.clone(),
                        files,
                    });
                }
            }
        }
    }

    let mut best: Option<Loadable> = None;
    for loadable in plugin.examine(&groups) {
        let larger = best
            .as_ref()
            .map(|current| loadable.files.len() > current.files.len())
            .unwrap_or(true);
        if larger {
            best = Some(loadable);
        }
    }
    best
}

pub fn is_dicom_file(path: &Utf8Path) -> bool {
    let Ok(file) = File::open(path.as_std_path()) else {
        return false;
    };
    let mut preamble = Vec::with_capacity(132);
    if file.take(132).read_to_end(&mut preamble).is_err() {
        return false;
    }
    preamble.len() == 132 && &preamble[128..132] == b"DICM"
}

pub fn read_identity(path: &Utf8Path) -> Option<DicomIdentity> {
    let file = File::open(path.as_std_path()).ok()?;
    let mut bytes = Vec::new();
    file.take(HEADER_LIMIT).read_to_end(&mut bytes).ok()?;
    parse_identity(&bytes)
}

/// Identity derived from a cache path laid out as the remote hierarchy.
pub fn identity_from_path(path: &Utf8Path) -> Option<DicomIdentity> {
    let components = path.components().map(|c| c.as_str()).collect::<Vec<_>>();
    let after = |level: &str| {
        components
            .iter()
            .position(|component| *component == level)
            .and_then(|index| components.get(index + 1))
            .map(|value| value.to_string())
    };
    Some(DicomIdentity {
        patient_id: after("subjects")?,
        study_uid: after("experiments")?,
        series_uid: after("scans").or_else(|| after("reconstructions"))?,
    })
}

fn parse_identity(bytes: &[u8]) -> Option<DicomIdentity> {
    if bytes.len() < 132 || &bytes[128..132] != b"DICM" {
        return None;
    }
    let mut pos = 132;
    let mut implicit = false;

    while pos + 8 <= bytes.len() && read_u16(bytes, pos)? == 0x0002 {
        let header = read_header(bytes, pos, false)?;
        let value = bytes.get(header.value_start..header.value_start + header.length)?;
        if header.element == 0x0010 {
            let syntax = text(value);
            if syntax == EXPLICIT_BIG_ENDIAN || syntax == DEFLATED_LITTLE_ENDIAN {
                return None;
            }
            implicit = syntax == IMPLICIT_LITTLE_ENDIAN;
        }
        pos = header.value_start + header.length;
    }

    let mut patient_id = None;
    let mut study_uid = None;
    let mut series_uid = None;
    while pos + 8 <= bytes.len() {
        let header = read_header(bytes, pos, implicit)?;
        if (header.group, header.element) > (0x0020, 0x000E) {
            break;
        }
        if header.undefined {
            pos = skip_undefined(bytes, header.value_start, implicit)?;
            continue;
        }
        let value = bytes.get(header.value_start..header.value_start + header.length)?;
        match (header.group, header.element) {
            (0x0010, 0x0020) => patient_id = Some(text(value)),
            (0x0020, 0x000D) => study_uid = Some(text(value)),
            (0x0020, 0x000E) => series_uid = Some(text(value)),
            _ => {}
        }
        pos = header.value_start + header.length;
    }

    Some(DicomIdentity {
        patient_id: patient_id.filter(|value| !value.is_empty())?,
        study_uid: study_uid.filter(|value| !value.is_empty())?,
        series_uid: series_uid.filter(|value| !value.is_empty())?,
    })
}

struct ElementHeader {
    group: u16,
    element: u16,
    length: usize,
    undefined: bool,
    value_start: usize,
}

fn read_header(bytes: &[u8], pos: usize, implicit: bool) -> Option<ElementHeader> {
    let group = read_u16(bytes, pos)?;
    let element = read_u16(bytes, pos + 2)?;
    let (raw_length, value_start) = if group == 0xFFFE || implicit {
        (read_u32(bytes, pos + 4)?, pos + 8)
    } else {
        let vr = bytes.get(pos + 4..pos + 6)?;
        if matches!(
            vr,
            b"OB" | b"OW" | b"OF" | b"OD" | b"OL" | b"OV" | b"SQ" | b"UT" | b"UN" | b"UC"
                | b"UR" | b"SV" | b"UV"
        ) {
            (read_u32(bytes, pos + 8)?, pos + 12)
        } else {
            (u32::from(read_u16(bytes, pos + 6)?), pos + 8)
        }
    };
    let undefined = raw_length == UNDEFINED_LENGTH;
    Some(ElementHeader {
        group,
        element,
        length: if undefined { 0 } else { raw_length as usize },
        undefined,
        value_start,
    })
}

/// Skips an undefined-length sequence starting at `pos` (just past its header)
/// and returns the offset after the matching sequence delimiter.
fn skip_undefined(bytes: &[u8], mut pos: usize, implicit: bool) -> Option<usize> {
    let mut depth = 1usize;
    while pos + 8 <= bytes.len() {
        let header = read_header(bytes, pos, implicit)?;
        pos = header.value_start;
        if header.group == 0xFFFE {
            match header.element {
                0xE000 if header.undefined => depth += 1,
                0xE000 => pos += header.length,
                0xE00D | 0xE0DD => depth -= 1,
                _ => return None,
            }
            if depth == 0 {
                return Some(pos);
            }
            continue;
        }
        if header.undefined {
            depth += 1;
        } else {
            pos += header.length;
        }
    }
    None
}

fn read_u16(bytes: &[u8], pos: usize) -> Option<u16> {
    let raw = bytes.get(pos..pos + 2)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw = bytes.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_matches(|ch: char| ch == '\0' || ch.is_whitespace())
        .to_string()
}
