mod common;

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use xnat_sync::dicom::{
    DicomIndex, IndexedFile, LocalDicomIndex, SeriesPlugin, insert_with_lazy_init,
    select_loadable,
};
use xnat_sync::error::SyncError;

use common::write_file;

/// Index that stays uninitialized until told otherwise and counts initializations.
#[derive(Default)]
struct CountingIndex {
    initialized: bool,
    refuse_after_init: bool,
    initializations: usize,
    inserted: Vec<Utf8PathBuf>,
}

impl DicomIndex for CountingIndex {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self) -> Result<(), SyncError> {
        self.initializations += 1;
        self.initialized = !self.refuse_after_init;
        Ok(())
    }

    fn insert(&mut self, path: &Utf8Path) -> Result<(), SyncError> {
        if !self.initialized {
            return Err(SyncError::IndexUninitialized);
        }
        self.inserted.push(path.to_path_buf());
        Ok(())
    }

    fn patients(&self) -> Vec<String> {
        Vec::new()
    }

    fn studies(&self, _patient: &str) -> Vec<String> {
        Vec::new()
    }

    fn series(&self, _patient: &str, _study: &str) -> Vec<String> {
        Vec::new()
    }

    fn files(&self, _patient: &str, _study: &str, _series: &str) -> Vec<IndexedFile> {
        Vec::new()
    }
}

fn cached(root: &Utf8Path, scan: &str, name: &str) -> Utf8PathBuf {
    let path = root.join(format!(
        "projects/P/subjects/S/experiments/E/scans/{scan}/resources/DICOM/files/{name}"
    ));
    write_file(&path, name.as_bytes());
    path
}

fn temp_root(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}

#[test]
fn uninitialized_index_is_initialized_once_then_retried() {
    let mut index = CountingIndex::default();
    insert_with_lazy_init(&mut index, Utf8Path::new("/cache/a.dcm")).unwrap();
    insert_with_lazy_init(&mut index, Utf8Path::new("/cache/b.dcm")).unwrap();

    assert_eq!(index.initializations, 1);
    assert_eq!(index.inserted.len(), 2);
}

#[test]
fn second_uninitialized_error_is_propagated() {
    let mut index = CountingIndex {
        refuse_after_init: true,
        ..CountingIndex::default()
    };
    let result = insert_with_lazy_init(&mut index, Utf8Path::new("/cache/a.dcm"));

    assert_matches!(result, Err(SyncError::IndexUninitialized));
    assert_eq!(index.initializations, 1);
}

#[test]
fn local_index_persists_on_flush() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp_root(&temp);
    let index_path = root.join("dicom/index.json");
    let file = cached(&root, "3", "a.dcm");

    let mut index = LocalDicomIndex::open(index_path.clone()).unwrap();
    assert!(!index.is_initialized());
    assert_matches!(index.insert(&file), Err(SyncError::IndexUninitialized));
    index.initialize().unwrap();
    index.insert(&file).unwrap();
    index.insert(&file).unwrap();
    index.flush().unwrap();

    let reopened = LocalDicomIndex::open(index_path).unwrap();
    assert!(reopened.is_initialized());
    assert_eq!(reopened.patients(), vec!["S".to_string()]);
    assert_eq!(reopened.studies("S"), vec!["E".to_string()]);
    assert_eq!(reopened.series("S", "E"), vec!["3".to_string()]);
    let files = reopened.files("S", "E", "3");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, file);
    assert_eq!(files[0].sequence, 1);
}

#[test]
fn corrupt_index_file_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp_root(&temp);
    let index_path = root.join("dicom/index.json");
    write_file(&index_path, b"{ not json");

    assert_matches!(
        LocalDicomIndex::open(index_path),
        Err(SyncError::DicomIndex(message)) if message.contains("parse")
    );
}

#[test]
fn largest_series_wins_and_first_wins_ties() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp_root(&temp);
    let mut index = LocalDicomIndex::open(root.join("dicom/index.json")).unwrap();
    index.initialize().unwrap();

    let one = [cached(&root, "1", "a.dcm"), cached(&root, "1", "b.dcm")];
    let two = [
        cached(&root, "2", "c.dcm"),
        cached(&root, "2", "d.dcm"),
        cached(&root, "2", "e.dcm"),
    ];
    for path in one.iter().chain(two.iter()) {
        index.insert(path).unwrap();
    }

    let everything = one.iter().chain(two.iter()).cloned().collect::<BTreeSet<_>>();
    let best = select_loadable(&index, &everything, &SeriesPlugin).unwrap();
    assert_eq!(best.name, "2");
    assert_eq!(best.files.len(), 3);

    // only two files of each series requested: a tie, the first series is kept
    let tie = [&one[0], &one[1], &two[0], &two[1]]
        .into_iter()
        .cloned()
        .collect::<BTreeSet<_>>();
    let best = select_loadable(&index, &tie, &SeriesPlugin).unwrap();
    assert_eq!(best.name, "1");

    assert!(select_loadable(&index, &BTreeSet::new(), &SeriesPlugin).is_none());
}
