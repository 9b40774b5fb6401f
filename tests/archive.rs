mod common;

use std::fs;
use std::io::Write;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;

use xnat_sync::address::RemoteAddress;
use xnat_sync::archive::{Archive, BundleTask, ExtractLayout, FetchOutcome};
use xnat_sync::error::SyncError;
use xnat_sync::xnat::{CancelToken, Credentials};

use common::{DownloadMode, MockXnat, temp_store, write_file, zip_bytes};

const COLLECTION: &str = "/data/projects/P/subjects/S/experiments/E/scans/1/resources/DICOM/files";

fn collection() -> RemoteAddress {
    COLLECTION.parse().unwrap()
}

#[test]
fn flatten_moves_nested_files_and_renames_collisions() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let mut task = BundleTask::for_collection(&store, &collection());

    write_file(
        &task.archive_path,
        &zip_bytes(&[
            ("E/scans/1/a.dcm", b"one"),
            ("E/scans/2/a.dcm", b"two"),
            ("E/scans/2/b.dcm", b"three"),
        ]),
    );
    let inventory = archive.extract(&mut task).unwrap().to_vec();

    let names = inventory
        .iter()
        .map(|path| path.file_name().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["a.dcm", "a_1.dcm", "b.dcm"]);
    assert!(inventory.iter().all(|path| path.parent() == Some(task.extraction_path.as_path())));
    let dirs = fs::read_dir(task.extraction_path.as_std_path())
        .unwrap()
        .filter(|entry| entry.as_ref().unwrap().path().is_dir())
        .count();
    assert_eq!(dirs, 0);
}

#[test]
fn nested_file_named_like_a_root_directory_is_renamed() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let mut task = BundleTask::for_collection(&store, &collection());

    write_file(
        &task.archive_path,
        &zip_bytes(&[("series/a.dcm", b"a"), ("other/series", b"plain file")]),
    );
    let inventory = archive.extract(&mut task).unwrap().to_vec();

    let names = inventory
        .iter()
        .map(|path| path.file_name().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["a.dcm", "series_1"]);
    assert!(inventory.iter().all(|path| path.as_std_path().is_file()));
}

#[test]
fn extracting_twice_gives_the_same_inventory() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let mut task = BundleTask::for_collection(&store, &collection());

    write_file(
        &task.archive_path,
        &zip_bytes(&[("x/a.dcm", b"a"), ("y/a.dcm", b"b")]),
    );
    let first = archive.extract(&mut task).unwrap().to_vec();
    let second = archive.extract(&mut task).unwrap().to_vec();

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[test]
fn preserve_layout_keeps_directories() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let file: RemoteAddress = "/data/projects/P/resources/Slicer/files/scene.mrb".parse().unwrap();
    let mut task = BundleTask::for_packed_file(&store, &file, ExtractLayout::Preserve);

    write_file(
        &task.archive_path,
        &zip_bytes(&[("scene/scene.mrml", b"<MRML/>"), ("scene/Data/v.nrrd", b"v")]),
    );
    let inventory = archive.extract(&mut task).unwrap().to_vec();

    assert!(task.extraction_path.ends_with("files/scene"));
    assert!(inventory.contains(&task.extraction_path.join("scene/Data/v.nrrd")));
    assert!(inventory.contains(&task.extraction_path.join("scene/scene.mrml")));
}

#[test]
fn gzip_member_lands_under_extraction_root() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let file: RemoteAddress = "/data/projects/P/resources/RAW/files/volume.nii.gz".parse().unwrap();
    let mut task = BundleTask::for_packed_file(&store, &file, ExtractLayout::Flatten);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"voxels").unwrap();
    write_file(&task.archive_path, &encoder.finish().unwrap());

    let inventory = archive.extract(&mut task).unwrap().to_vec();
    assert_eq!(inventory.len(), 1);
    assert_eq!(fs::read(inventory[0].as_std_path()).unwrap(), b"voxels");
}

#[test]
fn unrecognized_archive_fails_and_leaves_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let mut task = BundleTask::for_collection(&store, &collection());

    write_file(&task.archive_path, b"not an archive at all");
    let result = archive.extract(&mut task).map(|files| files.len());

    assert_matches!(result, Err(SyncError::ExtractionFailure { .. }));
    assert!(task.inventory().is_empty());
    assert!(!task.extraction_path.as_std_path().exists());
}

#[test]
fn missing_archive_is_an_extraction_failure() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let client = MockXnat::default();
    let credentials = Credentials::anonymous();
    let archive = Archive::new(&client, &credentials);
    let mut task = BundleTask::for_collection(&store, &collection());

    let result = archive.extract(&mut task).map(|files| files.len());
    assert_matches!(result, Err(SyncError::ExtractionFailure { message, .. }) if message.contains("missing"));
}

#[test]
fn bundle_fetch_uses_zip_query_and_reports_cancellation() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let task = BundleTask::for_collection(&store, &collection());
    let credentials = Credentials::anonymous();

    let client = MockXnat::default().serve(&format!("{COLLECTION}?format=zip"), zip_bytes(&[]));
    let archive = Archive::new(&client, &credentials);
    let outcome = archive.fetch_bundle(&task, &CancelToken::new()).unwrap();
    assert_eq!(outcome, FetchOutcome::Fetched);
    assert_eq!(client.downloads(), vec![format!("{COLLECTION}?format=zip")]);
    assert!(task.archive_path.as_std_path().is_file());

    let client = MockXnat::with_mode(DownloadMode::Cancel);
    let archive = Archive::new(&client, &credentials);
    let outcome = archive.fetch_bundle(&task, &CancelToken::new()).unwrap();
    assert_eq!(outcome, FetchOutcome::Aborted);
    assert!(!task.archive_path.as_std_path().exists());
}
