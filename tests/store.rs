use camino::Utf8PathBuf;

use xnat_sync::address::RemoteAddress;
use xnat_sync::store::Store;

#[test]
fn layout_paths() {
    let store = Store::new_with_paths(
        Utf8PathBuf::from("/cache/xnat-sync"),
        Utf8PathBuf::from("/config/xnat-sync"),
    );
    let file: RemoteAddress =
        "https://xnat.test/data/projects/P/subjects/S/experiments/E/resources/A/files/sub/foo.hdr"
            .parse()
            .unwrap();
    let collection = file.parent().unwrap();

    assert_eq!(
        store.local_path(&file),
        "/cache/xnat-sync/downloads/projects/P/subjects/S/experiments/E/resources/A/files/sub/foo.hdr"
    );
    assert_eq!(
        store.archive_path(&collection),
        "/cache/xnat-sync/downloads/projects/P/subjects/S/experiments/E/resources/A/files.zip"
    );
    assert_eq!(store.dicom_index_path(), "/cache/xnat-sync/dicom/index.json");
    assert_eq!(store.ledger_path(), "/config/xnat-sync/sessions.log");
    assert_eq!(store.upload_dir("brain"), "/cache/xnat-sync/uploads/brain");
    assert_eq!(store.upload_bundle_path("brain"), "/cache/xnat-sync/uploads/brain.zip");
}

#[test]
fn atomic_write_creates_parents_and_replaces() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let path = root.join("nested/dir/index.json");

    Store::write_bytes_atomic(&path, b"first").unwrap();
    Store::write_bytes_atomic(&path, b"second").unwrap();

    assert_eq!(std::fs::read(path.as_std_path()).unwrap(), b"second");
    let leftovers = std::fs::read_dir(root.join("nested/dir").as_std_path())
        .unwrap()
        .count();
    assert_eq!(leftovers, 1);
}

#[test]
fn copy_dir_recursive_mirrors_tree() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let source = root.join("src");
    std::fs::create_dir_all(source.join("Data").as_std_path()).unwrap();
    std::fs::write(source.join("scene.mrml").as_std_path(), b"<MRML/>").unwrap();
    std::fs::write(source.join("Data/v.nrrd").as_std_path(), b"v").unwrap();

    let dest = root.join("dest");
    Store::copy_dir_recursive(&source, &dest).unwrap();

    assert!(dest.join("scene.mrml").as_std_path().is_file());
    assert!(dest.join("Data/v.nrrd").as_std_path().is_file());
}
