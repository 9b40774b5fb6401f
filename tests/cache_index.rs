mod common;

use camino::Utf8PathBuf;

use xnat_sync::address::{Level, RemoteAddress};
use xnat_sync::cache_index::{LocalCacheIndex, analyze_key};
use xnat_sync::config::FormatSettings;
use xnat_sync::dicom::{DicomIndex, LocalDicomIndex};

use common::{temp_store, write_file};

fn address(uri: &str) -> RemoteAddress {
    uri.parse().unwrap()
}

#[test]
fn missing_destination_root_is_a_clean_miss() {
    let formats = FormatSettings::default();
    let index = LocalCacheIndex::new(&formats);
    let root = Utf8PathBuf::from("/nonexistent/xnat-sync/downloads");
    let hdr = address("/data/projects/P/subjects/S/experiments/E/resources/A/files/foo.hdr");

    assert!(!index.check_generic(&hdr, &root));
    assert!(!index.check_analyze_pair(&[hdr], &root).hit);
}

#[test]
fn analyze_pair_hits_only_when_every_key_matches() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let formats = FormatSettings::default();
    let index = LocalCacheIndex::new(&formats);
    let hdr = address("/data/projects/P/subjects/S/experiments/E/resources/A/files/foo.hdr");
    let img = address("/data/projects/P/subjects/S/experiments/E/resources/A/files/foo.img");

    write_file(&store.local_path(&hdr), b"h");
    let verdict = index.check_analyze_pair(&[hdr.clone(), img.clone()], &store.downloads_root());
    assert!(!verdict.hit);
    assert!(verdict.paths.is_empty());

    write_file(&store.local_path(&img), b"i");
    let verdict = index.check_analyze_pair(&[img.clone(), hdr.clone()], &store.downloads_root());
    assert!(verdict.hit);
    assert!(verdict.paths[0].ends_with("foo.img"));
    assert!(verdict.paths[1].ends_with("foo.hdr"));
}

#[test]
fn analyze_duplicates_never_inflate_the_count() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let formats = FormatSettings::default();
    let index = LocalCacheIndex::new(&formats);
    let hdr = address("/data/projects/P/subjects/S/experiments/E/resources/A/files/foo.hdr");
    let img = address("/data/projects/P/subjects/S/experiments/E/resources/A/files/foo.img");

    // same basename under another resource of the same experiment
    write_file(&store.local_path(&hdr), b"h");
    write_file(
        &store
            .downloads_root()
            .join("projects/P/subjects/S/experiments/E/resources/B/files/foo.hdr"),
        b"h",
    );
    let verdict = index.check_analyze_pair(&[hdr.clone(), img], &store.downloads_root());
    assert!(!verdict.hit);

    // a request naming the same key twice cannot hit
    let same_key = address("/data/projects/P/subjects/S/experiments/E/resources/B/files/foo.hdr");
    let verdict = index.check_analyze_pair(&[hdr, same_key], &store.downloads_root());
    assert!(!verdict.hit);
}

#[test]
fn analyze_keys_use_the_splitter_segment() {
    let hdr = address("/data/projects/P/subjects/S/experiments/E7/resources/A/files/sub/foo.hdr");
    assert_eq!(analyze_key(&hdr, Level::Experiments).as_deref(), Some("E7/foo.hdr"));
    assert_eq!(analyze_key(&hdr, Level::Subjects).as_deref(), Some("S/foo.hdr"));
}

#[test]
fn dicom_check_uses_most_recent_index_entry() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let formats = FormatSettings::default();
    let cache = LocalCacheIndex::new(&formats);
    let a = address("/data/projects/P/subjects/S/experiments/E/scans/1/resources/DICOM/files/a.dcm");
    let b = address("/data/projects/P/subjects/S/experiments/E/scans/1/resources/DICOM/files/b.dcm");

    let mut index = LocalDicomIndex::open(store.dicom_index_path()).unwrap();
    assert!(!cache.check_dicom(&[a.clone()], &store.downloads_root(), &index).hit);

    index.initialize().unwrap();
    let local_a = store.local_path(&a);
    write_file(&local_a, b"a");
    index.insert(&local_a).unwrap();

    let verdict = cache.check_dicom(&[a.clone()], &store.downloads_root(), &index);
    assert!(verdict.hit);
    assert_eq!(verdict.paths, vec![local_a.clone()]);
    assert!(!cache.check_dicom(&[a.clone(), b], &store.downloads_root(), &index).hit);

    // a copy of the same remote file under another cache root, indexed later, wins
    let newer = store
        .cache_root()
        .join("mirror/projects/P/subjects/S/experiments/E/scans/1/resources/DICOM/files/a.dcm");
    write_file(&newer, b"a");
    index.insert(&newer).unwrap();
    let verdict = cache.check_dicom(&[a], &store.downloads_root(), &index);
    assert_eq!(verdict.paths, vec![newer]);
}

#[test]
fn dicom_ids_named_like_levels_still_hit() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let formats = FormatSettings::default();
    let cache = LocalCacheIndex::new(&formats);
    let file = address(
        "/data/projects/P/subjects/projects/experiments/E/scans/1/resources/DICOM/files/a.dcm",
    );

    let mut index = LocalDicomIndex::open(store.dicom_index_path()).unwrap();
    index.initialize().unwrap();
    let local = store.local_path(&file);
    write_file(&local, b"a");
    index.insert(&local).unwrap();

    let verdict = cache.check_dicom(&[file], &store.downloads_root(), &index);
    assert!(verdict.hit);
    assert_eq!(verdict.paths, vec![local]);
}
