use std::fs;

use assert_matches::assert_matches;

use xnat_sync::address::{Level, RemoteAddress};
use xnat_sync::config::{
    Config, ConfigLoader, HostEntry, HostEntryObject, default_upload_resource,
};
use xnat_sync::error::SyncError;

fn write_config(content: &str) -> (tempfile::TempDir, String) {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("xnat-sync.json");
    fs::write(&path, content).unwrap();
    let path = path.to_string_lossy().into_owned();
    (temp, path)
}

#[test]
fn resolve_detailed_hosts_and_formats_from_file() {
    let (_temp, path) = write_config(
        r#"{
            "schema_version": 1,
            "cache_root": "/var/cache/xnat-sync",
            "keep_archives": true,
            "upload_resource": "Scenes",
            "hosts": [
                "https://central.xnat.org/",
                { "name": "lab", "url": "https://xnat.lab.example", "username": "alice", "use_cache": false }
            ],
            "formats": { "dicom": ["dcm"], "analyze_splitter": "subjects" }
        }"#,
    );

    let resolved = ConfigLoader::resolve(Some(path.as_str())).unwrap();
    assert_eq!(resolved.cache_root.as_deref().map(|p| p.as_str()), Some("/var/cache/xnat-sync"));
    assert!(resolved.keep_archives);
    assert_eq!(resolved.upload_resource, "Scenes");
    assert_eq!(resolved.hosts.len(), 2);
    assert_eq!(resolved.hosts[0].name, "https://central.xnat.org");
    assert!(resolved.hosts[0].use_cache);
    assert_eq!(resolved.hosts[1].username.as_deref(), Some("alice"));
    assert!(!resolved.hosts[1].use_cache);
    assert_eq!(resolved.formats.dicom, vec!["dcm".to_string()]);
    assert_eq!(resolved.formats.analyze_splitter, Level::Subjects);
    assert_eq!(resolved.formats.dicom_splitter, Level::Projects);
    assert!(resolved.formats.is_manifest("scene.mrml"));
}

#[test]
fn missing_explicit_config_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let result = ConfigLoader::resolve(path.to_str());
    assert_matches!(result, Err(SyncError::ConfigRead(read)) if read == path);
}

#[test]
fn invalid_json_and_bad_urls_are_parse_errors() {
    let (_temp, path) = write_config("{ hosts: ");
    assert_matches!(ConfigLoader::resolve(Some(path.as_str())), Err(SyncError::ConfigParse(_)));

    let config = Config {
        hosts: vec![HostEntry::Shorthand("ftp://xnat.example".to_string())],
        ..Config::default()
    };
    assert_matches!(ConfigLoader::resolve_config(config), Err(SyncError::ConfigParse(_)));
}

#[test]
fn host_lookup_by_name_url_or_sole_entry() {
    let config = Config {
        hosts: vec![HostEntry::Detailed(HostEntryObject {
            name: Some("lab".to_string()),
            url: "https://xnat.lab.example".to_string(),
            username: Some("alice".to_string()),
            use_cache: None,
        })],
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.upload_resource, default_upload_resource());

    assert_eq!(resolved.host("lab").unwrap().url, "https://xnat.lab.example");
    assert_eq!(resolved.host("https://xnat.lab.example/").unwrap().name, "lab");
    assert!(resolved.host("https://other.example").unwrap().username.is_none());
    assert_matches!(resolved.host("elsewhere"), Err(SyncError::UnknownHost(_)));

    let relative: RemoteAddress = "/data/projects/P".parse().unwrap();
    assert_eq!(resolved.host_for(&relative, None).unwrap().name, "lab");

    let absolute: RemoteAddress = "https://xnat.lab.example/data/projects/P".parse().unwrap();
    assert_eq!(resolved.host_for(&absolute, None).unwrap().name, "lab");
}
