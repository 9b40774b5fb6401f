use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::address::{Level, RemoteAddress};
use crate::error::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "xnat-sync.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub cache_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub settings_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub formats: Option<FormatSettings>,
    #[serde(default)]
    pub keep_archives: Option<bool>,
    #[serde(default)]
    pub upload_resource: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HostEntry {
    Shorthand(String),
    Detailed(HostEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HostEntryObject {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub use_cache: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub use_cache: bool,
}

/// Extension lists and key splitters used to classify and match files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FormatSettings {
    pub dicom: Vec<String>,
    pub analyze_header: Vec<String>,
    pub analyze_data: Vec<String>,
    pub scene_bundle: Vec<String>,
    pub manifest: Vec<String>,
    pub analyze_splitter: Level,
    pub dicom_splitter: Level,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            dicom: vec!["dcm".to_string(), "ima".to_string()],
            analyze_header: vec!["hdr".to_string()],
            analyze_data: vec!["img".to_string()],
            scene_bundle: vec!["mrb".to_string(), "zip".to_string()],
            manifest: vec!["mrml".to_string()],
            analyze_splitter: Level::Experiments,
            dicom_splitter: Level::Projects,
        }
    }
}

impl FormatSettings {
    pub fn is_dicom(&self, name: &str) -> bool {
        has_extension(name, &self.dicom)
    }

    pub fn is_analyze_header(&self, name: &str) -> bool {
        has_extension(name, &self.analyze_header)
    }

    pub fn is_analyze_data(&self, name: &str) -> bool {
        has_extension(name, &self.analyze_data)
    }

    pub fn is_analyze(&self, name: &str) -> bool {
        self.is_analyze_header(name) || self.is_analyze_data(name)
    }

    pub fn is_scene_bundle(&self, name: &str) -> bool {
        has_extension(name, &self.scene_bundle)
    }

    pub fn is_manifest(&self, name: &str) -> bool {
        has_extension(name, &self.manifest)
    }
}

pub fn has_extension(name: &str, extensions: &[String]) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub cache_root: Option<Utf8PathBuf>,
    pub settings_dir: Option<Utf8PathBuf>,
    pub hosts: Vec<HostSettings>,
    pub formats: FormatSettings,
    pub keep_archives: bool,
    pub upload_resource: String,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            cache_root: None,
            settings_dir: None,
            hosts: Vec::new(),
            formats: FormatSettings::default(),
            keep_archives: false,
            upload_resource: default_upload_resource(),
        }
    }
}

impl ResolvedConfig {
    /// Looks a host up by configured name or URL; an unconfigured absolute URL
    /// is accepted with caching enabled.
    pub fn host(&self, name_or_url: &str) -> Result<HostSettings, SyncError> {
        let wanted = name_or_url.trim_end_matches('/');
        if let Some(host) = self
            .hosts
            .iter()
            .find(|host| host.name == wanted || host.url == wanted)
        {
            return Ok(host.clone());
        }
        if wanted.contains("://") {
            return Ok(HostSettings {
                name: wanted.to_string(),
                url: wanted.to_string(),
                username: None,
                use_cache: true,
            });
        }
        Err(SyncError::UnknownHost(name_or_url.to_string()))
    }

    /// Host for an address that carries its own URL, or the only configured host.
    pub fn host_for(
        &self,
        address: &RemoteAddress,
        requested: Option<&str>,
    ) -> Result<HostSettings, SyncError> {
        if let Some(name) = requested {
            return self.host(name);
        }
        if let Some(url) = address.host() {
            return self.host(url);
        }
        match self.hosts.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(SyncError::UnknownHost(address.uri())),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let hosts = config
            .hosts
            .into_iter()
            .map(|entry| match entry {
                HostEntry::Shorthand(url) => resolve_host(None, url, None, None),
                HostEntry::Detailed(obj) => {
                    resolve_host(obj.name, obj.url, obj.username, obj.use_cache)
                }
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            cache_root: config.cache_root,
            settings_dir: config.settings_dir,
            hosts,
            formats: config.formats.unwrap_or_default(),
            keep_archives: config.keep_archives.unwrap_or(false),
            upload_resource: config
                .upload_resource
                .unwrap_or_else(default_upload_resource),
        })
    }
}

fn resolve_host(
    name: Option<String>,
    url: String,
    username: Option<String>,
    use_cache: Option<bool>,
) -> Result<HostSettings, SyncError> {
    let url = url.trim().trim_end_matches('/').to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(SyncError::ConfigParse(format!(
            "host url must start with http:// or https://: {url}"
        )));
    }
    Ok(HostSettings {
        name: name.unwrap_or_else(|| url.clone()),
        url,
        username,
        use_cache: use_cache.unwrap_or(true),
    })
}

pub fn default_upload_resource() -> String {
    "Slicer".to_string()
}
