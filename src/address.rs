use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

static URI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<host>[A-Za-z][A-Za-z0-9+.\-]*://[^/?#]+)?(?P<path>/[^?#]*)?(?:\?(?P<query>[^#]*))?$",
    )
    .unwrap()
});

/// One level of the XNAT resource hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Projects,
    Subjects,
    Experiments,
    Scans,
    Reconstructions,
    Assessors,
    Resources,
    Files,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Projects => "projects",
            Level::Subjects => "subjects",
            Level::Experiments => "experiments",
            Level::Scans => "scans",
            Level::Reconstructions => "reconstructions",
            Level::Assessors => "assessors",
            Level::Resources => "resources",
            Level::Files => "files",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Level::Projects => 0,
            Level::Subjects => 1,
            Level::Experiments => 2,
            Level::Scans | Level::Reconstructions | Level::Assessors => 3,
            Level::Resources => 4,
            Level::Files => 5,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "projects" => Ok(Level::Projects),
            "subjects" => Ok(Level::Subjects),
            "experiments" => Ok(Level::Experiments),
            "scans" => Ok(Level::Scans),
            "reconstructions" => Ok(Level::Reconstructions),
            "assessors" => Ok(Level::Assessors),
            "resources" => Ok(Level::Resources),
            "files" => Ok(Level::Files),
            _ => Err(SyncError::InvalidAddress(format!(
                "unknown hierarchy level `{value}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryFormat {
    #[default]
    Single,
    Bundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub level: Level,
    /// `None` for a bare collection such as `.../files`; only the last segment may be bare.
    pub id: Option<String>,
}

/// A parsed, immutable locator for a remote XNAT resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    host: Option<String>,
    segments: Vec<Segment>,
    query: QueryFormat,
}

impl RemoteAddress {
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn query(&self) -> QueryFormat {
        self.query
    }

    pub fn with_query(&self, query: QueryFormat) -> Self {
        Self {
            query,
            ..self.clone()
        }
    }

    /// Appends a child segment, e.g. `resources/Slicer` below an experiment.
    pub fn child(&self, level: Level, id: &str) -> Result<Self, SyncError> {
        let mut path = self.path();
        path.push('/');
        path.push_str(level.as_str());
        path.push('/');
        path.push_str(id);
        let mut child: RemoteAddress = path.parse()?;
        child.host = self.host.clone();
        Ok(child)
    }

    pub fn level(&self) -> Level {
        self.segments
            .last()
            .map(|segment| segment.level)
            .unwrap_or(Level::Projects)
    }

    pub fn is_file(&self) -> bool {
        self.segments
            .last()
            .map(|segment| segment.level == Level::Files && segment.id.is_some())
            .unwrap_or(false)
    }

    pub fn id_at(&self, level: Level) -> Option<&str> {
        self.segments
            .iter()
            .find(|segment| segment.level == level)
            .and_then(|segment| segment.id.as_deref())
    }

    pub fn parent(&self) -> Option<Self> {
        let last = self.segments.last()?;
        let mut segments = self.segments.clone();
        if last.id.is_some() {
            if let Some(segment) = segments.last_mut() {
                segment.id = None;
            }
        } else {
            segments.pop();
            if segments.is_empty() {
                return None;
            }
        }
        Some(Self {
            host: self.host.clone(),
            segments,
            query: QueryFormat::Single,
        })
    }

    /// Truncates the address so it ends at `level` (including its id).
    pub fn ancestor(&self, level: Level) -> Option<Self> {
        let position = self
            .segments
            .iter()
            .position(|segment| segment.level == level && segment.id.is_some())?;
        Some(Self {
            host: self.host.clone(),
            segments: self.segments[..=position].to_vec(),
            query: QueryFormat::Single,
        })
    }

    pub fn base_name(&self) -> &str {
        match self.segments.last() {
            Some(Segment { id: Some(id), .. }) => id.rsplit('/').next().unwrap_or(id),
            Some(Segment { level, id: None }) => level.as_str(),
            None => "",
        }
    }

    pub fn path(&self) -> String {
        let mut path = String::from("/data");
        for segment in &self.segments {
            path.push('/');
            path.push_str(segment.level.as_str());
            if let Some(id) = &segment.id {
                path.push('/');
                path.push_str(id);
            }
        }
        path
    }

    pub fn uri(&self) -> String {
        let mut uri = String::new();
        if let Some(host) = &self.host {
            uri.push_str(host);
        }
        uri.push_str(&self.path());
        if self.query == QueryFormat::Bundle {
            uri.push_str("?format=zip");
        }
        uri
    }

    /// Everything after `/<splitter>/` in the path, independent of host and local root.
    pub fn abbreviated_key(&self, splitter: Level) -> Option<String> {
        let marker = format!("/{}/", splitter.as_str());
        self.path()
            .split_once(&marker)
            .map(|(_, rest)| rest.to_string())
    }

    /// Cache-relative location mirroring the remote hierarchy.
    pub fn local_relative(&self) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::new();
        for segment in &self.segments {
            path.push(segment.level.as_str());
            if let Some(id) = &segment.id {
                for part in id.split('/') {
                    path.push(part);
                }
            }
        }
        path
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl FromStr for RemoteAddress {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.chars().any(char::is_control) {
            return Err(SyncError::InvalidAddress(format!(
                "{}: control characters are not allowed",
                trimmed.escape_debug()
            )));
        }
        let captures = URI_PATTERN
            .captures(trimmed)
            .ok_or_else(|| SyncError::InvalidAddress(value.to_string()))?;
        let host = captures
            .name("host")
            .map(|host| host.as_str().trim_end_matches('/').to_string());
        let path = captures.name("path").map(|path| path.as_str()).unwrap_or("");
        let query = captures
            .name("query")
            .map(|query| parse_query(query.as_str()))
            .unwrap_or_default();

        let parts = path
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        let mut start = 0;
        if parts
            .first()
            .is_some_and(|part| part.eq_ignore_ascii_case("data") || part.eq_ignore_ascii_case("rest"))
        {
            start = 1;
        }
        if parts.get(start).is_some_and(|part| *part == "archive") {
            start += 1;
        }

        let segments = parse_segments(&parts[start..], value)?;
        Ok(Self {
            host,
            segments,
            query,
        })
    }
}

fn parse_query(query: &str) -> QueryFormat {
    let bundle = query.split('&').any(|pair| {
        pair.split_once('=')
            .map(|(key, value)| key == "format" && value.eq_ignore_ascii_case("zip"))
            .unwrap_or(false)
    });
    if bundle {
        QueryFormat::Bundle
    } else {
        QueryFormat::Single
    }
}

fn parse_segments(parts: &[&str], raw: &str) -> Result<Vec<Segment>, SyncError> {
    if parts.is_empty() {
        return Err(SyncError::InvalidAddress(format!("{raw}: empty path")));
    }
    if parts.iter().any(|part| *part == "." || *part == "..") {
        return Err(SyncError::InvalidAddress(format!(
            "{raw}: relative path components are not allowed"
        )));
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut index = 0;
    while index < parts.len() {
        let level: Level = parts[index]
            .parse()
            .map_err(|_| SyncError::InvalidAddress(format!("{raw}: unexpected `{}`", parts[index])))?;
        match segments.last() {
            None if level != Level::Projects => {
                return Err(SyncError::InvalidAddress(format!(
                    "{raw}: path must start at projects"
                )));
            }
            Some(previous) if level.rank() <= previous.level.rank() => {
                return Err(SyncError::InvalidAddress(format!(
                    "{raw}: `{level}` cannot follow `{}`",
                    previous.level
                )));
            }
            _ => {}
        }
        index += 1;

        if level == Level::Files {
            let id = parts[index..].join("/");
            segments.push(Segment {
                level,
                id: (!id.is_empty()).then_some(id),
            });
            break;
        }

        match parts.get(index) {
            Some(id) => {
                segments.push(Segment {
                    level,
                    id: Some(id.to_string()),
                });
                index += 1;
            }
            None => segments.push(Segment { level, id: None }),
        }
    }
    Ok(segments)
}
