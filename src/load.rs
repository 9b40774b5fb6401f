//! The load pipeline: cache check, fetch, extract, format dispatch and session
//! recording, with one `LoadFormat` implementation per file family.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::address::{Level, RemoteAddress};
use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::{Archive, BundleTask, ExtractLayout, FetchOutcome};
use crate::cache_index::{CacheVerdict, LocalCacheIndex};
use crate::config::{FormatSettings, HostSettings};
use crate::dicom::{self, DicomPlugin, SharedDicomIndex};
use crate::error::SyncError;
use crate::host::HostApplication;
use crate::ledger::{Session, SessionLedger, SessionType};
use crate::package::find_manifest;
use crate::store::Store;
use crate::xnat::{CancelToken, Credentials, XnatClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Generic,
    Analyze,
    Dicom,
    Scene,
}

impl FormatKind {
    /// Picks the file family from the requested file names.
    pub fn detect(addresses: &[RemoteAddress], formats: &FormatSettings) -> FormatKind {
        let names = addresses
            .iter()
            .map(|address| address.base_name())
            .collect::<Vec<_>>();
        if names.is_empty() {
            return FormatKind::Generic;
        }
        if names.iter().all(|name| formats.is_dicom(name)) {
            FormatKind::Dicom
        } else if names.iter().all(|name| formats.is_analyze(name)) {
            FormatKind::Analyze
        } else if names.len() == 1 && formats.is_scene_bundle(names[0]) {
            FormatKind::Scene
        } else {
            FormatKind::Generic
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FormatKind::Generic => "generic",
            FormatKind::Analyze => "analyze",
            FormatKind::Dicom => "dicom",
            FormatKind::Scene => "scene",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for FormatKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "generic" => Ok(FormatKind::Generic),
            "analyze" => Ok(FormatKind::Analyze),
            "dicom" => Ok(FormatKind::Dicom),
            "scene" => Ok(FormatKind::Scene),
            other => Err(SyncError::InvalidRequest(format!("unknown format: {other}"))),
        }
    }
}

/// Remote files requested together from one resource's `files` collection.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    addresses: Vec<RemoteAddress>,
    collection: RemoteAddress,
    pub destination_base: Utf8PathBuf,
    pub use_cache: bool,
    pub host: String,
    pub credentials: Credentials,
}

impl LoadRequest {
    pub fn new(
        addresses: Vec<RemoteAddress>,
        store: &Store,
        host: &HostSettings,
        credentials: Credentials,
    ) -> Result<Self, SyncError> {
        let first = addresses
            .first()
            .ok_or_else(|| SyncError::InvalidRequest("no files requested".to_string()))?;
        let collection = first
            .parent()
            .ok_or_else(|| SyncError::InvalidRequest(format!("{first} has no parent")))?;
        for address in &addresses {
            if !address.is_file() {
                return Err(SyncError::InvalidRequest(format!(
                    "{address} is not a file address"
                )));
            }
            let same_parent = address
                .parent()
                .map(|parent| parent.path() == collection.path())
                .unwrap_or(false);
            if !same_parent {
                return Err(SyncError::InvalidRequest(format!(
                    "{address} is not in {}",
                    collection.path()
                )));
            }
        }

        Ok(Self {
            addresses,
            collection,
            destination_base: store.downloads_root(),
            use_cache: host.use_cache,
            host: host.url.clone(),
            credentials,
        })
    }

    pub fn addresses(&self) -> &[RemoteAddress] {
        &self.addresses
    }

    /// The `files` collection every requested address belongs to.
    pub fn collection(&self) -> &RemoteAddress {
        &self.collection
    }

    fn first(&self) -> &RemoteAddress {
        &self.addresses[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStage {
    Init,
    CacheCheck,
    LoadFromCache,
    Fetch,
    Extract,
    Dispatch,
    RecordSession,
    Done,
    Aborted,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoadStage::Init => "INIT",
            LoadStage::CacheCheck => "CACHE_CHECK",
            LoadStage::LoadFromCache => "LOAD_FROM_CACHE",
            LoadStage::Fetch => "FETCH",
            LoadStage::Extract => "EXTRACT",
            LoadStage::Dispatch => "DISPATCH",
            LoadStage::RecordSession => "RECORD_SESSION",
            LoadStage::Done => "DONE",
            LoadStage::Aborted => "ABORTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Done {
        session: Session,
        files: Vec<Utf8PathBuf>,
        from_cache: bool,
    },
    Aborted,
    Failed {
        stage: LoadStage,
        #[serde(serialize_with = "serialize_error")]
        error: SyncError,
    },
}

#[derive(Debug, Serialize)]
pub struct LoadReport {
    pub uris: Vec<String>,
    pub format: FormatKind,
    pub stages: Vec<LoadStage>,
    pub outcome: LoadOutcome,
}

impl LoadReport {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, LoadOutcome::Done { .. })
    }
}

fn serialize_error<S: Serializer>(error: &SyncError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

pub struct LoadContext<'a> {
    pub store: &'a Store,
    pub formats: &'a FormatSettings,
}

pub enum FetchPlan {
    /// Each file is fetched straight to its final location.
    Files(Vec<(RemoteAddress, Utf8PathBuf)>),
    Bundle(BundleTask),
}

/// What differs between file families along the pipeline.
pub trait LoadFormat: Send + Sync {
    fn kind(&self) -> FormatKind;

    fn session_type(&self) -> SessionType;

    fn check_cache(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
    ) -> Result<CacheVerdict, SyncError>;

    fn fetch_plan(&self, ctx: &LoadContext<'_>, request: &LoadRequest) -> FetchPlan;

    /// Hands freshly fetched files to the host; returns the files it loaded.
    fn dispatch(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError>;

    fn load_cached(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        self.dispatch(ctx, request, files, host)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenericFormat;

impl LoadFormat for GenericFormat {
    fn kind(&self) -> FormatKind {
        FormatKind::Generic
    }

    fn session_type(&self) -> SessionType {
        SessionType::SceneDownload
    }

    fn check_cache(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
    ) -> Result<CacheVerdict, SyncError> {
        let index = LocalCacheIndex::new(ctx.formats);
        let hit = request
            .addresses()
            .iter()
            .all(|address| index.check_generic(address, &request.destination_base));
        if !hit {
            return Ok(CacheVerdict::miss());
        }
        Ok(CacheVerdict {
            hit,
            paths: request
                .addresses()
                .iter()
                .map(|address| request.destination_base.join(address.local_relative()))
                .collect(),
        })
    }

    fn fetch_plan(&self, _ctx: &LoadContext<'_>, request: &LoadRequest) -> FetchPlan {
        FetchPlan::Files(
            request
                .addresses()
                .iter()
                .map(|address| {
                    (
                        address.clone(),
                        request.destination_base.join(address.local_relative()),
                    )
                })
                .collect(),
        )
    }

    fn dispatch(
        &self,
        _ctx: &LoadContext<'_>,
        _request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let loaded = files
            .iter()
            .filter(|path| host.load_file(path))
            .cloned()
            .collect::<Vec<_>>();
        if loaded.is_empty() {
            return Err(SyncError::DispatchFailure(join_paths(files)));
        }
        Ok(loaded)
    }
}

/// Paired `.hdr`/`.img` volumes delivered as one collection bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeFormat;

impl LoadFormat for AnalyzeFormat {
    fn kind(&self) -> FormatKind {
        FormatKind::Analyze
    }

    fn session_type(&self) -> SessionType {
        SessionType::SceneDownload
    }

    fn check_cache(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
    ) -> Result<CacheVerdict, SyncError> {
        Ok(LocalCacheIndex::new(ctx.formats)
            .check_analyze_pair(request.addresses(), &request.destination_base))
    }

    fn fetch_plan(&self, ctx: &LoadContext<'_>, request: &LoadRequest) -> FetchPlan {
        FetchPlan::Bundle(BundleTask::for_collection(ctx.store, request.collection()))
    }

    fn dispatch(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let candidates = requested_files(files, request);
        let mut pairs: Vec<AnalyzePair> = Vec::new();
        for path in &candidates {
            let Some(name) = path.file_name() else {
                continue;
            };
            let is_header = ctx.formats.is_analyze_header(name);
            if !is_header && !ctx.formats.is_analyze_data(name) {
                continue;
            }
            let stem = path.file_stem().unwrap_or(name).to_string();
            let index = match pairs.iter().position(|pair| pair.stem == stem) {
                Some(index) => index,
                None => {
                    pairs.push(AnalyzePair::new(stem));
                    pairs.len() - 1
                }
            };
            if is_header {
                pairs[index].header.get_or_insert_with(|| path.clone());
            } else {
                pairs[index].data.get_or_insert_with(|| path.clone());
            }
        }

        let mut loaded = Vec::new();
        if pairs.iter().all(|pair| pair.header.is_none()) {
            if let Some(last) = candidates.last() {
                warn!(path = %last, "no Analyze header found, trying last file");
                if host.load_file(last) {
                    loaded.push(last.clone());
                }
            }
        } else {
            for pair in &pairs {
                if let Some(header) = &pair.header {
                    if host.load_file(header) {
                        loaded.push(header.clone());
                        continue;
                    }
                    warn!(path = %header, "header load failed, trying data file");
                }
                if let Some(data) = &pair.data {
                    if host.load_file(data) {
                        loaded.push(data.clone());
                    }
                }
            }
        }

        if loaded.is_empty() {
            return Err(SyncError::DispatchFailure(join_paths(&candidates)));
        }
        Ok(loaded)
    }
}

struct AnalyzePair {
    stem: String,
    header: Option<Utf8PathBuf>,
    data: Option<Utf8PathBuf>,
}

impl AnalyzePair {
    fn new(stem: String) -> Self {
        Self {
            stem,
            header: None,
            data: None,
        }
    }
}

/// DICOM series: files are indexed, then the largest loadable is handed over.
pub struct DicomFormat {
    index: SharedDicomIndex,
    plugin: Arc<dyn DicomPlugin>,
}

impl DicomFormat {
    pub fn new(index: SharedDicomIndex, plugin: Arc<dyn DicomPlugin>) -> Self {
        Self { index, plugin }
    }

    fn load_selection(
        &self,
        index: &dyn dicom::DicomIndex,
        wanted: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let wanted = wanted.iter().cloned().collect::<BTreeSet<_>>();
        let loadable = dicom::select_loadable(index, &wanted, self.plugin.as_ref())
            .ok_or_else(|| SyncError::DispatchFailure("no DICOM series found".to_string()))?;
        info!(
            series = %loadable.name,
            files = loadable.files.len(),
            "loading DICOM series"
        );
        if !host.load_dicom(&loadable) {
            return Err(SyncError::DispatchFailure(format!(
                "host rejected series {}",
                loadable.name
            )));
        }
        Ok(loadable.files)
    }
}

impl LoadFormat for DicomFormat {
    fn kind(&self) -> FormatKind {
        FormatKind::Dicom
    }

    fn session_type(&self) -> SessionType {
        SessionType::DicomDownload
    }

    fn check_cache(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
    ) -> Result<CacheVerdict, SyncError> {
        let index = self.index.lock().map_err(|_| poisoned())?;
        Ok(LocalCacheIndex::new(ctx.formats).check_dicom(
            request.addresses(),
            &request.destination_base,
            &*index,
        ))
    }

    fn fetch_plan(&self, ctx: &LoadContext<'_>, request: &LoadRequest) -> FetchPlan {
        FetchPlan::Bundle(BundleTask::for_collection(ctx.store, request.collection()))
    }

    fn dispatch(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let mut index = self.index.lock().map_err(|_| poisoned())?;
        let mut indexed = 0usize;
        for path in files {
            let by_name = path
                .file_name()
                .map(|name| ctx.formats.is_dicom(name))
                .unwrap_or(false);
            if !by_name && !dicom::is_dicom_file(path) {
                continue;
            }
            dicom::insert_with_lazy_init(&mut *index, path)?;
            indexed += 1;
        }
        index.flush()?;
        debug!(indexed, "DICOM files indexed");

        let wanted = requested_files(files, request);
        self.load_selection(&*index, &wanted, host)
    }

    fn load_cached(
        &self,
        _ctx: &LoadContext<'_>,
        _request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let index = self.index.lock().map_err(|_| poisoned())?;
        self.load_selection(&*index, files, host)
    }
}

fn poisoned() -> SyncError {
    SyncError::DicomIndex("index lock poisoned".to_string())
}

/// A packed scene (`.mrb`) extracted next to itself with its layout intact.
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneFormat;

impl SceneFormat {
    fn task(ctx: &LoadContext<'_>, request: &LoadRequest) -> BundleTask {
        BundleTask::for_packed_file(ctx.store, request.first(), ExtractLayout::Preserve)
    }
}

impl LoadFormat for SceneFormat {
    fn kind(&self) -> FormatKind {
        FormatKind::Scene
    }

    fn session_type(&self) -> SessionType {
        SessionType::SceneDownload
    }

    fn check_cache(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
    ) -> Result<CacheVerdict, SyncError> {
        let task = Self::task(ctx, request);
        if !task.extraction_path.as_std_path().is_dir() {
            return Ok(CacheVerdict::miss());
        }
        match find_manifest(&task.extraction_path, ctx.formats) {
            Ok(manifest) => Ok(CacheVerdict {
                hit: true,
                paths: vec![manifest],
            }),
            Err(err) => {
                debug!(error = %err, "cached scene unusable");
                Ok(CacheVerdict::miss())
            }
        }
    }

    fn fetch_plan(&self, ctx: &LoadContext<'_>, request: &LoadRequest) -> FetchPlan {
        FetchPlan::Bundle(Self::task(ctx, request))
    }

    fn dispatch(
        &self,
        ctx: &LoadContext<'_>,
        request: &LoadRequest,
        files: &[Utf8PathBuf],
        host: &dyn HostApplication,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let manifests = files
            .iter()
            .filter(|path| {
                path.file_name()
                    .map(|name| ctx.formats.is_manifest(name))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        let [manifest] = manifests.as_slice() else {
            return Err(SyncError::ManifestAmbiguity {
                directory: Self::task(ctx, request).extraction_path.to_string(),
                count: manifests.len(),
            });
        };
        if !host.load_file(manifest) {
            return Err(SyncError::DispatchFailure(manifest.to_string()));
        }
        Ok(vec![(*manifest).clone()])
    }
}

/// Inventory entries whose names were requested; the whole inventory when none match.
fn requested_files(files: &[Utf8PathBuf], request: &LoadRequest) -> Vec<Utf8PathBuf> {
    let names = request
        .addresses()
        .iter()
        .map(|address| address.base_name())
        .collect::<BTreeSet<_>>();
    let matched = files
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|name| names.contains(name))
                .unwrap_or(false)
        })
        .cloned()
        .collect::<Vec<_>>();
    if matched.is_empty() {
        files.to_vec()
    } else {
        matched
    }
}

fn join_paths(files: &[Utf8PathBuf]) -> String {
    if files.is_empty() {
        return "no files".to_string();
    }
    files
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The level a later save of this download targets: the experiment when
/// present, else the closest subject or project.
pub fn save_level_of(address: &RemoteAddress) -> RemoteAddress {
    [Level::Experiments, Level::Subjects, Level::Projects]
        .into_iter()
        .find_map(|level| address.ancestor(level))
        .unwrap_or_else(|| address.clone())
}

pub struct LoadDispatcher<'a, X: XnatClient> {
    ctx: LoadContext<'a>,
    client: &'a X,
    host: &'a dyn HostApplication,
    ledger: &'a SessionLedger,
    keep_archives: bool,
}

impl<'a, X: XnatClient> LoadDispatcher<'a, X> {
    pub fn new(
        store: &'a Store,
        formats: &'a FormatSettings,
        client: &'a X,
        host: &'a dyn HostApplication,
        ledger: &'a SessionLedger,
    ) -> Self {
        Self {
            ctx: LoadContext { store, formats },
            client,
            host,
            ledger,
            keep_archives: false,
        }
    }

    pub fn keep_archives(mut self, keep: bool) -> Self {
        self.keep_archives = keep;
        self
    }

    /// Drives one request to `Done`, `Aborted` or `Failed`; never returns an error.
    pub fn run(
        &self,
        request: &LoadRequest,
        format: &dyn LoadFormat,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> LoadReport {
        let mut stages = Vec::new();
        let outcome = match self.drive(request, format, cancel, sink, &mut stages) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                info!(uri = %request.first(), "load aborted");
                stages.push(LoadStage::Aborted);
                LoadOutcome::Aborted
            }
            Err(error) => {
                let stage = stages.last().copied().unwrap_or(LoadStage::Init);
                warn!(uri = %request.first(), %stage, error = %error, "load failed");
                LoadOutcome::Failed { stage, error }
            }
        };
        LoadReport {
            uris: request
                .addresses()
                .iter()
                .map(RemoteAddress::uri)
                .collect(),
            format: format.kind(),
            stages,
            outcome,
        }
    }

    fn drive(
        &self,
        request: &LoadRequest,
        format: &dyn LoadFormat,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
        stages: &mut Vec<LoadStage>,
    ) -> Result<Option<LoadOutcome>, SyncError> {
        if !enter(LoadStage::Init, request, cancel, sink, stages) {
            return Ok(None);
        }
        let session = build_session(request, format)?;

        if !enter(LoadStage::CacheCheck, request, cancel, sink, stages) {
            return Ok(None);
        }
        let verdict = if request.use_cache {
            format.check_cache(&self.ctx, request)?
        } else {
            debug!("cache disabled for host");
            CacheVerdict::miss()
        };
        debug!(hit = verdict.hit, paths = verdict.paths.len(), "cache verdict");

        if verdict.hit {
            if !enter(LoadStage::LoadFromCache, request, cancel, sink, stages) {
                return Ok(None);
            }
            let files = format.load_cached(&self.ctx, request, &verdict.paths, self.host)?;
            return self.record(session, files, true, request, cancel, sink, stages);
        }

        if !enter(LoadStage::Fetch, request, cancel, sink, stages) {
            return Ok(None);
        }
        let archive = Archive::new(self.client, &request.credentials);
        let (files, archive_path) = match format.fetch_plan(&self.ctx, request) {
            FetchPlan::Files(targets) => {
                let mut files = Vec::with_capacity(targets.len());
                for (address, destination) in targets {
                    if archive.fetch_single(&address, &destination, cancel)?
                        == FetchOutcome::Aborted
                    {
                        return Ok(None);
                    }
                    files.push(destination);
                }
                (files, None)
            }
            FetchPlan::Bundle(mut task) => {
                if archive.fetch_bundle(&task, cancel)? == FetchOutcome::Aborted {
                    return Ok(None);
                }
                if !enter(LoadStage::Extract, request, cancel, sink, stages) {
                    return Ok(None);
                }
                let files = archive.extract(&mut task)?.to_vec();
                (files, Some(task.archive_path))
            }
        };

        if !enter(LoadStage::Dispatch, request, cancel, sink, stages) {
            return Ok(None);
        }
        let loaded = format.dispatch(&self.ctx, request, &files, self.host);
        if let Some(archive_path) = archive_path {
            if !self.keep_archives {
                if let Err(err) = Store::remove_file_if_exists(&archive_path) {
                    warn!(error = %err, archive = %archive_path, "failed to remove archive");
                }
            }
        }
        let loaded = loaded?;
        self.record(session, loaded, false, request, cancel, sink, stages)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        session: Session,
        files: Vec<Utf8PathBuf>,
        from_cache: bool,
        request: &LoadRequest,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
        stages: &mut Vec<LoadStage>,
    ) -> Result<Option<LoadOutcome>, SyncError> {
        if !enter(LoadStage::RecordSession, request, cancel, sink, stages) {
            return Ok(None);
        }
        self.ledger.record(&session)?;
        stages.push(LoadStage::Done);
        info!(uri = %request.first(), files = files.len(), from_cache, "load done");
        Ok(Some(LoadOutcome::Done {
            session,
            files,
            from_cache,
        }))
    }
}

fn enter(
    stage: LoadStage,
    request: &LoadRequest,
    cancel: &CancelToken,
    sink: &dyn ProgressSink,
    stages: &mut Vec<LoadStage>,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    stages.push(stage);
    info!(%stage, uri = %request.first(), "load stage");
    sink.event(ProgressEvent {
        message: format!("phase={stage}; {}", request.first().path()),
        elapsed: None,
    });
    true
}

fn build_session(request: &LoadRequest, format: &dyn LoadFormat) -> Result<Session, SyncError> {
    let first = request.first();
    let subject = match format.kind() {
        FormatKind::Dicom | FormatKind::Analyze => request.collection(),
        FormatKind::Generic | FormatKind::Scene => first,
    };
    Session::builder(format.session_type())
        .host(request.host.as_str())
        .username(request.credentials.username.as_str())
        .save_level(save_level_of(first).path())
        .save_uri(subject.path())
        .file_name(first.base_name())
        .build()
}
