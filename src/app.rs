use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::address::{Level, RemoteAddress};
use crate::config::{HostSettings, ResolvedConfig};
use crate::dicom::{DicomPlugin, LocalDicomIndex, SeriesPlugin, SharedDicomIndex};
use crate::error::SyncError;
use crate::host::{HostApplication, SceneSerializer};
use crate::ledger::{Session, SessionLedger, SessionType};
use crate::load::{
    AnalyzeFormat, DicomFormat, FormatKind, GenericFormat, LoadContext, LoadDispatcher,
    LoadFormat, LoadReport, LoadRequest, SceneFormat,
};
use crate::package::{ScenePackager, package_name};
use crate::store::Store;
use crate::xnat::{CancelToken, Credentials, XnatClient};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Configured host name or URL; defaults to the address host or the only configured host.
    pub host: Option<String>,
    pub format: Option<FormatKind>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub uris: Vec<String>,
    pub format: FormatKind,
    pub use_cache: bool,
    pub hit: bool,
    pub paths: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Remote level the scene is attached to, e.g. an experiment.
    pub save_level: String,
    pub file_name: String,
    /// Whether the scene came from an earlier download session.
    pub linked: bool,
    pub host: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveStage {
    Package,
    Compress,
    Upload,
    RecordSession,
    Done,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Done {
        session: Session,
        bundle: Option<Utf8PathBuf>,
    },
    Failed {
        stage: SaveStage,
        #[serde(serialize_with = "serialize_error")]
        error: SyncError,
        bundle: Option<Utf8PathBuf>,
    },
}

#[derive(Debug, Serialize)]
pub struct SaveReport {
    pub save_uri: String,
    pub stages: Vec<SaveStage>,
    pub outcome: SaveOutcome,
}

impl SaveReport {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, SaveOutcome::Done { .. })
    }
}

fn serialize_error<S: Serializer>(error: &SyncError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<X: XnatClient, H: HostApplication> {
    store: Store,
    config: ResolvedConfig,
    client: X,
    host: H,
    ledger: SessionLedger,
    dicom_index: SharedDicomIndex,
    plugin: Arc<dyn DicomPlugin>,
}

impl<X: XnatClient, H: HostApplication> App<X, H> {
    pub fn new(store: Store, config: ResolvedConfig, client: X, host: H) -> Result<Self, SyncError> {
        let dicom_index = LocalDicomIndex::open(store.dicom_index_path())?.shared();
        let ledger = SessionLedger::new(store.ledger_path());
        Ok(Self {
            store,
            config,
            client,
            host,
            ledger,
            dicom_index,
            plugin: Arc::new(SeriesPlugin),
        })
    }

    pub fn with_dicom(mut self, index: SharedDicomIndex, plugin: Arc<dyn DicomPlugin>) -> Self {
        self.dicom_index = index;
        self.plugin = plugin;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn client(&self) -> &X {
        &self.client
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    pub fn dicom_index(&self) -> SharedDicomIndex {
        Arc::clone(&self.dicom_index)
    }

    /// Runs the load pipeline. Errors are only returned for requests that
    /// cannot be built; pipeline failures land in the report.
    pub fn load(
        &self,
        uris: &[String],
        options: &LoadOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReport, SyncError> {
        let start = Instant::now();
        let (request, format) = self.prepare(uris, options)?;
        self.store.ensure_cache_root()?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} file(s) as {}",
                request.addresses().len(),
                format.kind()
            ),
            elapsed: None,
        });

        let dispatcher = LoadDispatcher::new(
            &self.store,
            &self.config.formats,
            &self.client,
            &self.host,
            &self.ledger,
        )
        .keep_archives(self.config.keep_archives);
        let report = dispatcher.run(&request, format.as_ref(), cancel, sink);

        sink.event(ProgressEvent {
            message: format!("phase=Finish; stages={}", report.stages.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    /// Cache verdict for a request without fetching or loading anything.
    pub fn check(&self, uris: &[String], options: &LoadOptions) -> Result<CheckReport, SyncError> {
        let (request, format) = self.prepare(uris, options)?;
        let ctx = LoadContext {
            store: &self.store,
            formats: &self.config.formats,
        };
        let verdict = format.check_cache(&ctx, &request)?;
        Ok(CheckReport {
            uris: request.addresses().iter().map(RemoteAddress::uri).collect(),
            format: format.kind(),
            use_cache: request.use_cache,
            hit: verdict.hit,
            paths: verdict.paths,
        })
    }

    /// Packages, compresses and uploads the current scene, then records the session.
    pub fn save(
        &self,
        request: &SaveRequest,
        serializer: &dyn SceneSerializer,
        sink: &dyn ProgressSink,
    ) -> Result<SaveReport, SyncError> {
        let save_level: RemoteAddress = request.save_level.parse()?;
        let has_id = save_level
            .segments()
            .last()
            .map(|segment| segment.id.is_some())
            .unwrap_or(false);
        let attachable = matches!(
            save_level.level(),
            Level::Projects | Level::Subjects | Level::Experiments | Level::Scans
        );
        if !has_id || !attachable {
            return Err(SyncError::InvalidRequest(format!(
                "cannot save a scene under {save_level}"
            )));
        }
        let name = package_name(&request.file_name)?;
        let save_uri = save_level
            .child(Level::Resources, &self.config.upload_resource)?
            .child(Level::Files, &format!("{name}.zip"))?;

        let host = self.config.host_for(&save_level, request.host.as_deref())?;
        let credentials = credentials_for(&host, request.password.as_deref());
        let session_type = if request.linked {
            SessionType::SceneUpload
        } else {
            SessionType::SceneUploadUnlinked
        };
        let session = Session::builder(session_type)
            .host(host.url.as_str())
            .username(credentials.username.as_str())
            .save_level(save_level.path())
            .save_uri(save_uri.path())
            .file_name(name.as_str())
            .build()?;

        self.store.ensure_cache_root()?;
        let mut stages = Vec::new();
        let mut bundle = None;
        let outcome = match self.drive_save(
            &session,
            &save_uri,
            &credentials,
            serializer,
            sink,
            &mut stages,
            &mut bundle,
        ) {
            Ok(()) => SaveOutcome::Done { session, bundle },
            Err(error) => {
                let stage = stages.last().copied().unwrap_or(SaveStage::Package);
                warn!(uri = %save_uri, ?stage, error = %error, "save failed");
                SaveOutcome::Failed {
                    stage,
                    error,
                    bundle,
                }
            }
        };

        Ok(SaveReport {
            save_uri: save_uri.path(),
            stages,
            outcome,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn drive_save(
        &self,
        session: &Session,
        save_uri: &RemoteAddress,
        credentials: &Credentials,
        serializer: &dyn SceneSerializer,
        sink: &dyn ProgressSink,
        stages: &mut Vec<SaveStage>,
        bundle: &mut Option<Utf8PathBuf>,
    ) -> Result<(), SyncError> {
        let packager = ScenePackager::new(&self.store, &self.config.formats);
        let mut enter = |stage: SaveStage| {
            stages.push(stage);
            info!(?stage, uri = %save_uri, "save stage");
            sink.event(ProgressEvent {
                message: format!("phase={stage:?}; {}", save_uri.path()),
                elapsed: None,
            });
        };

        enter(SaveStage::Package);
        let mut package = packager.package_scene(session, serializer)?;

        enter(SaveStage::Compress);
        let compressed = packager.compress(&mut package)?;
        *bundle = Some(compressed.clone());
        if let Err(err) = Store::remove_dir_if_exists(&package.directory) {
            warn!(error = %err, "failed to remove package directory");
        }

        enter(SaveStage::Upload);
        self.client
            .upload(compressed.as_std_path(), save_uri, credentials)?;

        enter(SaveStage::RecordSession);
        self.ledger.record(session)?;

        if !self.config.keep_archives {
            match Store::remove_file_if_exists(&compressed) {
                Ok(()) => *bundle = None,
                Err(err) => warn!(error = %err, "failed to remove uploaded bundle"),
            }
        }
        enter(SaveStage::Done);
        Ok(())
    }

    fn prepare(
        &self,
        uris: &[String],
        options: &LoadOptions,
    ) -> Result<(LoadRequest, Box<dyn LoadFormat>), SyncError> {
        let addresses = uris
            .iter()
            .map(|uri| uri.parse::<RemoteAddress>())
            .collect::<Result<Vec<_>, _>>()?;
        let first = addresses
            .first()
            .ok_or_else(|| SyncError::InvalidRequest("no files requested".to_string()))?;
        let host = self.config.host_for(first, options.host.as_deref())?;
        let credentials = credentials_for(&host, options.password.as_deref());

        let kind = options
            .format
            .unwrap_or_else(|| FormatKind::detect(&addresses, &self.config.formats));
        let format: Box<dyn LoadFormat> = match kind {
            FormatKind::Generic => Box::new(GenericFormat),
            FormatKind::Analyze => Box::new(AnalyzeFormat),
            FormatKind::Dicom => Box::new(DicomFormat::new(
                Arc::clone(&self.dicom_index),
                Arc::clone(&self.plugin),
            )),
            FormatKind::Scene => Box::new(SceneFormat),
        };
        let request = LoadRequest::new(addresses, &self.store, &host, credentials)?;
        Ok((request, format))
    }
}

fn credentials_for(host: &HostSettings, password: Option<&str>) -> Credentials {
    match &host.username {
        Some(username) => Credentials::new(username.as_str(), password.unwrap_or_default()),
        None => Credentials::anonymous(),
    }
}
