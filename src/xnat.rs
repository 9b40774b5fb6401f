use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::address::RemoteAddress;
use crate::error::SyncError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Cooperative cancellation flag shared between a caller and a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opaque Basic-Auth credentials. The password never appears in `Debug` output.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Byte transport to and from the remote archive.
///
/// `download` must leave `destination` absent when `cancel` fires mid-transfer;
/// callers treat an absent file as an aborted fetch rather than an error.
pub trait XnatClient: Send + Sync {
    fn download(
        &self,
        address: &RemoteAddress,
        credentials: &Credentials,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<(), SyncError>;

    fn upload(
        &self,
        bundle: &Path,
        address: &RemoteAddress,
        credentials: &Credentials,
    ) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct XnatHttpClient {
    client: Client,
    base_url: String,
}

impl XnatHttpClient {
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("xnat-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::XnatHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| SyncError::XnatHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, address: &RemoteAddress) -> String {
        match address.host() {
            Some(_) => address.uri(),
            None => format!("{}{}", self.base_url, address.uri()),
        }
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
        credentials: &Credentials,
    ) -> reqwest::blocking::RequestBuilder {
        if credentials.is_anonymous() {
            request
        } else {
            request.basic_auth(&credentials.username, Some(&credentials.password))
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
        uri: &str,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::AuthenticationFailure {
                uri: uri.to_string(),
            });
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "XNAT request failed".to_string());
        Err(SyncError::XnatStatus {
            status: status.as_u16(),
            message,
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, SyncError>
    where
        F: FnMut() -> Result<reqwest::blocking::RequestBuilder, SyncError>,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req()?.send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(status, attempt, "retrying XNAT request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(error = %err, attempt, "retrying XNAT request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::XnatHttp(err.to_string()));
                }
            }
        }
    }
}

impl XnatClient for XnatHttpClient {
    fn download(
        &self,
        address: &RemoteAddress,
        credentials: &Credentials,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        let url = self.url_for(address);
        debug!(%url, "downloading");
        let response =
            self.send_with_retries(|| Ok(self.authorize(self.client.get(&url), credentials)))?;
        let mut response = Self::handle_status(response, &url)?;

        let partial = destination.with_extension("part");
        let mut file =
            File::create(&partial).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                drop(file);
                if let Err(err) = fs::remove_file(&partial) {
                    warn!(error = %err, partial = %partial.display(), "failed to remove partial download");
                }
                debug!(%url, "download cancelled");
                return Ok(());
            }
            let read = response
                .read(&mut buffer)
                .map_err(|err| SyncError::XnatHttp(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        drop(file);
        fs::rename(&partial, destination).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn upload(
        &self,
        bundle: &Path,
        address: &RemoteAddress,
        credentials: &Credentials,
    ) -> Result<(), SyncError> {
        let file = File::open(bundle)
            .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", bundle.display())))?;
        let url = format!("{}?inbody=true&overwrite=true", self.url_for(address));
        debug!(%url, "uploading");
        let response = self.send_with_retries(|| {
            let mut body = file
                .try_clone()
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            body.seek(SeekFrom::Start(0))
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            Ok(self
                .authorize(self.client.put(&url), credentials)
                .header(reqwest::header::CONTENT_TYPE, "application/zip")
                .body(reqwest::blocking::Body::from(body)))
        })?;
        Self::handle_status(response, &url)?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_password() {
        let credentials = Credentials::new("alice", "hunter2");
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn missing_bundle_fails_before_any_request() {
        let temp = tempfile::tempdir().unwrap();
        let client = XnatHttpClient::new("http://127.0.0.1:9").unwrap();
        let address: RemoteAddress = "/data/projects/P/resources/Slicer/files/brain.zip"
            .parse()
            .unwrap();
        let result = client.upload(
            &temp.path().join("absent.zip"),
            &address,
            &Credentials::anonymous(),
        );
        assert!(matches!(result, Err(SyncError::Filesystem(message)) if message.contains("absent.zip")));
    }

    #[test]
    fn relative_addresses_use_base_url() {
        let client = XnatHttpClient::new("https://central.xnat.org/").unwrap();
        let address: RemoteAddress = "/data/projects/P/files?format=zip".parse().unwrap();
        assert_eq!(
            client.url_for(&address),
            "https://central.xnat.org/data/projects/P/files?format=zip"
        );
    }
}
