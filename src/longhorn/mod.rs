//! Longhorn v1 REST implementation of [`VolumeBackend`].
//!
//! Longhorn exposes collections as `{"data": [...]}` and mutations on an
//! existing object as `POST /<collection>/<id>?action=<name>`.

mod types;

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::backend::{
    Backup, BackupVolume, BackendError, BackendFuture, CreateVolumeRequest, VolumeBackend,
    VolumeRecord,
};
use types::{
    ApiErrorBody, BackupGetInput, Collection, CreateVolumeInput, PvCreateInput, PvcCreateInput,
    RecurringJobAddInput,
};

/// Default Longhorn API endpoint inside the cluster.
pub const DEFAULT_LONGHORN_URL: &str = "http://longhorn-frontend.longhorn-system/v1";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`LonghornBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LonghornSettings {
    /// Base URL of the v1 API, without a trailing slash.
    pub url: String,
    /// Timeout applied to each HTTP request.
    pub request_timeout: Duration,
    /// Skip TLS certificate verification.
    pub accept_invalid_certs: bool,
}

impl LonghornSettings {
    /// Creates settings for `url` with the default timeout and TLS
    /// verification enabled.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().trim_end_matches('/').to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

/// Errors raised while constructing the HTTP client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LonghornSetupError {
    /// Raised when the URL is empty.
    #[error("Longhorn URL must not be empty")]
    MissingUrl,
    /// Raised when the HTTP client cannot be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Volume backend speaking to the Longhorn manager REST API.
#[derive(Clone, Debug)]
pub struct LonghornBackend {
    client: Client,
    base_url: String,
}

impl LonghornBackend {
    /// Constructs a backend from settings.
    ///
    /// # Errors
    ///
    /// Returns [`LonghornSetupError`] when the URL is empty or the client
    /// cannot be built.
    pub fn new(settings: &LonghornSettings) -> Result<Self, LonghornSetupError> {
        if settings.url.is_empty() {
            return Err(LonghornSetupError::MissingUrl);
        }
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|err| LonghornSetupError::Client(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Sends a request and returns the status and body. Transport failures
    /// are mapped to [`BackendError::Transport`].
    async fn send<B: Serialize + Sync>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        action: Option<&str>,
        body: Option<&B>,
    ) -> Result<(StatusCode, Vec<u8>), BackendError> {
        let transport = |err: reqwest::Error| BackendError::Transport {
            operation: operation.to_owned(),
            message: err.to_string(),
        };

        let mut request = self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(name) = action {
            request = request.query(&[("action", name)]);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        debug!(operation, path, action, "sending backend request");
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;
        Ok((status, bytes.to_vec()))
    }

    fn decode<T: DeserializeOwned>(operation: &str, body: &[u8]) -> Result<T, BackendError> {
        serde_json::from_slice(body).map_err(|err| BackendError::Decode {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<Option<T>, BackendError> {
        let (status, body) = self
            .send::<()>(operation, Method::GET, path, None, None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_failure(operation, status, &body));
        }
        Self::decode(operation, &body).map(Some)
    }

    async fn list<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<Vec<T>, BackendError> {
        let collection: Option<Collection<T>> = self.get_json(operation, path).await?;
        Ok(collection.map(|found| found.data).unwrap_or_default())
    }

    async fn post<B: Serialize + Sync>(
        &self,
        operation: &str,
        path: &str,
        action: Option<&str>,
        body: &B,
    ) -> Result<Vec<u8>, BackendError> {
        let (status, response) = self
            .send(operation, Method::POST, path, action, Some(body))
            .await?;
        if status.is_success() {
            return Ok(response);
        }
        Err(classify_failure(operation, status, &response))
    }
}

/// Maps a non-success response to a [`BackendError`].
///
/// Only a `409 Conflict`, or a message that explicitly reports an existing
/// object, is classified as [`BackendError::AlreadyExists`].
fn classify_failure(operation: &str, status: StatusCode, body: &[u8]) -> BackendError {
    let message = serde_json::from_slice::<ApiErrorBody>(body)
        .ok()
        .and_then(ApiErrorBody::into_message)
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_owned());

    if status == StatusCode::CONFLICT || message.to_ascii_lowercase().contains("already exists") {
        return BackendError::AlreadyExists {
            operation: operation.to_owned(),
            message,
        };
    }

    BackendError::Api {
        operation: operation.to_owned(),
        status: status.as_u16(),
        message,
    }
}

impl VolumeBackend for LonghornBackend {
    fn list_backup_volumes(&self) -> BackendFuture<'_, Vec<BackupVolume>, BackendError> {
        Box::pin(async move { self.list("list backup volumes", "backupvolumes").await })
    }

    fn last_backup<'a>(
        &'a self,
        volume: &'a str,
    ) -> BackendFuture<'a, Option<Backup>, BackendError> {
        Box::pin(async move {
            let path = format!("backupvolumes/{volume}");
            let backup_volume: Option<BackupVolume> =
                self.get_json("get backup volume", &path).await?;
            let Some(summary) = backup_volume else {
                return Ok(None);
            };
            if summary.last_backup_name.is_empty() {
                return Ok(None);
            }

            let input = BackupGetInput {
                name: summary.last_backup_name,
            };
            let body = self
                .post("get backup", &path, Some("backupGet"), &input)
                .await?;
            Self::decode("get backup", &body).map(Some)
        })
    }

    fn list_volumes(&self) -> BackendFuture<'_, Vec<VolumeRecord>, BackendError> {
        Box::pin(async move { self.list("list volumes", "volumes").await })
    }

    fn get_volume<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<VolumeRecord>, BackendError> {
        Box::pin(async move {
            self.get_json("get volume", &format!("volumes/{name}"))
                .await
        })
    }

    fn create_volume<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> BackendFuture<'a, VolumeRecord, BackendError> {
        Box::pin(async move {
            let input = CreateVolumeInput {
                name: &request.name,
                size: &request.size,
                from_backup: request.from_backup.as_deref(),
            };
            let body = self.post("create volume", "volumes", None, &input).await?;
            Self::decode("create volume", &body)
        })
    }

    fn create_pv<'a>(
        &'a self,
        volume: &'a str,
        pv_name: &'a str,
        fs_type: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let input = PvCreateInput { pv_name, fs_type };
            self.post(
                "create persistent volume",
                &format!("volumes/{volume}"),
                Some("pvCreate"),
                &input,
            )
            .await
            .map(|_| ())
        })
    }

    fn create_pvc<'a>(
        &'a self,
        volume: &'a str,
        namespace: &'a str,
        pvc_name: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let input = PvcCreateInput {
                namespace,
                pvc_name,
            };
            self.post(
                "create persistent volume claim",
                &format!("volumes/{volume}"),
                Some("pvcCreate"),
                &input,
            )
            .await
            .map(|_| ())
        })
    }

    fn add_recurring_job_group<'a>(
        &'a self,
        volume: &'a str,
        group: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let input = RecurringJobAddInput {
                name: group,
                is_group: true,
            };
            self.post(
                "add recurring job group",
                &format!("volumes/{volume}"),
                Some("recurringJobAdd"),
                &input,
            )
            .await
            .map(|_| ())
        })
    }
}
