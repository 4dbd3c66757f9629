//! HTTP implementation of the backup store against a drive-style blob API.
//!
//! The remote is one named folder ("container") holding one named file.
//! Lookups are by name, not fixed id, so handles are resolved once and cached
//! for the session. A stale cached handle (404-class response) invalidates
//! the cache and the locate+upload sequence is retried exactly once.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::models::BackupDocument;
use crate::session::SessionProvider;
use crate::util::{compact_text, is_http_url, normalize_text_option};

use super::{
    BackupStore, ContainerHandle, DocumentHandle, DocumentMetadata, RemoteError, RemoteResult,
};

const DEFAULT_CONTAINER_NAME: &str = "CoachbookBackups";
const DEFAULT_DOCUMENT_NAME: &str = "coachbook-backup.json";

/// Drive-style HTTP backup client.
pub struct DriveBackupClient {
    base_url: String,
    container_name: String,
    document_name: String,
    client: Client,
    session: Arc<dyn SessionProvider>,
    cached_container: Mutex<Option<ContainerHandle>>,
    cached_document: Mutex<Option<DocumentHandle>>,
}

impl DriveBackupClient {
    /// Build a client against the given API base URL.
    pub fn new(base_url: impl Into<String>, session: Arc<dyn SessionProvider>) -> RemoteResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            document_name: DEFAULT_DOCUMENT_NAME.to_string(),
            client: Client::builder().build()?,
            session,
            cached_container: Mutex::new(None),
            cached_document: Mutex::new(None),
        })
    }

    /// Override the container (folder) name.
    #[must_use]
    pub fn with_container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = name.into();
        self
    }

    /// Override the backup document file name.
    #[must_use]
    pub fn with_document_name(mut self, name: impl Into<String>) -> Self {
        self.document_name = name.into();
        self
    }

    fn bearer_token(&self) -> RemoteResult<String> {
        self.session.token().ok_or(RemoteError::NotAuthenticated)
    }

    fn authed(&self, request: RequestBuilder) -> RemoteResult<RequestBuilder> {
        Ok(request
            .bearer_auth(self.bearer_token()?)
            .header("Accept", "application/json"))
    }

    fn cached_container(&self) -> Option<ContainerHandle> {
        self.cached_container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cached_document(&self) -> Option<DocumentHandle> {
        self.cached_document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_container(&self, handle: Option<ContainerHandle>) {
        *self
            .cached_container
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle;
    }

    fn store_document(&self, handle: Option<DocumentHandle>) {
        *self
            .cached_document
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle;
    }

    /// Drop both cached handles; the next call re-resolves by name.
    fn invalidate_handles(&self) {
        self.store_container(None);
        self.store_document(None);
    }

    async fn find_container_by_name(&self) -> RemoteResult<Option<ContainerHandle>> {
        let request = self.authed(
            self.client
                .get(format!("{}/v1/containers", self.base_url))
                .query(&[("name", self.container_name.as_str())]),
        )?;
        let listing: ListResponse = expect_json(request.send().await?).await?;
        Ok(listing
            .value
            .into_iter()
            .find(|item| item.name.as_deref() == Some(self.container_name.as_str()))
            .map(|item| ContainerHandle(item.id)))
    }

    async fn create_container(&self) -> RemoteResult<ContainerHandle> {
        let payload = serde_json::json!({ "name": self.container_name });
        let request = self.authed(
            self.client
                .post(format!("{}/v1/containers", self.base_url))
                .json(&payload),
        )?;
        let created: ItemPayload = expect_json(request.send().await?).await?;
        Ok(ContainerHandle(created.id))
    }

    async fn find_document_by_name(
        &self,
        container: &ContainerHandle,
    ) -> RemoteResult<Option<ItemPayload>> {
        let request = self.authed(
            self.client
                .get(format!(
                    "{}/v1/containers/{}/documents",
                    self.base_url, container.0
                ))
                .query(&[("name", self.document_name.as_str())]),
        )?;
        let listing: ListResponse = expect_json(request.send().await?).await?;
        Ok(listing
            .value
            .into_iter()
            .find(|item| item.name.as_deref() == Some(self.document_name.as_str())))
    }

    /// Create the document record, then write its body. The two-step shape
    /// matches the remote's create-metadata-then-content contract.
    async fn create_and_write(
        &self,
        container: &ContainerHandle,
        doc: &BackupDocument,
    ) -> RemoteResult<DateTime<Utc>> {
        let payload = serde_json::json!({ "name": self.document_name });
        let request = self.authed(
            self.client
                .post(format!(
                    "{}/v1/containers/{}/documents",
                    self.base_url, container.0
                ))
                .json(&payload),
        )?;
        let created: ItemPayload = expect_json(request.send().await?).await?;
        let handle = DocumentHandle(created.id);
        let modified = self.write_content(container, &handle, doc).await?;
        self.store_document(Some(handle));
        Ok(modified)
    }

    async fn write_content(
        &self,
        container: &ContainerHandle,
        document: &DocumentHandle,
        doc: &BackupDocument,
    ) -> RemoteResult<DateTime<Utc>> {
        let request = self.authed(
            self.client
                .put(format!(
                    "{}/v1/containers/{}/documents/{}/content",
                    self.base_url, container.0, document.0
                ))
                .json(doc),
        )?;
        let written: ItemPayload = expect_json(request.send().await?).await?;
        parse_modified(written.modified_at.as_deref())
    }

    async fn upload_once(
        &self,
        container: &ContainerHandle,
        doc: &BackupDocument,
    ) -> RemoteResult<DateTime<Utc>> {
        match self.locate_document(container).await? {
            Some(handle) => {
                let modified = self.write_content(container, &handle, doc).await?;
                self.store_document(Some(handle));
                Ok(modified)
            }
            None => self.create_and_write(container, doc).await,
        }
    }
}

#[async_trait]
impl BackupStore for DriveBackupClient {
    async fn locate_or_create_container(&self) -> RemoteResult<ContainerHandle> {
        if let Some(handle) = self.cached_container() {
            return Ok(handle);
        }

        let handle = match self.find_container_by_name().await? {
            Some(handle) => handle,
            None => self.create_container().await?,
        };
        self.store_container(Some(handle.clone()));
        Ok(handle)
    }

    async fn locate_document(
        &self,
        container: &ContainerHandle,
    ) -> RemoteResult<Option<DocumentHandle>> {
        if let Some(handle) = self.cached_document() {
            return Ok(Some(handle));
        }

        let found = self
            .find_document_by_name(container)
            .await?
            .map(|item| DocumentHandle(item.id));
        if let Some(handle) = &found {
            self.store_document(Some(handle.clone()));
        }
        Ok(found)
    }

    async fn get_metadata(
        &self,
        container: &ContainerHandle,
    ) -> RemoteResult<Option<DocumentMetadata>> {
        // Listing by name returns id + modifiedAt and never the body.
        let Some(item) = self.find_document_by_name(container).await? else {
            return Ok(None);
        };
        let modified_at = parse_modified(item.modified_at.as_deref())?;
        Ok(Some(DocumentMetadata {
            id: item.id,
            modified_at,
        }))
    }

    async fn download(&self, container: &ContainerHandle) -> RemoteResult<Option<BackupDocument>> {
        let Some(handle) = self.locate_document(container).await? else {
            return Ok(None);
        };

        let request = self.authed(self.client.get(format!(
            "{}/v1/containers/{}/documents/{}/content",
            self.base_url, container.0, handle.0
        )))?;
        match expect_json::<BackupDocument>(request.send().await?).await {
            Ok(doc) => Ok(Some(doc)),
            Err(RemoteError::StaleHandle(_)) => {
                self.invalidate_handles();
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn upload(
        &self,
        container: &ContainerHandle,
        doc: &BackupDocument,
    ) -> RemoteResult<DateTime<Utc>> {
        match self.upload_once(container, doc).await {
            Ok(modified) => Ok(modified),
            Err(RemoteError::StaleHandle(path)) => {
                // Stale cached handle: re-resolve everything by name and try
                // the full sequence once more before propagating.
                tracing::debug!(%path, "stale remote handle, retrying upload once");
                self.invalidate_handles();
                let container = self.locate_or_create_container().await?;
                self.upload_once(&container, doc).await
            }
            Err(error) => Err(error),
        }
    }

    async fn soft_delete(&self, container: &ContainerHandle) -> RemoteResult<()> {
        let Some(handle) = self.locate_document(container).await? else {
            return Ok(());
        };

        let tombstone = tombstone_name(&self.document_name, Utc::now());
        let payload = serde_json::json!({ "name": tombstone });
        let request = self.authed(
            self.client
                .patch(format!(
                    "{}/v1/containers/{}/documents/{}",
                    self.base_url, container.0, handle.0
                ))
                .json(&payload),
        )?;
        expect_json::<ItemPayload>(request.send().await?).await?;
        self.store_document(None);
        Ok(())
    }
}

impl fmt::Debug for DriveBackupClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DriveBackupClient")
            .field("base_url", &self.base_url)
            .field("container_name", &self.container_name)
            .field("document_name", &self.document_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    value: Vec<ItemPayload>,
}

#[derive(Debug, Deserialize)]
struct ItemPayload {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "modifiedAt", default)]
    modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

async fn expect_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> RemoteResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &path, &body))
}

fn classify_failure(status: StatusCode, path: &str, body: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::AuthExpired,
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::StaleHandle(path.to_string()),
        _ => RemoteError::Unavailable(parse_api_error(status, body)),
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn parse_modified(raw: Option<&str>) -> RemoteResult<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| {
        RemoteError::InvalidPayload("response did not include modifiedAt".to_string())
    })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|error| RemoteError::InvalidPayload(format!("bad modifiedAt '{raw}': {error}")))
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let base = normalize_text_option(Some(raw)).ok_or_else(|| {
        RemoteError::InvalidConfiguration("base URL must not be empty".to_string())
    })?;
    if is_http_url(&base) {
        Ok(base.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidConfiguration(
            "base URL must include http:// or https://".to_string(),
        ))
    }
}

/// Tombstone name for a soft-deleted document, e.g.
/// `coachbook-backup.json` -> `coachbook-backup.deleted-20260827T100000Z.json`.
fn tombstone_name(document_name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%dT%H%M%SZ");
    match document_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.deleted-{stamp}.{ext}"),
        None => format!("{document_name}.deleted-{stamp}"),
    }
}
