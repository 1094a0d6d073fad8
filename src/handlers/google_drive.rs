//! Google Drive File Handler
//!
//! Implements FileHandler for Google Drive using the Drive API v3.
//! Files and folders are addressed by Drive id. Loading settings exchanges
//! the refresh token for an access token and keeps one HTTP client for the
//! lifetime of the handler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::oauth2::refresh_access_token;
use super::types::{has_extension, mime_for, require};
use super::{
    ConnectionStatus, DriveEndpoints, FileHandler, FileInfo, HandlerError, HandlerSettings,
    HandlerType, ListResult, PageToken,
};

/// MIME type Drive uses for folders
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Largest page Drive accepts for files.list
const MAX_PAGE_SIZE: u32 = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const FILE_FIELDS: &str = "id,name,mimeType,createdTime,size,parents";
const BOUNDARY: &str = "filehandlers_boundary";

/// Google Drive file metadata from API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    parents: Vec<String>,
}

impl From<DriveFile> for FileInfo {
    fn from(file: DriveFile) -> Self {
        let mime_type = if file.mime_type.is_empty() {
            mime_for(&file.name)
        } else {
            file.mime_type
        };
        FileInfo {
            id: file.id,
            size: file.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            created_time: file.created_time,
            additional: if file.parents.is_empty() {
                None
            } else {
                Some(serde_json::json!({ "parents": file.parents }))
            },
            name: file.name,
            mime_type,
        }
    }
}

/// Google Drive file list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveParents {
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorBody {
    error: DriveErrorDetail,
}

#[derive(Debug, Deserialize)]
struct DriveErrorDetail {
    #[serde(default)]
    message: String,
}

/// Quote a value for a Drive `q` expression
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn map_transport(context: &str, err: reqwest::Error) -> HandlerError {
    if err.is_timeout() {
        HandlerError::Timeout
    } else {
        HandlerError::connection(context.to_string(), err)
    }
}

/// Authenticated Drive session created while loading settings
#[derive(Debug)]
struct DriveSession {
    client: reqwest::Client,
    access_token: SecretString,
    endpoints: DriveEndpoints,
}

impl DriveSession {
    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(self.access_token.expose_secret())
    }

    fn patch(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .patch(url)
            .bearer_auth(self.access_token.expose_secret())
    }

    fn delete(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(url)
            .bearer_auth(self.access_token.expose_secret())
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.endpoints.api_base, urlencoding::encode(id))
    }

    /// Send a request and map transport failures and non-2xx statuses
    async fn send(
        &self,
        context: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HandlerError> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport(context, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<DriveErrorBody>(&text)
            .map(|body| body.error.message)
            .unwrap_or(text);
        Err(match status.as_u16() {
            401 => HandlerError::Unauthorized(format!("{}: {}", context, message)),
            404 => HandlerError::NotFound(format!("{}: {}", context, message)),
            code => HandlerError::Api { status: code, message },
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        response: reqwest::Response,
    ) -> Result<T, HandlerError> {
        response
            .json()
            .await
            .map_err(|e| map_transport(&format!("{} response", context), e))
    }
}

/// Google Drive File Handler
#[derive(Debug, Default)]
pub struct GoogleDriveHandler {
    session: Option<DriveSession>,
}

impl GoogleDriveHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Result<&DriveSession, HandlerError> {
        self.session.as_ref().ok_or(HandlerError::NotConfigured)
    }

    fn multipart_body(metadata: &serde_json::Value, content_type: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(content.len() + 512);

        // Metadata part
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(b"\r\n");

        // File content part
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--", BOUNDARY).as_bytes());
        body
    }
}

#[async_trait]
impl FileHandler for GoogleDriveHandler {
    fn handler_type(&self) -> HandlerType {
        HandlerType::GoogleDrive
    }

    fn is_configured(&self) -> bool {
        self.session.is_some()
    }

    async fn load_settings(&mut self, settings: HandlerSettings) -> Result<(), HandlerError> {
        if self.session.is_some() {
            return Err(HandlerError::InvalidArgument(
                "Google Drive settings are already loaded".to_string(),
            ));
        }
        let settings = match settings {
            HandlerSettings::GoogleDrive(settings) => settings,
            other => return Err(other.mismatch(HandlerType::GoogleDrive)),
        };
        require(&settings.client_id, "client id")?;
        require(settings.client_secret.expose_secret(), "client secret")?;
        require(settings.refresh_token.expose_secret(), "refresh token")?;

        let token = refresh_access_token(&settings).await?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HandlerError::connection("build HTTP client", e))?;

        if let Some(expires_in) = token.expires_in {
            debug!("Drive access token valid for {}s", expires_in.as_secs());
        }
        info!("Google Drive handler configured");
        self.session = Some(DriveSession {
            client,
            access_token: token.secret,
            endpoints: settings.endpoints,
        });
        Ok(())
    }

    async fn list(
        &self,
        directory: &str,
        page_size: u32,
        page_token: Option<&PageToken>,
    ) -> Result<ListResult, HandlerError> {
        let session = self.session()?;
        if page_size == 0 {
            return Err(HandlerError::InvalidArgument(
                "page size must be at least 1".to_string(),
            ));
        }
        let cursor = match page_token {
            None => None,
            Some(PageToken::Cursor(cursor)) => Some(cursor.as_str()),
            Some(PageToken::Page(page)) => {
                return Err(HandlerError::InvalidArgument(format!(
                    "Google Drive listings take a page cursor, not page number {}",
                    page
                )))
            }
        };

        let folder = directory.trim();
        let query = if folder.is_empty() {
            "trashed = false".to_string()
        } else {
            format!("'{}' in parents and trashed = false", escape_query(folder))
        };
        let mut url = format!(
            "{}/files?q={}&fields={}&pageSize={}",
            session.endpoints.api_base,
            urlencoding::encode(&query),
            urlencoding::encode(&format!("nextPageToken,files({})", FILE_FIELDS)),
            page_size.min(MAX_PAGE_SIZE)
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(cursor)));
        }

        let response = session.send("list files", session.get(&url)).await?;
        let list: DriveFileList = session.json("list files", response).await?;

        let entries: Vec<FileInfo> = list.files.into_iter().map(FileInfo::from).collect();
        info!("Listed {} Drive entries in '{}'", entries.len(), folder);
        Ok(ListResult {
            entries,
            next_page_token: list
                .next_page_token
                .filter(|t| !t.is_empty())
                .map(PageToken::Cursor),
        })
    }

    async fn file_lookup(
        &self,
        id: Option<&str>,
        name: Option<&str>,
        folder: Option<&str>,
    ) -> Result<FileInfo, HandlerError> {
        let session = self.session()?;
        let id = id.map(str::trim).filter(|s| !s.is_empty());
        let name = name.map(str::trim).filter(|s| !s.is_empty());

        if let Some(id) = id {
            let url = format!("{}?fields={}", session.file_url(id), FILE_FIELDS);
            let response = session.send("lookup file", session.get(&url)).await?;
            let file: DriveFile = session.json("lookup file", response).await?;
            return Ok(file.into());
        }

        let name = name.ok_or_else(|| {
            HandlerError::InvalidArgument("file id or partial file name must be given".to_string())
        })?;
        let mut query = format!("name contains '{}' and trashed = false", escape_query(name));
        if let Some(folder) = folder.map(str::trim).filter(|s| !s.is_empty()) {
            query.push_str(&format!(" and '{}' in parents", escape_query(folder)));
        }
        let url = format!(
            "{}/files?q={}&fields={}&pageSize=1",
            session.endpoints.api_base,
            urlencoding::encode(&query),
            urlencoding::encode(&format!("files({})", FILE_FIELDS)),
        );

        let response = session.send("lookup file", session.get(&url)).await?;
        let list: DriveFileList = session.json("lookup file", response).await?;
        list.files
            .into_iter()
            .next()
            .map(FileInfo::from)
            .ok_or_else(|| HandlerError::NotFound(format!("no file matching '{}'", name)))
    }

    async fn download_file(
        &self,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        location: &str,
    ) -> Result<(), HandlerError> {
        let session = self.session()?;
        let id = require(location, "file id")?;
        let url = format!("{}?alt=media", session.file_url(id));

        let response = session.send("download file", session.get(&url)).await?;
        let mut stream = response.bytes_stream();
        let mut transferred: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_transport("download file", e))?;
            sink.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
        }
        sink.flush().await?;
        if transferred == 0 {
            return Err(HandlerError::NotFound(format!("Drive file {} has no content", id)));
        }

        info!("Downloaded Drive file {} ({} bytes)", id, transferred);
        Ok(())
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        file_name: &str,
        destination: &str,
    ) -> Result<(), HandlerError> {
        let session = self.session()?;
        let file_name = require(file_name, "file name")?;
        if !has_extension(file_name) {
            return Err(HandlerError::InvalidArgument(format!(
                "file name '{}' is missing the file extension",
                file_name
            )));
        }
        let parent = require(destination, "parent folder id")?;

        let mut content = Vec::new();
        source.read_to_end(&mut content).await?;
        if content.is_empty() {
            return Err(HandlerError::InvalidArgument(
                "cannot upload an empty stream".to_string(),
            ));
        }

        let metadata = serde_json::json!({
            "name": file_name,
            "parents": [parent]
        });
        let body = Self::multipart_body(&metadata, &mime_for(file_name), &content);
        let url = format!("{}/files?uploadType=multipart&fields=id", session.endpoints.upload_base);

        let request = session
            .post(&url)
            .header(CONTENT_TYPE, format!("multipart/related; boundary={}", BOUNDARY))
            .body(body);
        session.send("upload file", request).await?;

        info!("Uploaded {} ({} bytes) to Drive folder {}", file_name, content.len(), parent);
        Ok(())
    }

    async fn move_file(&self, source: &str, destination: &str) -> Result<(), HandlerError> {
        let session = self.session()?;
        let file_id = require(source, "file id")?;
        let folder_id = require(destination, "destination folder id")?;

        let url = format!("{}?fields=parents", session.file_url(file_id));
        let response = session.send("read parents", session.get(&url)).await?;
        let current: DriveParents = session.json("read parents", response).await?;

        let url = format!(
            "{}?addParents={}&removeParents={}&fields=id,parents",
            session.file_url(file_id),
            urlencoding::encode(folder_id),
            urlencoding::encode(&current.parents.join(","))
        );
        let request = session
            .patch(&url)
            .header(CONTENT_TYPE, "application/json")
            .body("{}");
        session.send("move file", request).await?;

        info!("Moved Drive file {} into {}", file_id, folder_id);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), HandlerError> {
        let session = self.session()?;
        let name = require(path, "directory name")?;

        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE
        });
        let url = format!("{}/files", session.endpoints.api_base);
        let request = session
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(metadata.to_string());
        session.send("create folder", request).await?;

        info!("Created Drive folder: {}", name);
        Ok(())
    }

    async fn path_exists(&self, _path: &str) -> Result<bool, HandlerError> {
        self.session()?;
        Err(HandlerError::NotSupported(
            "Google Drive addresses files by id, not path".to_string(),
        ))
    }

    async fn can_connect(&self, path: &str) -> Result<ConnectionStatus, HandlerError> {
        let session = self.session()?;
        let folder = match path.trim() {
            "" | "/" => "root",
            folder => folder,
        };
        let url = format!("{}?fields=id", session.file_url(folder));

        match session.send("check folder", session.get(&url)).await {
            Ok(_) => Ok(ConnectionStatus::reachable()),
            Err(HandlerError::NotFound(_)) => Ok(ConnectionStatus::missing_folder()),
            Err(e) => {
                warn!("Google Drive unreachable: {}", e);
                Ok(ConnectionStatus::unreachable())
            }
        }
    }

    async fn delete_file(&self, identifier: &str) -> Result<(), HandlerError> {
        let session = self.session()?;
        let id = require(identifier, "file id")?;

        session
            .send("delete file", session.delete(&session.file_url(id)))
            .await?;

        info!("Deleted Drive file {}", id);
        Ok(())
    }
}
