//! Shared types for file handlers
//!
//! This module contains the types every handler speaks: backend selectors,
//! per-backend settings, the backend-neutral entry and listing results, and
//! the error taxonomy all handlers report through.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Content type reported when neither the backend nor the extension says otherwise
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Content type reported for directories on path-based backends
pub const DIRECTORY_MIME_TYPE: &str = "inode/directory";

/// Supported file handler backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    /// File Transfer Protocol (plain or explicit TLS)
    Ftp,
    /// SSH File Transfer Protocol
    Sftp,
    /// Google Drive (OAuth2 refresh token)
    #[serde(alias = "gdrive")]
    GoogleDrive,
    /// Microsoft OneDrive - recognized, but no handler exists
    OneDrive,
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerType::Ftp => write!(f, "FTP"),
            HandlerType::Sftp => write!(f, "SFTP"),
            HandlerType::GoogleDrive => write!(f, "Google Drive"),
            HandlerType::OneDrive => write!(f, "OneDrive"),
        }
    }
}

impl FromStr for HandlerType {
    type Err = HandlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ftp" | "ftps" => Ok(HandlerType::Ftp),
            "sftp" => Ok(HandlerType::Sftp),
            "googledrive" | "google_drive" | "gdrive" => Ok(HandlerType::GoogleDrive),
            "onedrive" => Ok(HandlerType::OneDrive),
            other => Err(HandlerError::InvalidArgument(format!(
                "unknown handler type '{}'",
                other
            ))),
        }
    }
}

impl HandlerType {
    /// Default port for path-based backends; `None` for API backends
    pub fn default_port(&self) -> Option<u16> {
        match self {
            HandlerType::Ftp => Some(21),
            HandlerType::Sftp => Some(22),
            HandlerType::GoogleDrive | HandlerType::OneDrive => None,
        }
    }
}

/// Boxed error kept as the cause of a connection failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handler error type
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Handler settings have not been loaded")]
    NotConfigured,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Connection failed: {context}")]
    ConnectionFailed {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("Timeout")]
    Timeout,

    #[error("Destination already exists: {0}")]
    DuplicateDestination(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Wrap a transport failure, keeping it as the error source
    pub fn connection(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        HandlerError::ConnectionFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HandlerError::NotFound(_))
    }
}

/// Reject blank required arguments before any network call
pub(crate) fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, HandlerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HandlerError::InvalidArgument(format!("{} must not be empty", field)));
    }
    Ok(trimmed)
}

/// Best-effort content type from a file name's extension
pub fn mime_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_string()
}

/// Whether the last path segment carries a file extension
pub(crate) fn has_extension(path: &str) -> bool {
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    match last.rfind('.') {
        Some(pos) => pos > 0 && pos + 1 < last.len(),
        None => false,
    }
}

/// Remote file/directory entry
///
/// Backend-neutral description of one remote object. Built fresh for every
/// lookup or listing; it carries no identity beyond its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Backend identifier (Drive file id, SFTP full path, empty for FTP)
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub created_time: Option<DateTime<Utc>>,
    /// Byte length, 0 when unknown
    pub size: u64,
    /// Backend-specific raw metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional: Option<serde_json::Value>,
}

impl FileInfo {
    /// Entry with only a name; the content type is guessed from the extension
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: String::new(),
            mime_type: mime_for(&name),
            name,
            created_time: None,
            size: 0,
            additional: None,
        }
    }
}

/// Opaque continuation token handed back by paginated listings
///
/// Each handler understands only its own shape and rejects the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageToken {
    /// 1-based page number (SFTP)
    Page(u32),
    /// Server-issued cursor (Google Drive)
    Cursor(String),
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageToken::Page(page) => write!(f, "{}", page),
            PageToken::Cursor(cursor) => write!(f, "{}", cursor),
        }
    }
}

/// One page of a directory listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub entries: Vec<FileInfo>,
    /// `None` once the listing is exhausted
    pub next_page_token: Option<PageToken>,
}

impl ListResult {
    pub fn is_last_page(&self) -> bool {
        self.next_page_token.is_none()
    }
}

/// Outcome of a preflight reachability check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connection_exists: bool,
    pub folder_exists: bool,
}

impl ConnectionStatus {
    pub fn reachable() -> Self {
        Self { connection_exists: true, folder_exists: true }
    }

    pub fn missing_folder() -> Self {
        Self { connection_exists: true, folder_exists: false }
    }

    pub fn unreachable() -> Self {
        Self { connection_exists: false, folder_exists: false }
    }
}

/// TLS mode for FTP connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FtpTlsMode {
    /// Plain FTP (no encryption)
    #[default]
    None,
    /// Explicit TLS (AUTH TLS on the control port)
    Explicit,
}

/// FTP-specific settings
#[derive(Debug, Clone)]
pub struct FtpSettings {
    /// Server URL, optionally with scheme and base directory (ftp://host/base)
    pub url: String,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub port: u16,
    pub tls_mode: FtpTlsMode,
    /// Whether to verify TLS certificates (ignored for plain FTP)
    pub verify_cert: bool,
}

impl FtpSettings {
    /// Settings for `url`; an `ftps://` scheme selects explicit TLS
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let tls_mode = if url.trim().to_lowercase().starts_with("ftps://") {
            FtpTlsMode::Explicit
        } else {
            FtpTlsMode::None
        };
        Self {
            url,
            user: None,
            password: None,
            port: 21,
            tls_mode,
            verify_cert: true,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// User and password, only when both are present and non-blank
    pub fn credentials(&self) -> Option<(&str, &SecretString)> {
        credentials(self.user.as_deref(), self.password.as_ref())
    }
}

/// SFTP-specific settings
#[derive(Debug, Clone)]
pub struct SftpSettings {
    /// Host name; an `sftp://` prefix is accepted and stripped
    pub url: String,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub port: u16,
    /// Path to private key file (e.g., ~/.ssh/id_ed25519)
    pub private_key_path: Option<String>,
    /// Passphrase for encrypted private key
    pub key_passphrase: Option<SecretString>,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
    /// Host key store; `~/.ssh/known_hosts` when unset
    pub known_hosts_path: Option<PathBuf>,
}

impl SftpSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            port: 22,
            private_key_path: None,
            key_passphrase: None,
            timeout_secs: 30,
            known_hosts_path: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_private_key(mut self, path: impl Into<String>, passphrase: Option<String>) -> Self {
        self.private_key_path = Some(path.into());
        self.key_passphrase = passphrase.map(SecretString::from);
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }
}

fn credentials<'a>(
    user: Option<&'a str>,
    password: Option<&'a SecretString>,
) -> Option<(&'a str, &'a SecretString)> {
    use secrecy::ExposeSecret;
    match (user, password) {
        (Some(user), Some(password))
            if !user.trim().is_empty() && !password.expose_secret().trim().is_empty() =>
        {
            Some((user, password))
        }
        _ => None,
    }
}

/// Google Drive endpoints; production Google URLs unless overridden
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEndpoints {
    pub api_base: String,
    pub upload_base: String,
    pub auth_url: String,
    pub token_url: String,
}

impl Default for DriveEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

impl DriveEndpoints {
    /// Every endpoint rooted at one base URL (gateways, local test servers)
    pub fn rooted_at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            api_base: format!("{}/drive/v3", base),
            upload_base: format!("{}/upload/drive/v3", base),
            auth_url: format!("{}/o/oauth2/auth", base),
            token_url: format!("{}/token", base),
        }
    }
}

/// OAuth2 client secrets of the application registered with Google
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleClientSecrets {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Drive settings
#[derive(Debug, Clone)]
pub struct GoogleDriveSettings {
    pub client_id: String,
    pub client_secret: SecretString,
    /// User refresh token exchanged for an access token on load
    pub refresh_token: SecretString,
    pub endpoints: DriveEndpoints,
}

impl GoogleDriveSettings {
    pub fn new(secrets: &GoogleClientSecrets, refresh_token: impl Into<String>) -> Self {
        Self {
            client_id: secrets.client_id.clone(),
            client_secret: SecretString::from(secrets.client_secret.clone()),
            refresh_token: SecretString::from(refresh_token.into()),
            endpoints: DriveEndpoints::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: DriveEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

/// Settings payload for exactly one handler type
///
/// The variant must match the handler it is loaded into.
#[derive(Debug, Clone)]
pub enum HandlerSettings {
    Ftp(FtpSettings),
    Sftp(SftpSettings),
    GoogleDrive(GoogleDriveSettings),
}

impl HandlerSettings {
    pub fn handler_type(&self) -> HandlerType {
        match self {
            HandlerSettings::Ftp(_) => HandlerType::Ftp,
            HandlerSettings::Sftp(_) => HandlerType::Sftp,
            HandlerSettings::GoogleDrive(_) => HandlerType::GoogleDrive,
        }
    }

    pub(crate) fn mismatch(&self, expected: HandlerType) -> HandlerError {
        HandlerError::InvalidArgument(format!(
            "{} settings cannot be loaded into the {} handler",
            self.handler_type(),
            expected
        ))
    }
}

/// Generic connection record consumed by the handler factory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHandlerInfo {
    #[serde(rename = "type")]
    pub handler_type: HandlerType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Uses the backend default when absent or 0
    #[serde(default)]
    pub port: Option<u16>,
    /// OAuth refresh token (Google Drive)
    #[serde(default)]
    pub connection_token: Option<String>,
}

impl FileHandlerInfo {
    /// Effective port: the configured one unless absent or 0
    pub fn effective_port(&self) -> Option<u16> {
        match self.port {
            Some(port) if port != 0 => Some(port),
            _ => self.handler_type.default_port(),
        }
    }
}
