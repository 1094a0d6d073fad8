//! File Handlers Module
//!
//! This module provides one async contract for remote file storage.
//! All backends implement the `FileHandler` trait, so callers can list,
//! transfer and organize files on FTP, SFTP or Google Drive the same way.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              FileHandler Trait              │
//! │  list, lookup, download, upload, move, ...  │
//! └─────────────────────────────────────────────┘
//!                      │
//!          ┌───────────┼────────────┐
//!          ▼           ▼            ▼
//!      ┌──────┐    ┌──────┐    ┌────────┐
//!      │ FTP  │    │ SFTP │    │ GDrive │
//!      └──────┘    └──────┘    └────────┘
//!                                   │
//!                              ┌────────┐
//!                              │ OAuth2 │
//!                              └────────┘
//! ```
//!
//! FTP and SFTP open a fresh connection for every operation and close it
//! before returning. Google Drive keeps one HTTP session created while the
//! settings are loaded.

pub mod types;
pub mod ftp;
pub mod sftp;
pub mod oauth2;
pub mod google_drive;

#[cfg(test)]
pub(crate) mod test_support;

pub use types::*;
pub use ftp::FtpHandler;
pub use sftp::SftpHandler;
pub use google_drive::GoogleDriveHandler;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// Page size used by callers that have no preference
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Unified file handler trait
///
/// Settings are loaded exactly once; every other operation fails with
/// `HandlerError::NotConfigured` until then. Streams passed in are owned by
/// the caller and are never closed by a handler.
#[async_trait]
pub trait FileHandler: Send + Sync {
    /// Get the backend type identifier
    fn handler_type(&self) -> HandlerType;

    /// Whether settings have been loaded
    fn is_configured(&self) -> bool;

    /// Load backend settings (one-shot)
    async fn load_settings(&mut self, settings: HandlerSettings) -> Result<(), HandlerError>;

    /// List one page of a directory (or Drive folder id)
    async fn list(
        &self,
        directory: &str,
        page_size: u32,
        page_token: Option<&PageToken>,
    ) -> Result<ListResult, HandlerError>;

    /// Find a single entry by id, or by name inside a folder
    async fn file_lookup(
        &self,
        id: Option<&str>,
        name: Option<&str>,
        folder: Option<&str>,
    ) -> Result<FileInfo, HandlerError>;

    /// Copy a remote file into `sink`
    async fn download_file(
        &self,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        location: &str,
    ) -> Result<(), HandlerError>;

    /// Copy `source` into `destination/file_name`
    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        file_name: &str,
        destination: &str,
    ) -> Result<(), HandlerError>;

    /// Move (rename or reparent) a file
    async fn move_file(&self, source: &str, destination: &str) -> Result<(), HandlerError>;

    /// Create a directory
    async fn create_directory(&self, path: &str) -> Result<(), HandlerError>;

    /// Check whether a path exists
    async fn path_exists(&self, _path: &str) -> Result<bool, HandlerError> {
        Err(HandlerError::NotSupported(format!(
            "{} cannot check paths",
            self.handler_type()
        )))
    }

    /// Preflight: is the backend reachable and does `path` exist there
    async fn can_connect(&self, path: &str) -> Result<ConnectionStatus, HandlerError>;

    /// Delete a file
    async fn delete_file(&self, identifier: &str) -> Result<(), HandlerError>;
}

/// Handler factory for creating handler instances
#[derive(Debug, Clone, Default)]
pub struct HandlerFactory {
    google: Option<GoogleClientSecrets>,
}

impl HandlerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application OAuth secrets used to build Google Drive settings
    pub fn with_google_secrets(mut self, secrets: GoogleClientSecrets) -> Self {
        self.google = Some(secrets);
        self
    }

    /// Create an unconfigured handler for a backend type
    pub fn handler(handler_type: HandlerType) -> Result<Box<dyn FileHandler>, HandlerError> {
        match handler_type {
            HandlerType::Ftp => Ok(Self::handler_of::<FtpHandler>()),
            HandlerType::Sftp => Ok(Self::handler_of::<SftpHandler>()),
            HandlerType::GoogleDrive => Ok(Self::handler_of::<GoogleDriveHandler>()),
            HandlerType::OneDrive => Err(HandlerError::InvalidArgument(format!(
                "no handler implementation for {}",
                handler_type
            ))),
        }
    }

    /// Create an unconfigured handler of a concrete type
    pub fn handler_of<H>() -> Box<dyn FileHandler>
    where
        H: FileHandler + Default + 'static,
    {
        Box::new(H::default())
    }

    /// Build backend settings from a generic connection record
    pub fn settings(&self, info: &FileHandlerInfo) -> Result<HandlerSettings, HandlerError> {
        match info.handler_type {
            HandlerType::Ftp => {
                let mut settings = FtpSettings::new(info.host.clone());
                settings.user = info.user.clone();
                settings.password = info.password.clone().map(SecretString::from);
                if let Some(port) = info.effective_port() {
                    settings.port = port;
                }
                Ok(HandlerSettings::Ftp(settings))
            }
            HandlerType::Sftp => {
                let mut settings = SftpSettings::new(info.host.clone());
                settings.user = info.user.clone();
                settings.password = info.password.clone().map(SecretString::from);
                if let Some(port) = info.effective_port() {
                    settings.port = port;
                }
                Ok(HandlerSettings::Sftp(settings))
            }
            HandlerType::GoogleDrive => {
                let secrets = self.google.as_ref().ok_or_else(|| {
                    HandlerError::InvalidArgument(
                        "Google client secrets are not configured".to_string(),
                    )
                })?;
                let token = info
                    .connection_token
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        HandlerError::InvalidArgument(
                            "Google Drive requires a connection token".to_string(),
                        )
                    })?;
                Ok(HandlerSettings::GoogleDrive(GoogleDriveSettings::new(secrets, token)))
            }
            HandlerType::OneDrive => Err(HandlerError::InvalidArgument(format!(
                "no settings mapping for {}",
                info.handler_type
            ))),
        }
    }

    /// Create a handler and load the settings built from `info`
    pub async fn connect(&self, info: &FileHandlerInfo) -> Result<Box<dyn FileHandler>, HandlerError> {
        let settings = self.settings(info)?;
        let mut handler = Self::handler(info.handler_type)?;
        handler.load_settings(settings).await?;
        info!("{} handler ready for {}", info.handler_type, display_host(info));
        Ok(handler)
    }

    /// Get list of backend types with a handler implementation
    pub fn supported_types() -> Vec<HandlerType> {
        vec![HandlerType::Ftp, HandlerType::Sftp, HandlerType::GoogleDrive]
    }
}

fn display_host(info: &FileHandlerInfo) -> &str {
    if info.host.is_empty() {
        "default endpoint"
    } else {
        &info.host
    }
}
