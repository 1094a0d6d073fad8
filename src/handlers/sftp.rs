//! SFTP File Handler
//!
//! Implementation of the FileHandler trait for SFTP over SSH, using russh
//! for the transport and russh-sftp for the file protocol. A new SSH session
//! is negotiated for every operation and disconnected before returning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::{self, AuthResult, Config, Handle, Handler};
use russh::keys::{self, known_hosts, PrivateKeyWithHashAlg, PublicKey};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::types::{mime_for, require, DIRECTORY_MIME_TYPE};
use super::{
    ConnectionStatus, FileHandler, FileInfo, HandlerError, HandlerSettings, HandlerType,
    ListResult, PageToken, SftpSettings,
};

const SFTP_SCHEME: &str = "sftp://";

/// SSH client handler: trust-on-first-use against a known_hosts file
struct KnownHostsHandler {
    host: String,
    port: u16,
    /// `None` uses ~/.ssh/known_hosts
    store: Option<PathBuf>,
}

impl KnownHostsHandler {
    fn check(&self, key: &PublicKey) -> Result<bool, keys::Error> {
        match self.store {
            Some(ref path) => known_hosts::check_known_hosts_path(&self.host, self.port, key, path),
            None => known_hosts::check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn(&self, key: &PublicKey) -> Result<(), keys::Error> {
        match self.store {
            Some(ref path) => known_hosts::learn_known_hosts_path(&self.host, self.port, key, path),
            None => known_hosts::learn_known_hosts(&self.host, self.port, key),
        }
    }
}

impl Handler for KnownHostsHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.check(server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                if let Err(e) = self.learn(server_public_key) {
                    warn!("SFTP: failed to save host key for {}: {}", self.host, e);
                }
                Ok(true)
            }
            Err(keys::Error::KeyChanged { line }) => {
                error!(
                    "SFTP: rejecting {} - host key changed at known_hosts line {}",
                    self.host, line
                );
                Ok(false)
            }
            Err(e) => {
                error!("SFTP: rejecting {} - known_hosts check failed: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

/// Connection target resolved from settings at load time
#[derive(Debug, Clone)]
struct SftpTarget {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<SecretString>,
    private_key_path: Option<String>,
    key_passphrase: Option<SecretString>,
    timeout: Duration,
    known_hosts: Option<PathBuf>,
}

impl SftpTarget {
    fn from_settings(settings: SftpSettings) -> Result<Self, HandlerError> {
        let raw = require(&settings.url, "SFTP host")?;
        let host = match raw.get(..SFTP_SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(SFTP_SCHEME) => &raw[SFTP_SCHEME.len()..],
            _ => raw,
        };
        let host = require(host.trim_end_matches('/'), "SFTP host")?.to_string();

        Ok(Self {
            host,
            port: if settings.port == 0 { 22 } else { settings.port },
            user: settings.user.filter(|u| !u.trim().is_empty()),
            password: settings.password.filter(|p| !p.expose_secret().is_empty()),
            private_key_path: settings.private_key_path.filter(|p| !p.trim().is_empty()),
            key_passphrase: settings.key_passphrase,
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            known_hosts: settings.known_hosts_path,
        })
    }

    fn username(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }
}

/// One authenticated SSH session with the sftp subsystem open
struct SftpConnection {
    handle: Handle<KnownHostsHandler>,
    sftp: SftpSession,
}

impl SftpConnection {
    async fn close(self) {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP session close failed: {}", e);
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("SSH disconnect failed: {}", e);
        }
    }
}

/// Status replies map by code; other errors by their message
fn map_sftp_error(context: &str, err: SftpError) -> HandlerError {
    let text = err.to_string();
    let code = match err {
        SftpError::Timeout => return HandlerError::Timeout,
        SftpError::Status(ref status) => Some(status.status_code),
        _ => None,
    };
    match code {
        Some(StatusCode::NoSuchFile) => HandlerError::NotFound(format!("{}: {}", context, text)),
        Some(StatusCode::PermissionDenied) => {
            HandlerError::Unauthorized(format!("{}: {}", context, text))
        }
        None if text.contains("No such file") || text.contains("not found") => {
            HandlerError::NotFound(format!("{}: {}", context, text))
        }
        _ => HandlerError::connection(context.to_string(), err),
    }
}

fn expand_home(path: &str) -> std::path::PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| std::path::PathBuf::from(path)),
        None => std::path::PathBuf::from(path),
    }
}

fn remote_dir(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return ".".to_string();
    }
    match trimmed.trim_end_matches('/') {
        "" => "/".to_string(),
        dir => dir.to_string(),
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    match dir {
        "." => name.to_string(),
        d if d.ends_with('/') => format!("{}{}", d, name),
        d => format!("{}/{}", d, name),
    }
}

/// Slice a full listing into the requested 1-based page
pub(crate) fn page_slice<T>(items: Vec<T>, page: u32, page_size: u32) -> (Vec<T>, Option<PageToken>) {
    let total = items.len() as u64;
    let skip = u64::from(page.saturating_sub(1)) * u64::from(page_size);
    let entries: Vec<T> = items
        .into_iter()
        .skip(usize::try_from(skip).unwrap_or(usize::MAX))
        .take(page_size as usize)
        .collect();
    let next = if u64::from(page) * u64::from(page_size) < total {
        Some(PageToken::Page(page + 1))
    } else {
        None
    };
    (entries, next)
}

fn requested_page(token: Option<&PageToken>) -> Result<u32, HandlerError> {
    match token {
        None => Ok(1),
        Some(PageToken::Page(0)) => Err(HandlerError::InvalidArgument(
            "SFTP page numbers start at 1".to_string(),
        )),
        Some(PageToken::Page(page)) => Ok(*page),
        Some(PageToken::Cursor(cursor)) => Err(HandlerError::InvalidArgument(format!(
            "SFTP listings take a page number, not '{}'",
            cursor
        ))),
    }
}

fn file_info(dir: &str, name: String, attrs: &russh_sftp::protocol::FileAttributes) -> FileInfo {
    FileInfo {
        id: join_remote(dir, &name),
        mime_type: if attrs.is_dir() {
            DIRECTORY_MIME_TYPE.to_string()
        } else {
            mime_for(&name)
        },
        created_time: attrs
            .mtime
            .and_then(|secs| DateTime::<Utc>::from_timestamp(i64::from(secs), 0)),
        size: attrs.size.unwrap_or(0),
        name,
        additional: None,
    }
}

/// SFTP File Handler
#[derive(Debug, Default)]
pub struct SftpHandler {
    target: Option<SftpTarget>,
}

impl SftpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self) -> Result<&SftpTarget, HandlerError> {
        self.target.as_ref().ok_or(HandlerError::NotConfigured)
    }

    /// Connect, verify the host key, authenticate and open the sftp subsystem
    async fn open(&self) -> Result<SftpConnection, HandlerError> {
        let target = self.target()?;
        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        let addr = format!("{}:{}", target.host, target.port);
        debug!("Connecting to SSH server {}", addr);

        let mut handle = tokio::time::timeout(
            target.timeout,
            client::connect(
                Arc::new(config),
                addr.as_str(),
                KnownHostsHandler {
                    host: target.host.clone(),
                    port: target.port,
                    store: target.known_hosts.clone(),
                },
            ),
        )
        .await
        .map_err(|_| HandlerError::Timeout)?
        .map_err(|e| HandlerError::connection(format!("SSH connect to {}", addr), e))?;

        if let Err(e) = Self::authenticate(&mut handle, target).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(e);
        }

        match Self::start_sftp(&handle).await {
            Ok(sftp) => Ok(SftpConnection { handle, sftp }),
            Err(e) => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await;
                Err(e)
            }
        }
    }

    async fn start_sftp(handle: &Handle<KnownHostsHandler>) -> Result<SftpSession, HandlerError> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| HandlerError::connection("open SSH channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| HandlerError::connection("request sftp subsystem", e))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_sftp_error("start sftp session", e))
    }

    /// Private key first, then password, then `none`
    async fn authenticate(
        handle: &mut Handle<KnownHostsHandler>,
        target: &SftpTarget,
    ) -> Result<(), HandlerError> {
        let user = target.username();

        if let Some(ref key_path) = target.private_key_path {
            let path = expand_home(key_path);
            let passphrase = target.key_passphrase.as_ref().map(|p| p.expose_secret());
            match keys::load_secret_key(&path, passphrase) {
                Ok(key) => {
                    let key_pair = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                    match handle.authenticate_publickey(user, key_pair).await {
                        Ok(AuthResult::Success) => return Ok(()),
                        Ok(_) => debug!("SFTP: public key rejected for {}", user),
                        Err(e) => warn!("SFTP: public key auth error: {}", e),
                    }
                }
                Err(e) => warn!("SFTP: cannot load private key {}: {}", path.display(), e),
            }
        }

        if let Some(ref password) = target.password {
            match handle.authenticate_password(user, password.expose_secret()).await {
                Ok(AuthResult::Success) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(HandlerError::connection("SSH password auth", e)),
            }
        } else if target.private_key_path.is_none() {
            match handle.authenticate_none(user).await {
                Ok(AuthResult::Success) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(HandlerError::connection("SSH none auth", e)),
            }
        }

        Err(HandlerError::Unauthorized(format!(
            "SSH authentication failed for {}@{}",
            user, target.host
        )))
    }

    async fn read_listing(sftp: &SftpSession, dir: &str) -> Result<Vec<FileInfo>, HandlerError> {
        let read_dir = sftp
            .read_dir(dir)
            .await
            .map_err(|e| map_sftp_error("list", e))?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let attrs = entry.metadata();
            entries.push(file_info(dir, name, &attrs));
        }
        Ok(entries)
    }

    async fn exists(sftp: &SftpSession, path: &str) -> Result<bool, HandlerError> {
        match sftp.metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) => match map_sftp_error("stat", e) {
                e @ (HandlerError::Unauthorized(_) | HandlerError::Timeout) => Err(e),
                e => {
                    debug!("SFTP stat of {} treated as missing: {}", path, e);
                    Ok(false)
                }
            },
        }
    }

    async fn make_dirs(sftp: &SftpSession, path: &str) -> Result<(), HandlerError> {
        let absolute = path.starts_with('/');
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() || absolute {
                current.push('/');
            }
            current.push_str(segment);
            if Self::exists(sftp, &current).await? {
                continue;
            }
            debug!("Creating SFTP directory {}", current);
            sftp.create_dir(current.as_str())
                .await
                .map_err(|e| map_sftp_error("mkdir", e))?;
        }
        Ok(())
    }

    async fn run_lookup(sftp: &SftpSession, folder: &str, name: &str) -> Result<FileInfo, HandlerError> {
        let needle = name.to_lowercase();
        Self::read_listing(sftp, folder)
            .await?
            .into_iter()
            .find(|entry| entry.name.to_lowercase().contains(&needle))
            .map(|mut entry| {
                if !name.is_empty() && entry.mime_type != DIRECTORY_MIME_TYPE {
                    entry.mime_type = mime_for(name);
                }
                entry
            })
            .ok_or_else(|| HandlerError::NotFound(format!("no file matching '{}' in {}", name, folder)))
    }

    async fn run_download(
        sftp: &SftpSession,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        path: &str,
    ) -> Result<u64, HandlerError> {
        let mut remote = sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error("open", e))?;
        let copied = tokio::io::copy(&mut remote, sink).await?;
        sink.flush().await?;
        if let Err(e) = remote.shutdown().await {
            debug!("SFTP remote handle close failed: {}", e);
        }
        Ok(copied)
    }

    async fn run_upload<R>(sftp: &SftpSession, reader: &mut R, path: &str) -> Result<u64, HandlerError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut remote = sftp
            .create(path)
            .await
            .map_err(|e| map_sftp_error("create", e))?;
        let copied = tokio::io::copy(reader, &mut remote).await?;
        remote.shutdown().await?;
        Ok(copied)
    }

    async fn run_move(sftp: &SftpSession, from: &str, to: &str) -> Result<(), HandlerError> {
        if !Self::exists(sftp, from).await? {
            return Err(HandlerError::NotFound(from.to_string()));
        }
        if Self::exists(sftp, to).await? {
            return Err(HandlerError::DuplicateDestination(to.to_string()));
        }
        sftp.rename(from, to)
            .await
            .map_err(|e| map_sftp_error("rename", e))
    }
}

#[async_trait]
impl FileHandler for SftpHandler {
    fn handler_type(&self) -> HandlerType {
        HandlerType::Sftp
    }

    fn is_configured(&self) -> bool {
        self.target.is_some()
    }

    async fn load_settings(&mut self, settings: HandlerSettings) -> Result<(), HandlerError> {
        if self.target.is_some() {
            return Err(HandlerError::InvalidArgument(
                "SFTP settings are already loaded".to_string(),
            ));
        }
        let settings = match settings {
            HandlerSettings::Sftp(settings) => settings,
            other => return Err(other.mismatch(HandlerType::Sftp)),
        };
        let target = SftpTarget::from_settings(settings)?;
        info!(
            "SFTP handler configured for {}@{}:{}",
            target.username(),
            target.host,
            target.port
        );
        self.target = Some(target);
        Ok(())
    }

    async fn list(
        &self,
        directory: &str,
        page_size: u32,
        page_token: Option<&PageToken>,
    ) -> Result<ListResult, HandlerError> {
        self.target()?;
        if page_size == 0 {
            return Err(HandlerError::InvalidArgument(
                "page size must be at least 1".to_string(),
            ));
        }
        let page = requested_page(page_token)?;
        let dir = remote_dir(directory);

        let conn = self.open().await?;
        let result = Self::read_listing(&conn.sftp, &dir).await;
        conn.close().await;

        let (entries, next_page_token) = page_slice(result?, page, page_size);
        info!("Listed page {} of SFTP directory '{}' ({} entries)", page, dir, entries.len());
        Ok(ListResult { entries, next_page_token })
    }

    async fn file_lookup(
        &self,
        _id: Option<&str>,
        name: Option<&str>,
        folder: Option<&str>,
    ) -> Result<FileInfo, HandlerError> {
        self.target()?;
        let name = name.map(str::trim).unwrap_or_default();
        let folder = folder.map(str::trim).unwrap_or_default();
        if name.is_empty() && folder.is_empty() {
            return Err(HandlerError::InvalidArgument(
                "file name or folder must be given".to_string(),
            ));
        }
        let dir = remote_dir(folder);

        let conn = self.open().await?;
        let result = Self::run_lookup(&conn.sftp, &dir, name).await;
        conn.close().await;
        result
    }

    async fn download_file(
        &self,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        location: &str,
    ) -> Result<(), HandlerError> {
        self.target()?;
        let path = require(location, "file location")?;

        let conn = self.open().await?;
        let result = Self::run_download(&conn.sftp, sink, path).await;
        conn.close().await;

        let bytes = result?;
        info!("Downloaded {} ({} bytes) via SFTP", path, bytes);
        Ok(())
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        file_name: &str,
        destination: &str,
    ) -> Result<(), HandlerError> {
        self.target()?;
        let file_name = require(file_name, "file name")?;
        let destination = require(destination, "upload path")?;
        let mut reader = BufReader::new(source);
        if reader.fill_buf().await?.is_empty() {
            return Err(HandlerError::InvalidArgument(
                "cannot upload an empty stream".to_string(),
            ));
        }
        let path = join_remote(&remote_dir(destination), file_name);

        let conn = self.open().await?;
        let result = Self::run_upload(&conn.sftp, &mut reader, &path).await;
        conn.close().await;

        let bytes = result?;
        info!("Uploaded {} ({} bytes) via SFTP", path, bytes);
        Ok(())
    }

    async fn move_file(&self, source: &str, destination: &str) -> Result<(), HandlerError> {
        self.target()?;
        let from = require(source, "source")?;
        let to = require(destination, "destination")?;

        let conn = self.open().await?;
        let result = Self::run_move(&conn.sftp, from, to).await;
        conn.close().await;

        result?;
        info!("Moved {} to {} via SFTP", from, to);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), HandlerError> {
        self.target()?;
        let path = require(path, "directory path")?;

        let conn = self.open().await?;
        let result = Self::make_dirs(&conn.sftp, path).await;
        conn.close().await;
        result
    }

    async fn path_exists(&self, path: &str) -> Result<bool, HandlerError> {
        self.target()?;
        let path = require(path, "path")?;

        let conn = self.open().await?;
        let result = Self::exists(&conn.sftp, path).await;
        conn.close().await;
        result
    }

    async fn can_connect(&self, path: &str) -> Result<ConnectionStatus, HandlerError> {
        let target = self.target()?;
        let conn = match self.open().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("SFTP server {} unreachable: {}", target.host, e);
                return Ok(ConnectionStatus::unreachable());
            }
        };

        let status = match conn.sftp.read_dir(remote_dir(path)).await {
            Ok(_) => ConnectionStatus::reachable(),
            Err(e) => match map_sftp_error("list", e) {
                HandlerError::NotFound(_) => ConnectionStatus::missing_folder(),
                _ => ConnectionStatus::unreachable(),
            },
        };
        conn.close().await;
        Ok(status)
    }

    async fn delete_file(&self, identifier: &str) -> Result<(), HandlerError> {
        self.target()?;
        let path = require(identifier, "file path")?;

        let conn = self.open().await?;
        let result = conn
            .sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error("delete", e));
        conn.close().await;

        result?;
        info!("Deleted {} via SFTP", path);
        Ok(())
    }
}
