//! FTP File Handler
//!
//! Implementation of the FileHandler trait for FTP and explicit FTPS.
//! Uses the suppaftp crate; every operation runs on its own control
//! connection which is closed with QUIT before the call returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use suppaftp::tokio::{AsyncNativeTlsConnector, AsyncNativeTlsFtpStream};
use suppaftp::types::FileType;
use suppaftp::{FtpError, Status};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{has_extension, mime_for, require, DIRECTORY_MIME_TYPE};
use super::{
    ConnectionStatus, FileHandler, FileInfo, FtpSettings, FtpTlsMode, HandlerError,
    HandlerSettings, HandlerType, ListResult, PageToken,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a server reply says, independent of the command that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Complete,
    NoMatches,
    Matches,
    NotFound,
    NotLoggedIn,
    Unrecognized,
}

/// Leading three-digit reply code, if the text starts with one
fn reply_code(text: &str) -> Option<u16> {
    let head = text.trim_start().get(..3)?;
    if head.bytes().all(|b| b.is_ascii_digit()) {
        head.parse().ok()
    } else {
        None
    }
}

/// Entry count from "<n> matches" phrasing
fn announced_matches(lower: &str) -> Option<u64> {
    let words: Vec<&str> = lower.split_whitespace().collect();
    words
        .windows(2)
        .find(|pair| pair[1].starts_with("matches"))
        .and_then(|pair| pair[0].parse().ok())
}

/// Classify FTP reply (or error) text
///
/// Status codes are read from the start of the reply only; the phrasing
/// checks cover servers that word the same outcome differently.
pub fn classify_reply(text: &str) -> ReplyClass {
    let lower = text.to_lowercase();
    let code = reply_code(&lower);
    if code == Some(530) || lower.contains("not logged in") {
        ReplyClass::NotLoggedIn
    } else if code == Some(550) || lower.contains("not found") || lower.contains("no such file") {
        ReplyClass::NotFound
    } else if code.is_some_and(|c| c >= 400) {
        ReplyClass::Unrecognized
    } else if lower.contains("complete") {
        ReplyClass::Complete
    } else if lower.contains("matches") {
        match announced_matches(&lower) {
            Some(0) => ReplyClass::NoMatches,
            _ => ReplyClass::Matches,
        }
    } else {
        ReplyClass::Unrecognized
    }
}

/// Server reply carried by a suppaftp error, or its message otherwise
fn reply_text(err: &FtpError) -> String {
    match err {
        FtpError::UnexpectedResponse(response) => {
            String::from_utf8_lossy(&response.body).trim_end().to_string()
        }
        other => other.to_string(),
    }
}

/// Map a suppaftp error onto the handler error taxonomy
fn map_ftp_error(context: &str, err: FtpError) -> HandlerError {
    if let FtpError::ConnectionError(ref io) = err {
        if io.kind() == std::io::ErrorKind::TimedOut {
            return HandlerError::Timeout;
        }
    }
    let text = reply_text(&err);
    match classify_reply(&text) {
        ReplyClass::NotLoggedIn => HandlerError::Unauthorized(text),
        ReplyClass::NotFound => HandlerError::NotFound(format!("{}: {}", context, text)),
        _ => HandlerError::connection(context.to_string(), err),
    }
}

/// LIST output together with the server's closing reply
#[derive(Debug)]
struct Listing {
    lines: Vec<String>,
    reply: String,
}

impl Listing {
    /// Whether the listing shows the directory, judged by the closing reply
    ///
    /// An unrecognized reply only counts as present when entries came back.
    fn verdict(&self) -> Result<bool, HandlerError> {
        match classify_reply(&self.reply) {
            ReplyClass::Complete | ReplyClass::Matches => Ok(true),
            ReplyClass::NoMatches | ReplyClass::NotFound => Ok(false),
            ReplyClass::NotLoggedIn => Err(HandlerError::Unauthorized(self.reply.clone())),
            ReplyClass::Unrecognized => {
                if self.lines.iter().any(|line| parse_list_line(line).is_some()) {
                    Ok(true)
                } else {
                    Err(HandlerError::connection(
                        "classify LIST reply",
                        format!("unrecognized reply '{}'", self.reply),
                    ))
                }
            }
        }
    }
}

/// Run LIST and keep the closing reply, which `list()` discards
///
/// The session cannot open another data channel afterwards.
async fn list_with_reply(stream: &mut AsyncNativeTlsFtpStream, path: &str) -> Result<Listing, FtpError> {
    let (_, data) = stream
        .custom_data_command(
            format!("LIST {}", path),
            &[Status::AboutToSend, Status::AlreadyOpen],
        )
        .await?;
    let mut reader = BufReader::new(data);
    let lines = AsyncNativeTlsFtpStream::get_lines_from_stream(&mut reader).await;
    drop(reader);
    let reply = stream
        .read_response_in(&[Status::ClosingDataConnection, Status::RequestedFileActionOk])
        .await?;
    Ok(Listing {
        lines: lines?,
        reply: String::from_utf8_lossy(&reply.body).trim_end().to_string(),
    })
}

/// Login directory or server root
fn is_root(path: &str) -> bool {
    path.trim().trim_end_matches('/').is_empty()
}

/// Connection target resolved from settings at load time
#[derive(Debug, Clone)]
struct FtpTarget {
    host: String,
    port: u16,
    /// Directory relative paths are joined onto; empty means the login directory
    base_path: String,
    tls_mode: FtpTlsMode,
    verify_cert: bool,
    user: String,
    password: SecretString,
}

impl FtpTarget {
    fn from_settings(settings: &FtpSettings) -> Result<Self, HandlerError> {
        let raw = require(&settings.url, "FTP url")?;
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("ftp://{}", raw)
        };
        let parsed = Url::parse(&with_scheme).map_err(|e| {
            HandlerError::InvalidArgument(format!("invalid FTP url '{}': {}", raw, e))
        })?;

        let tls_mode = match parsed.scheme() {
            "ftp" => settings.tls_mode,
            "ftps" => FtpTlsMode::Explicit,
            other => {
                return Err(HandlerError::InvalidArgument(format!(
                    "unsupported FTP url scheme '{}'",
                    other
                )))
            }
        };

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| HandlerError::InvalidArgument(format!("FTP url '{}' has no host", raw)))?
            .to_string();

        let base_path = urlencoding::decode(parsed.path())
            .map_err(|e| HandlerError::InvalidArgument(format!("invalid FTP path: {}", e)))?
            .trim_end_matches('/')
            .to_string();

        let port = match parsed.port().unwrap_or(settings.port) {
            0 => 21,
            port => port,
        };

        let (user, password) = match settings.credentials() {
            Some((user, password)) => (user.to_string(), password.clone()),
            None => (
                "anonymous".to_string(),
                SecretString::from("anonymous@".to_string()),
            ),
        };

        Ok(Self {
            host,
            port,
            base_path,
            tls_mode,
            verify_cert: settings.verify_cert,
            user,
            password,
        })
    }

    /// Server path for a caller path
    fn resolve(&self, path: &str) -> String {
        resolve_path(&self.base_path, path)
    }
}

/// Leading `/` is absolute; anything else is joined onto `base`
fn resolve_path(base: &str, path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        let trimmed = path.trim_end_matches('/');
        return if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
    }
    let path = path.trim_end_matches('/');
    match (base.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, path),
    }
}

fn join_path(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else if folder.ends_with('/') {
        format!("{}{}", folder, name)
    } else {
        format!("{}/{}", folder, name)
    }
}

/// Cumulative prefixes of a path: `/a/b` yields `/a`, `/a/b`
fn path_prefixes(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = String::new();
    let mut prefixes = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() || absolute {
            current.push('/');
        }
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Parse one LIST line; Unix, then DOS, then "last token is the name"
pub(crate) fn parse_list_line(line: &str) -> Option<FileInfo> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with("total ") {
        return None;
    }
    let entry = parse_unix_listing(line)
        .or_else(|| parse_dos_listing(line))
        .or_else(|| parse_bare_listing(line))?;
    if entry.name == "." || entry.name == ".." {
        return None;
    }
    Some(FileInfo {
        additional: Some(serde_json::Value::String(line.to_string())),
        ..entry
    })
}

/// Parse Unix-style listing (ls -l format)
fn parse_unix_listing(line: &str) -> Option<FileInfo> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }

    let permissions = parts[0];
    if permissions.len() < 10 || !matches!(permissions.chars().next(), Some('d' | 'l' | '-')) {
        return None;
    }
    let is_dir = permissions.starts_with('d');
    let size: u64 = parts[4].parse().unwrap_or(0);

    // Name is everything after the 8th part (to handle spaces in names)
    let mut name = parts[8..].join(" ");
    if permissions.starts_with('l') {
        if let Some((link, _target)) = name.split_once(" -> ") {
            name = link.to_string();
        }
    }

    Some(entry(name, is_dir, size))
}

/// Parse DOS-style listing (Windows FTP servers)
fn parse_dos_listing(line: &str) -> Option<FileInfo> {
    // 01-23-24  10:30AM       <DIR>          folder_name
    // 01-23-24  10:30AM           12345      file.txt
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 || !parts[0].contains('-') {
        return None;
    }

    let is_dir = parts[2] == "<DIR>";
    let size: u64 = if is_dir { 0 } else { parts[2].parse().ok()? };
    Some(entry(parts[3..].join(" "), is_dir, size))
}

fn parse_bare_listing(line: &str) -> Option<FileInfo> {
    line.split_whitespace()
        .last()
        .map(|name| entry(name.to_string(), false, 0))
}

fn entry(name: String, is_dir: bool, size: u64) -> FileInfo {
    let mut info = FileInfo::named(name);
    info.size = size;
    if is_dir {
        info.mime_type = DIRECTORY_MIME_TYPE.to_string();
    }
    info
}

/// FTP/FTPS File Handler
#[derive(Debug, Default)]
pub struct FtpHandler {
    target: Option<FtpTarget>,
}

impl FtpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self) -> Result<&FtpTarget, HandlerError> {
        self.target.as_ref().ok_or(HandlerError::NotConfigured)
    }

    /// Create a TLS connector with the configured certificate verification settings
    fn make_tls_connector(target: &FtpTarget) -> AsyncNativeTlsConnector {
        let mut builder = native_tls::TlsConnector::builder();
        if !target.verify_cert {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        let connector = suppaftp::async_native_tls::TlsConnector::from(builder);
        AsyncNativeTlsConnector::from(connector)
    }

    /// Connect, upgrade to TLS if requested, log in and switch to binary mode
    async fn open(&self) -> Result<AsyncNativeTlsFtpStream, HandlerError> {
        let target = self.target()?;
        let addr = format!("{}:{}", target.host, target.port);
        debug!("Connecting to FTP server {}", addr);

        let stream = timeout(CONNECT_TIMEOUT, AsyncNativeTlsFtpStream::connect(&addr))
            .await
            .map_err(|_| HandlerError::Timeout)?
            .map_err(|e| map_ftp_error("connect", e))?;

        let mut stream = match target.tls_mode {
            FtpTlsMode::None => stream,
            FtpTlsMode::Explicit => {
                // Explicit TLS (AUTH TLS) - connect plain, then upgrade
                let connector = Self::make_tls_connector(target);
                stream
                    .into_secure(connector, &target.host)
                    .await
                    .map_err(|e| map_ftp_error("TLS upgrade", e))?
            }
        };

        let login = async {
            stream
                .login(target.user.as_str(), target.password.expose_secret())
                .await
                .map_err(|e| map_ftp_error("login", e))?;
            stream
                .transfer_type(FileType::Binary)
                .await
                .map_err(|e| map_ftp_error("binary mode", e))
        }
        .await;

        match login {
            Ok(()) => Ok(stream),
            Err(e) => {
                Self::close(stream).await;
                Err(e)
            }
        }
    }

    async fn close(mut stream: AsyncNativeTlsFtpStream) {
        match timeout(QUIT_TIMEOUT, stream.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("FTP QUIT failed: {}", e),
            Err(_) => warn!("FTP QUIT timed out"),
        }
    }

    /// Existence check on a connection of its own
    ///
    /// A directory check leaves its session without a usable data channel,
    /// so it never shares the operation's connection. Connection errors
    /// propagate; a check that cannot decide reports `false`.
    async fn exists(&self, path: &str) -> Result<bool, HandlerError> {
        if is_root(path) {
            return Ok(true);
        }
        let mut stream = self.open().await?;
        let outcome = Self::exists_on(&mut stream, path).await;
        Self::close(stream).await;

        match outcome {
            Ok(exists) => Ok(exists),
            Err(e @ (HandlerError::Unauthorized(_) | HandlerError::Timeout)) => Err(e),
            Err(e) => {
                debug!("FTP check of {} treated as missing: {}", path, e);
                Ok(false)
            }
        }
    }

    async fn exists_on(stream: &mut AsyncNativeTlsFtpStream, path: &str) -> Result<bool, HandlerError> {
        if has_extension(path) {
            return stream
                .size(path)
                .await
                .map(|_| true)
                .map_err(|e| map_ftp_error("size", e));
        }
        list_with_reply(stream, path)
            .await
            .map_err(|e| map_ftp_error("list", e))?
            .verdict()
    }

    async fn make_dirs(&self, stream: &mut AsyncNativeTlsFtpStream, path: &str) -> Result<(), HandlerError> {
        for prefix in path_prefixes(path) {
            if self.exists(&prefix).await? {
                continue;
            }
            debug!("Creating FTP directory {}", prefix);
            match stream.mkdir(&prefix).await {
                Ok(()) => {}
                // Empty directories read as "0 matches" on some servers
                Err(e) if reply_text(&e).to_lowercase().contains("exists") => {
                    debug!("FTP directory {} already exists", prefix);
                }
                Err(e) => return Err(map_ftp_error("mkdir", e)),
            }
        }
        Ok(())
    }

    async fn run_list(stream: &mut AsyncNativeTlsFtpStream, path: &str) -> Result<Vec<FileInfo>, HandlerError> {
        let target = if path.is_empty() { None } else { Some(path) };
        let lines = stream
            .list(target)
            .await
            .map_err(|e| map_ftp_error("list", e))?;
        Ok(lines.iter().filter_map(|line| parse_list_line(line)).collect())
    }

    async fn run_lookup(
        &self,
        stream: &mut AsyncNativeTlsFtpStream,
        path: &str,
        name: &str,
    ) -> Result<FileInfo, HandlerError> {
        if !self.exists(path).await? {
            return Err(HandlerError::NotFound(path.to_string()));
        }
        let size = stream
            .size(path)
            .await
            .map_err(|e| map_ftp_error("size", e))?;
        let modified = match stream.mdtm(path).await {
            Ok(time) => Some(DateTime::<Utc>::from_naive_utc_and_offset(time, Utc)),
            Err(e) => {
                debug!("MDTM unavailable for {}: {}", path, e);
                None
            }
        };

        let mut info = FileInfo::named(name);
        info.size = size as u64;
        info.created_time = modified;
        Ok(info)
    }

    async fn run_download(
        stream: &mut AsyncNativeTlsFtpStream,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        path: &str,
    ) -> Result<u64, HandlerError> {
        let mut data_stream = stream
            .retr_as_stream(path)
            .await
            .map_err(|e| map_ftp_error("retrieve", e))?;
        let copied = tokio::io::copy(&mut data_stream, sink).await?;
        sink.flush().await?;
        stream
            .finalize_retr_stream(data_stream)
            .await
            .map_err(|e| map_ftp_error("retrieve", e))?;
        Ok(copied)
    }

    async fn run_upload<R>(
        &self,
        stream: &mut AsyncNativeTlsFtpStream,
        reader: &mut R,
        folder: &str,
        path: &str,
    ) -> Result<u64, HandlerError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.exists(folder).await? {
            self.make_dirs(stream, folder).await?;
        }
        stream
            .put_file(path, reader)
            .await
            .map_err(|e| map_ftp_error("store", e))
    }

    async fn run_move(
        &self,
        stream: &mut AsyncNativeTlsFtpStream,
        from: &str,
        to: &str,
    ) -> Result<(), HandlerError> {
        if !self.exists(from).await? {
            return Err(HandlerError::NotFound(from.to_string()));
        }
        if self.exists(to).await? {
            return Err(HandlerError::DuplicateDestination(to.to_string()));
        }
        stream
            .rename(from, to)
            .await
            .map_err(|e| map_ftp_error("rename", e))
    }
}

#[async_trait]
impl FileHandler for FtpHandler {
    fn handler_type(&self) -> HandlerType {
        HandlerType::Ftp
    }

    fn is_configured(&self) -> bool {
        self.target.is_some()
    }

    async fn load_settings(&mut self, settings: HandlerSettings) -> Result<(), HandlerError> {
        if self.target.is_some() {
            return Err(HandlerError::InvalidArgument(
                "FTP settings are already loaded".to_string(),
            ));
        }
        let settings = match settings {
            HandlerSettings::Ftp(settings) => settings,
            other => return Err(other.mismatch(HandlerType::Ftp)),
        };
        let target = FtpTarget::from_settings(&settings)?;
        info!(
            "FTP handler configured for {}:{} (tls: {:?})",
            target.host, target.port, target.tls_mode
        );
        self.target = Some(target);
        Ok(())
    }

    async fn list(
        &self,
        directory: &str,
        _page_size: u32,
        page_token: Option<&PageToken>,
    ) -> Result<ListResult, HandlerError> {
        let target = self.target()?;
        if let Some(token) = page_token {
            return Err(HandlerError::InvalidArgument(format!(
                "FTP listings are not paged (got token '{}')",
                token
            )));
        }
        let path = target.resolve(directory);

        let mut stream = self.open().await?;
        let result = Self::run_list(&mut stream, &path).await;
        Self::close(stream).await;

        let entries = result?;
        info!("Listed {} entries in FTP directory '{}'", entries.len(), path);
        Ok(ListResult { entries, next_page_token: None })
    }

    async fn file_lookup(
        &self,
        _id: Option<&str>,
        name: Option<&str>,
        folder: Option<&str>,
    ) -> Result<FileInfo, HandlerError> {
        let target = self.target()?;
        let name = require(name.unwrap_or_default(), "file name")?;
        let path = join_path(&target.resolve(folder.unwrap_or_default()), name);

        let mut stream = self.open().await?;
        let result = self.run_lookup(&mut stream, &path, name).await;
        Self::close(stream).await;
        result
    }

    async fn download_file(
        &self,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        location: &str,
    ) -> Result<(), HandlerError> {
        let target = self.target()?;
        let path = target.resolve(require(location, "file location")?);

        let mut stream = self.open().await?;
        let result = Self::run_download(&mut stream, sink, &path).await;
        Self::close(stream).await;

        let bytes = result?;
        info!("Downloaded {} ({} bytes) via FTP", path, bytes);
        Ok(())
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        file_name: &str,
        destination: &str,
    ) -> Result<(), HandlerError> {
        let target = self.target()?;
        let file_name = require(file_name, "file name")?;
        let mut reader = BufReader::new(source);
        if reader.fill_buf().await?.is_empty() {
            return Err(HandlerError::InvalidArgument(
                "cannot upload an empty stream".to_string(),
            ));
        }
        let folder = target.resolve(destination);
        let path = join_path(&folder, file_name);

        let mut stream = self.open().await?;
        let result = self.run_upload(&mut stream, &mut reader, &folder, &path).await;
        Self::close(stream).await;

        let bytes = result?;
        info!("Uploaded {} ({} bytes) via FTP", path, bytes);
        Ok(())
    }

    async fn move_file(&self, source: &str, destination: &str) -> Result<(), HandlerError> {
        let target = self.target()?;
        let from = target.resolve(require(source, "source")?);
        let to = target.resolve(require(destination, "destination")?);

        let mut stream = self.open().await?;
        let result = self.run_move(&mut stream, &from, &to).await;
        Self::close(stream).await;

        result?;
        info!("Moved {} to {} via FTP", from, to);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), HandlerError> {
        let target = self.target()?;
        let path = target.resolve(require(path, "directory path")?);

        let mut stream = self.open().await?;
        let result = self.make_dirs(&mut stream, &path).await;
        Self::close(stream).await;
        result
    }

    async fn path_exists(&self, path: &str) -> Result<bool, HandlerError> {
        let target = self.target()?;
        let path = target.resolve(require(path, "path")?);
        self.exists(&path).await
    }

    async fn can_connect(&self, path: &str) -> Result<ConnectionStatus, HandlerError> {
        let target = self.target()?;
        let mut stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("FTP server {} unreachable: {}", target.host, e);
                return Ok(ConnectionStatus::unreachable());
            }
        };

        let resolved = target.resolve(path);
        let status = if is_root(&resolved) {
            ConnectionStatus::reachable()
        } else {
            match list_with_reply(&mut stream, &resolved).await {
                Ok(listing) => match listing.verdict() {
                    Ok(true) => ConnectionStatus::reachable(),
                    Ok(false) => ConnectionStatus::missing_folder(),
                    Err(e) => {
                        warn!("FTP folder check for {} inconclusive: {}", resolved, e);
                        ConnectionStatus::unreachable()
                    }
                },
                Err(e) => match map_ftp_error("list", e) {
                    HandlerError::NotFound(_) => ConnectionStatus::missing_folder(),
                    _ => ConnectionStatus::unreachable(),
                },
            }
        };
        Self::close(stream).await;
        Ok(status)
    }

    async fn delete_file(&self, identifier: &str) -> Result<(), HandlerError> {
        let target = self.target()?;
        let path = target.resolve(require(identifier, "file path")?);

        let mut stream = self.open().await?;
        let result = stream.rm(&path).await.map_err(|e| map_ftp_error("delete", e));
        Self::close(stream).await;

        result?;
        info!("Deleted {} via FTP", path);
        Ok(())
    }
}
