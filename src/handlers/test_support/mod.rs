//! In-process servers for handler tests
//!
//! The HTTP responder here backs the Drive and OAuth tests; `ftp` and
//! `sftp` hold scripted servers over in-memory trees.

pub(crate) mod sftp;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Canned response served when method and path prefix match
#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    method: String,
    path_prefix: String,
    status: u16,
    content_type: String,
    body: Vec<u8>,
}

impl MockResponse {
    pub(crate) fn json(method: &str, path_prefix: &str, status: u16, body: &str) -> Self {
        Self {
            method: method.to_string(),
            path_prefix: path_prefix.to_string(),
            status,
            content_type: "application/json".to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub(crate) fn bytes(method: &str, path_prefix: &str, body: &[u8]) -> Self {
        Self {
            method: method.to_string(),
            path_prefix: path_prefix.to_string(),
            status: 200,
            content_type: "application/octet-stream".to_string(),
            body: body.to_vec(),
        }
    }
}

/// Request as seen by the responder
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct MockServer {
    pub base: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    /// Bind to an ephemeral port and serve `routes` until the runtime stops
    pub(crate) async fn start(routes: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let routes = routes.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    serve(socket, &routes, &recorded).await;
                });
            }
        });

        Self {
            base: format!("http://{}", addr),
            requests,
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("request log").clone()
    }
}

async fn serve(
    mut socket: TcpStream,
    routes: &[MockResponse],
    recorded: &Mutex<Vec<RecordedRequest>>,
) -> Option<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buffer[header_end..]).to_string();

    let route = routes
        .iter()
        .find(|r| r.method == method && path.starts_with(&r.path_prefix));
    let (status, content_type, payload) = match route {
        Some(r) => (r.status, r.content_type.as_str(), r.body.clone()),
        None => (
            404,
            "application/json",
            br#"{"error":{"code":404,"message":"no route"}}"#.to_vec(),
        ),
    };

    // Recorded before the response is written
    recorded
        .lock()
        .expect("request log")
        .push(RecordedRequest { method, path, headers, body });

    let head = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        payload.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(&payload).await;
    let _ = socket.shutdown().await;
    Some(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Directory tree shared by the FTP and SFTP servers
///
/// Paths are absolute and normalized; `/` always exists.
#[derive(Debug)]
pub(crate) struct MemoryTree {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Every request as "<verb> <argument>"
    pub commands: Vec<String>,
}

impl MemoryTree {
    pub(crate) fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            dirs: BTreeSet::from(["/".to_string()]),
            files: BTreeMap::new(),
            commands: Vec::new(),
        }))
    }

    pub(crate) fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.dirs.insert(current.clone());
        }
    }

    pub(crate) fn add_file(&mut self, path: &str, content: &[u8]) {
        self.add_dir(parent(path));
        self.files.insert(path.to_string(), content.to_vec());
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }

    /// Direct children of `dir`: subdirectories first, then files with their size
    pub(crate) fn children(&self, dir: &str) -> Vec<(String, Option<usize>)> {
        let dirs = self
            .dirs
            .iter()
            .filter(|d| d.as_str() != dir && parent(d) == dir)
            .map(|d| (base_name(d).to_string(), None));
        let files = self
            .files
            .iter()
            .filter(|(f, _)| parent(f) == dir)
            .map(|(f, content)| (base_name(f).to_string(), Some(content.len())));
        dirs.chain(files).collect()
    }

    /// Move a file or a whole directory; false when `from` is missing
    pub(crate) fn rename(&mut self, from: &str, to: &str) -> bool {
        if let Some(content) = self.files.remove(from) {
            self.files.insert(to.to_string(), content);
            return true;
        }
        if !self.dirs.contains(from) {
            return false;
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = self
            .dirs
            .iter()
            .filter(|d| d.as_str() == from || d.starts_with(&prefix))
            .cloned()
            .collect();
        for dir in moved {
            self.dirs.remove(&dir);
            self.dirs.insert(format!("{}{}", to, &dir[from.len()..]));
        }
        let moved: Vec<String> = self
            .files
            .keys()
            .filter(|f| f.starts_with(&prefix))
            .cloned()
            .collect();
        for file in moved {
            if let Some(content) = self.files.remove(&file) {
                self.files.insert(format!("{}{}", to, &file[from.len()..]), content);
            }
        }
        true
    }

    pub(crate) fn count(&self, verb: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }
}

/// Absolute form of a client path; relative paths hang off `/`
pub(crate) fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

pub(crate) fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
