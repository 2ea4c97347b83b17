use crate::api::{self, AppContext};
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8787";

const INDEX_HTML: &str = include_str!("../web/index.html");
const MAX_HEAD_BYTES: usize = 16_384;
const MAX_BODY_BYTES: usize = 1 << 20;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    /// Serve the UI from this directory instead of the embedded page.
    pub web_root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub url: String,
    pub addr: SocketAddr,
    stop_tx: mpsc::Sender<()>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }

    /// Blocks until the accept loop exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

struct Request {
    method: String,
    raw_path: String,
    body: Vec<u8>,
}

/// Types the control UI ships; anything else is sent as raw bytes.
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript; charset=utf-8"),
    ("json", "application/json; charset=utf-8"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("ico", "image/x-icon"),
];

fn content_type_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
    CONTENT_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map_or("application/octet-stream", |&(_, mime)| mime)
}

fn write_http_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    head_only: bool,
) -> Result<()> {
    let mut response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_text(status),
        body.len()
    )
    .into_bytes();
    if !head_only {
        response.extend_from_slice(body);
    }
    stream.write_all(&response)?;
    Ok(())
}

fn write_text(stream: &mut TcpStream, status: u16, head_only: bool) -> Result<()> {
    write_http_response(
        stream,
        status,
        "text/plain; charset=utf-8",
        status_text(status).as_bytes(),
        head_only,
    )
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "OK",
    }
}

/// Drops the query string and percent-decodes what is left. `None` for
/// truncated escapes or bytes that do not form UTF-8.
fn request_path(raw: &str) -> Option<String> {
    let path = raw.split_once('?').map_or(raw, |(path, _)| path);
    let mut pieces = path.split('%');
    let mut decoded = pieces.next().unwrap_or_default().as_bytes().to_vec();
    for piece in pieces {
        let hex = piece.get(..2).filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))?;
        decoded.push(u8::from_str_radix(hex, 16).ok()?);
        decoded.extend_from_slice(&piece.as_bytes()[2..]);
    }
    String::from_utf8(decoded).ok()
}

/// Maps a decoded request path onto `root`, refusing any `..` segment.
fn file_under(root: &Path, path: &str) -> Option<PathBuf> {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.contains(&"..") {
        return None;
    }
    Some(segments.iter().fold(root.to_path_buf(), |dir, segment| dir.join(segment)))
}

fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Reads the request head and, when `Content-Length` says so, the body.
/// `Ok(None)` means the peer closed without sending anything.
fn read_request(stream: &mut TcpStream) -> Result<Option<Request>> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 16_384];
    let split = loop {
        if let Some(at) = head_end(&buffer) {
            break at;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(anyhow!("request head exceeds {MAX_HEAD_BYTES} bytes"));
        }
        let read = stream.read(&mut chunk).context("failed reading request")?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(anyhow!("connection closed inside request head"));
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..split]).into_owned();
    let mut lines = head.lines();
    let mut parts = lines.next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default().to_ascii_uppercase();
    let raw_path = parts.next().unwrap_or("/").to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<usize>())
        .transpose()
        .context("invalid Content-Length header")?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body exceeds {MAX_BODY_BYTES} bytes"));
    }

    let mut body = buffer[split + 4..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).context("failed reading request body")?;
        if read == 0 {
            return Err(anyhow!(
                "connection closed after {} of {content_length} body bytes",
                body.len()
            ));
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(Some(Request {
        method,
        raw_path,
        body,
    }))
}

fn handle_connection(mut stream: TcpStream, ctx: &AppContext, web_root: Option<&Path>) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("failed setting connection blocking mode")?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .context("failed setting read timeout")?;

    let request = match read_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            write_text(&mut stream, 400, false)?;
            return Err(err);
        }
    };

    let Some(decoded) = request_path(&request.raw_path) else {
        return write_text(&mut stream, 400, false);
    };

    if decoded == "/api" || decoded.starts_with("/api/") {
        let response = api::handle(ctx, &request.method, &decoded, &request.body);
        info!(
            method = %request.method,
            path = %decoded,
            status = response.status,
            "api request"
        );
        return write_http_response(
            &mut stream,
            response.status,
            "application/json; charset=utf-8",
            &response.to_bytes(),
            false,
        );
    }

    let head_only = request.method == "HEAD";
    if request.method != "GET" && !head_only {
        return write_text(&mut stream, 405, head_only);
    }
    debug!(path = %decoded, "static request");

    match web_root {
        Some(root) => serve_file(&mut stream, root, &decoded, head_only),
        None => serve_embedded(&mut stream, &decoded, head_only),
    }
}

/// Paths without an extension fall back to the single page.
fn is_page_route(path: &str) -> bool {
    !Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .contains('.')
}

fn serve_embedded(stream: &mut TcpStream, path: &str, head_only: bool) -> Result<()> {
    if path == "/index.html" || is_page_route(path) {
        return write_http_response(
            stream,
            200,
            "text/html; charset=utf-8",
            INDEX_HTML.as_bytes(),
            head_only,
        );
    }
    write_text(stream, 404, head_only)
}

fn serve_file(stream: &mut TcpStream, root: &Path, path: &str, head_only: bool) -> Result<()> {
    let mut target = match file_under(root, path) {
        Some(path) => path,
        None => return write_text(stream, 400, head_only),
    };
    if target.is_dir() {
        target.push("index.html");
    }
    if !target.exists() && is_page_route(path) {
        let spa = root.join("index.html");
        if spa.exists() {
            target = spa;
        }
    }

    let mut file = match File::open(&target) {
        Ok(file) => file,
        Err(_) => return write_text(stream, 404, head_only),
    };
    let mut body = Vec::new();
    file.read_to_end(&mut body)
        .with_context(|| format!("failed reading {}", target.display()))?;
    write_http_response(stream, 200, content_type_for(&target), &body, head_only)
}

/// Binds, then accepts on a background thread. Each connection gets its own
/// thread.
pub fn start_server(config: &ServerConfig, ctx: Arc<AppContext>) -> Result<ServerHandle> {
    let web_root = match &config.web_root {
        Some(dir) => {
            let root = dir
                .canonicalize()
                .with_context(|| format!("failed resolving web root directory {}", dir.display()))?;
            if !root.is_dir() {
                return Err(anyhow!("web root '{}' is not a directory", root.display()));
            }
            Some(root)
        }
        None => None,
    };

    let listener = TcpListener::bind(config.addr.as_str())
        .with_context(|| format!("failed binding control server on {}", config.addr))?;
    listener
        .set_nonblocking(true)
        .context("failed setting listener nonblocking mode")?;
    let addr = listener
        .local_addr()
        .context("failed reading listener local address")?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let join_handle = thread::spawn(move || {
        loop {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    let web_root = web_root.clone();
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx, web_root.as_deref()) {
                            warn!(%peer, error = ?err, "request failed");
                        }
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(40));
                }
                Err(err) => {
                    warn!(error = %err, "listener failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });

    Ok(ServerHandle {
        url: format!("http://{addr}/"),
        addr,
        stop_tx,
        join_handle: Some(join_handle),
    })
}

fn browser_command(url: &str) -> Option<Command> {
    let (program, leading): (&str, &[&str]) = if cfg!(target_os = "macos") {
        ("open", &[])
    } else if cfg!(windows) {
        ("cmd", &["/C", "start", ""])
    } else if cfg!(unix) {
        ("xdg-open", &[])
    } else {
        return None;
    };
    let mut command = Command::new(program);
    command.args(leading).arg(url);
    Some(command)
}

pub fn open_url_in_default_browser(url: &str) -> Result<()> {
    let mut command =
        browser_command(url).ok_or_else(|| anyhow!("no browser launcher known for this platform"))?;
    let status = command
        .status()
        .with_context(|| format!("failed launching browser for {url}"))?;
    if !status.success() {
        return Err(anyhow!("browser command exited with status {status}"));
    }
    Ok(())
}
