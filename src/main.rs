use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiss::reactor::Interest;
use kiss::{ConfigStore, FastPath, FastRequest, Method, SocketReactor};
use once_cell::sync::OnceCell;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::{timeout, Duration};

const PORT: u16 = 8080;
const MAX_REQUEST_SIZE: usize = 8192;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const KEEPALIVE_TIMEOUT_SECS: u64 = 5;

const DEFAULT_CONFIG: &str = "\
ns_section ns/server/default/module/kiss
ns_param pageroot ./content
ns_param directoryfile index.html,index.htm
ns_param cachemaxentry 512
ns_param cachemaxsize 67108864
ns_param mmapminsize 16384
";

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static FASTPATH: OnceCell<Arc<FastPath>> = OnceCell::new();

fn load_config() -> ConfigStore {
    let path = std::env::var("KISS_CONFIG").unwrap_or_default();
    if !path.is_empty() {
        return ConfigStore::load(&path).unwrap_or_else(|e| {
            log::error!("config: {e}");
            std::process::abort();
        });
    }
    ConfigStore::parse(DEFAULT_CONFIG).expect("built-in default config must parse")
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = load_config();
    let fastpath = Arc::new(FastPath::new(&config, "default").unwrap_or_else(|e| {
        log::error!("fastpath: failed to initialize: {e}");
        std::process::abort();
    }));
    FASTPATH.set(fastpath).ok().expect("FastPath initialized exactly once");

    let reactor = SocketReactor::new();
    let (admin_keepalive, admin_watched) = std::os::unix::net::UnixStream::pair()
        .expect("failed to create admin self-pipe");
    reactor
        .register(
            admin_watched.as_raw_fd(),
            Interest::READ | Interest::EXIT,
            Box::new(|_fd, interest| {
                if interest.contains(Interest::EXIT) {
                    log::debug!("reactor: admin channel exit callback fired");
                } else {
                    log::debug!("reactor: admin channel readable");
                }
                true
            }),
        )
        .expect("reactor accepting registrations at startup");

    let listener = TcpListener::bind(format!("0.0.0.0:{PORT}"))
        .await
        .expect("failed to bind to address");

    log::info!("kiss server listening on http://0.0.0.0:{PORT}");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(handle_connection(stream));
                    }
                    Err(_) => continue,
                }
            }
            _ = shutdown_signal() => {
                log::info!("shutdown signal received, draining connections");
                SHUTDOWN.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    drop(admin_keepalive);
    reactor.begin_shutdown();
    reactor.await_shutdown();
    log::info!("server shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let connection_result = timeout(
        Duration::from_secs(CONNECTION_TIMEOUT_SECS),
        handle_connection_inner(&mut stream),
    )
    .await;

    if connection_result.is_err() {
        let resp = kiss::emitter::build_request_timeout();
        let _ = kiss::emitter::write_async(&resp, &mut stream).await;
        let _ = stream.flush().await;
    }
}

async fn handle_connection_inner(stream: &mut TcpStream) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut request_line = String::with_capacity(128);
    let mut header_buffer = Vec::with_capacity(256);

    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }

        let mut reader = BufReader::new(&mut *stream);
        request_line.clear();

        match timeout(Duration::from_secs(KEEPALIVE_TIMEOUT_SECS), reader.read_line(&mut request_line)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Err(_)) => break,
            Ok(Ok(size)) if size > MAX_REQUEST_SIZE => {
                let resp = kiss::emitter::build_request_too_large();
                kiss::emitter::write_async(&resp, stream).await?;
                break;
            }
            Ok(Ok(_)) => {}
        }

        if request_line.trim().is_empty() {
            continue;
        }

        let request_bytes = request_line.trim().as_bytes();
        let (method, raw_url, version) = match parse_request_line_fast(request_bytes) {
            Some(parts) => parts,
            None => {
                let resp = kiss::emitter::build_bad_request();
                kiss::emitter::write_async(&resp, stream).await?;
                break;
            }
        };

        let method = match method {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            _ => {
                let resp = kiss::emitter::build_method_not_allowed();
                kiss::emitter::write_async(&resp, stream).await?;
                break;
            }
        };

        let mut keep_alive = version == "HTTP/1.1";
        let mut if_modified_since: Option<Vec<u8>> = None;
        let mut if_range: Option<Vec<u8>> = None;
        let mut range_header: Option<Vec<u8>> = None;

        loop {
            header_buffer.clear();
            match read_line_bytes(&mut reader, &mut header_buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    if header_buffer.is_empty() || (header_buffer.len() == 2 && header_buffer == b"\r\n") {
                        break;
                    }
                    let line = trim_header_line(&header_buffer);
                    if line.is_empty() {
                        break;
                    }

                    if header_starts_with(line, b"connection:") {
                        let close_requested = header_contains(line, b"close");
                        keep_alive = !close_requested && (version == "HTTP/1.1" || header_contains(line, b"keep-alive"));
                    } else if header_starts_with(line, b"if-modified-since:") {
                        if let Some(value) = extract_header_value(line, b"if-modified-since:") {
                            if_modified_since = Some(value.to_vec());
                        }
                    } else if header_starts_with(line, b"if-range:") {
                        if let Some(value) = extract_header_value(line, b"if-range:") {
                            if_range = Some(value.to_vec());
                        }
                    } else if header_starts_with(line, b"range:") {
                        if let Some(value) = extract_header_value(line, b"range:") {
                            range_header = Some(value.to_vec());
                        }
                    }
                }
                Err(_) => break,
            }
        }

        match handle_request(stream, raw_url, method, if_modified_since.as_deref(), if_range.as_deref(), range_header.as_deref()).await {
            Ok(_) => {
                if !keep_alive {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    Ok(())
}

async fn handle_request(
    stream: &mut TcpStream,
    raw_url: &str,
    method: Method,
    if_modified_since: Option<&[u8]>,
    if_range: Option<&[u8]>,
    range_header: Option<&[u8]>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if raw_url == "/health" || raw_url == "/ready" {
        let resp = kiss::emitter::build_whole(
            &kiss::emitter::FileMeta {
                size: 2,
                mtime: httpdate::HttpDate::from(std::time::SystemTime::now()),
                content_type: "text/plain; charset=utf-8",
            },
            kiss::emitter::Source::Mapped(std::sync::Arc::from(b"ok".to_vec())),
            method == Method::Head,
        );
        kiss::emitter::write_async(&resp, stream).await?;
        return Ok(());
    }

    let fastpath = FASTPATH.get().expect("FastPath initialized before first request");

    let if_modified_since = if_modified_since
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| httpdate::parse_http_date(s).ok());
    let if_range_time = if_range
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| httpdate::parse_http_date(s).ok());
    let range_header_str = range_header.and_then(|b| std::str::from_utf8(b).ok());

    let req = FastRequest {
        method,
        raw_url,
        if_modified_since,
        if_range: if_range_time,
        range_header: range_header_str,
    };

    let response = fastpath.serve(&req);
    kiss::emitter::write_async(&response, stream).await?;
    Ok(())
}

fn header_starts_with(header_line: &[u8], prefix: &[u8]) -> bool {
    if header_line.len() < prefix.len() {
        return false;
    }
    for i in 0..prefix.len() {
        let h = header_line[i];
        let p = prefix[i];
        if h != p && h.to_ascii_lowercase() != p.to_ascii_lowercase() {
            return false;
        }
    }
    true
}

fn header_contains(header_line: &[u8], substring: &[u8]) -> bool {
    if substring.is_empty() {
        return true;
    }
    if header_line.len() < substring.len() {
        return false;
    }
    let first_char = substring[0].to_ascii_lowercase();
    let mut i = 0;
    while i <= header_line.len() - substring.len() {
        if header_line[i].to_ascii_lowercase() != first_char {
            i += 1;
            continue;
        }
        let mut matches = true;
        for j in 1..substring.len() {
            let h = header_line[i + j];
            let s = substring[j];
            if h != s && h.to_ascii_lowercase() != s.to_ascii_lowercase() {
                matches = false;
                break;
            }
        }
        if matches {
            return true;
        }
        i += 1;
    }
    false
}

async fn read_line_bytes(reader: &mut BufReader<&mut TcpStream>, buffer: &mut Vec<u8>) -> Result<usize, std::io::Error> {
    let mut total_bytes = 0;
    loop {
        let bytes_read = reader.read_until(b'\n', buffer).await?;
        total_bytes += bytes_read;
        if bytes_read == 0 || buffer.ends_with(b"\n") {
            break;
        }
    }
    Ok(total_bytes)
}

fn trim_header_line(line: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = line.len();
    while end > 0 {
        match line[end - 1] {
            b'\r' | b'\n' | b' ' | b'\t' => end -= 1,
            _ => break,
        }
    }
    while start < end {
        match line[start] {
            b' ' | b'\t' => start += 1,
            _ => break,
        }
    }
    &line[start..end]
}

fn extract_header_value<'a>(line: &'a [u8], header_name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= header_name.len() {
        return None;
    }
    let value_bytes = &line[header_name.len()..];
    let mut start = 0;
    while start < value_bytes.len() && (value_bytes[start] == b' ' || value_bytes[start] == b'\t') {
        start += 1;
    }
    if start >= value_bytes.len() {
        return None;
    }
    Some(&value_bytes[start..])
}

fn parse_request_line_fast(request: &[u8]) -> Option<(&[u8], &str, &str)> {
    let mut parts = request.split(|&b| b == b' ').filter(|part| !part.is_empty());

    let method = parts.next()?;
    let path_bytes = parts.next()?;
    let version_bytes = parts.next()?;

    if parts.next().is_some() {
        return None;
    }

    let path = std::str::from_utf8(path_bytes).ok()?;
    let version = std::str::from_utf8(version_bytes).ok()?;

    if method.is_empty() || path.is_empty() || version.is_empty() {
        return None;
    }

    Some((method, path, version))
}
