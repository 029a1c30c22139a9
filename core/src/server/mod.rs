//! Accept loop, per-connection orchestration, and shutdown
//! coordination.
//!
//! Shaped after the teacher's `Service::run_service` accept loop
//! (accept, match, spawn a handler per connection) and `Server`'s
//! signal-driven shutdown in `server::run_server`, generalized from a
//! single `println!`-and-return stub handler to the full per-
//! connection routine this proxy needs, and from a fire-and-forget
//! `tokio::spawn` to a wait-group that the shutdown path can actually
//! wait on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cache::{Cache, CacheEntry};
use crate::config::{ConcurrencyModel, ProxyConfig};
use crate::error::ProxyError;
use crate::filter::Filter;
use crate::forwarder;
use crate::logger::{Action, LogEntry, Logger};
use crate::parser::ParsedRequest;
use crate::pool::WorkerPool;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CLIENT_READ_DEADLINE: Duration = Duration::from_secs(30);

/// everything a connection handler needs, shared across every
/// accepted connection.
struct Shared {
    config: ProxyConfig,
    filter: Filter,
    logger: Logger,
    cache: Option<Cache>,
}

/// the proxy server: owns the listener and the shared subsystems, and
/// coordinates graceful shutdown across whichever dispatch mode is
/// configured.
pub struct Server {
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Server {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let filter = Filter::new();
        if let Some(path) = &config.blocked_domains_file {
            if let Err(e) = filter.load(path) {
                warn!(error = %e, path = %path.display(), "failed to load block list, continuing with an empty rule set");
            }
        }

        let logger = Logger::open(&config.log_file_path, config.log_max_size_mb)
            .map_err(ProxyError::BindFailed)?;

        let cache = if config.enable_caching {
            Some(Cache::new(config.cache_max_entries, config.cache_max_bytes))
        } else {
            None
        };

        Ok(Server {
            shared: Arc::new(Shared {
                config,
                filter,
                logger,
                cache,
            }),
            shutdown: Arc::new(Notify::new()),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        })
    }

    /// binds the listener and runs the accept loop until shutdown is
    /// requested or the listener errors in a non-timeout way.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.shared.config.listen_addr)
            .await
            .map_err(ProxyError::BindFailed)?;
        info!(addr = %self.shared.config.listen_addr, "proxy listening");

        let pool = match self.shared.config.concurrency_model {
            ConcurrencyModel::ThreadPool => Some(WorkerPool::start(self.shared.config.thread_pool_size)),
            ConcurrencyModel::ThreadPerConnection => None,
        };

        let result = self.accept_loop(&listener, pool.as_ref()).await;

        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        self.wait_for_in_flight().await;
        self.shared.logger.close();

        result
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        pool: Option<&WorkerPool>,
    ) -> Result<(), ProxyError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }

            let accepted = timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await;
            let (conn, addr) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(ProxyError::BindFailed(e)),
                Err(_) => continue,
            };

            self.dispatch(conn, addr, pool);
        }
    }

    fn dispatch(&self, conn: TcpStream, addr: SocketAddr, pool: Option<&WorkerPool>) {
        match pool {
            Some(pool) => {
                let shared = self.shared.clone();
                let submitted = pool.submit(conn, move |conn| async move {
                    handle_connection(shared, conn, addr).await;
                });
                if !submitted {
                    // queue_full: silent drop, connection closed, no log.
                }
            }
            None => {
                let shared = self.shared.clone();
                let in_flight = self.in_flight.clone();
                let idle = self.idle.clone();
                in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    handle_connection(shared, conn, addr).await;
                    if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        idle.notify_waiters();
                    }
                });
            }
        }
    }

    async fn wait_for_in_flight(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.idle.notified().await;
        }
    }

    /// idempotent: signals the accept loop to stop on its next poll.
    /// The caller's `run()` then drains the worker pool (if any) and
    /// waits for in-flight thread-per-connection tasks before closing
    /// the logger.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, mut conn: TcpStream, client_addr: SocketAddr) {
    let _ = conn.set_nodelay(true);

    let outcome = timeout(CLIENT_READ_DEADLINE, read_request(&mut conn)).await;
    let request = match outcome {
        Ok(Ok(req)) => req,
        Ok(Err(e)) => {
            respond_error(&mut conn, &e).await;
            log_parse_or_io_error(&shared, client_addr, &e);
            return;
        }
        Err(_) => {
            log_timeout(&shared, client_addr);
            return;
        }
    };

    if !shared.config.authentication_token.is_empty() {
        let provided = request.header("proxy-authorization").unwrap_or("");
        if provided != shared.config.authentication_token {
            send_status(&mut conn, 407, "Proxy Authentication Required").await;
            log_entry(
                &shared,
                client_addr,
                &request,
                Action::AuthFailed,
                0,
                0,
                0,
                None,
            );
            return;
        }
    }

    if request.is_connect {
        handle_connect_request(&shared, conn, client_addr, request).await;
        return;
    }

    let (blocked, rule) = shared.filter.is_blocked(&request.dest_host);
    if blocked {
        send_status(&mut conn, 403, "Forbidden").await;
        log_entry(&shared, client_addr, &request, Action::Blocked, 0, 0, 0, rule);
        return;
    }

    if let Some(cache) = &shared.cache {
        let key = Cache::make_key(&request.method, &request.target);
        if !key.is_empty() {
            if let Some(entry) = cache.get(&key) {
                serve_cached(&mut conn, &entry).await;
                log_entry(
                    &shared,
                    client_addr,
                    &request,
                    Action::CacheHit,
                    entry.status,
                    0,
                    entry.body.len() as u64,
                    None,
                );
                return;
            }
        }
    }

    let want_buffer = shared.cache.is_some() && request.method.eq_ignore_ascii_case("GET");
    match forwarder::forward_request(&request, &mut conn, want_buffer).await {
        Ok(outcome) => {
            if let (Some(cache), Some(buffered)) = (&shared.cache, outcome.buffered) {
                if Cache::is_cacheable(&request.method, buffered.status) {
                    let key = Cache::make_key(&request.method, &request.target);
                    if !key.is_empty() {
                        cache.put(
                            key,
                            CacheEntry::new(buffered.status, buffered.headers, buffered.body),
                        );
                    }
                }
            }
            log_entry(
                &shared,
                client_addr,
                &request,
                Action::Allowed,
                outcome.status,
                outcome.bytes_upstream,
                outcome.bytes_downstream,
                None,
            );
        }
        Err(e) => {
            send_status(&mut conn, 502, "Bad Gateway").await;
            log_entry(&shared, client_addr, &request, Action::Error, 502, 0, 0, None);
            warn!(error = %e, "forward_request failed");
        }
    }
}

async fn handle_connect_request(
    shared: &Arc<Shared>,
    mut conn: TcpStream,
    client_addr: SocketAddr,
    request: ParsedRequest,
) {
    if !shared.config.enable_connect_tunneling {
        send_status(&mut conn, 501, "Not Implemented").await;
        log_entry(
            shared,
            client_addr,
            &request,
            Action::Blocked,
            0,
            0,
            0,
            Some("CONNECT not enabled".to_string()),
        );
        return;
    }

    let (blocked, rule) = shared.filter.is_blocked(&request.dest_host);
    if blocked {
        send_status(&mut conn, 403, "Forbidden").await;
        log_entry(shared, client_addr, &request, Action::Blocked, 0, 0, 0, rule);
        return;
    }

    match forwarder::handle_connect(&request.dest_host, request.dest_port, &mut conn).await {
        Ok(()) => {
            log_entry(shared, client_addr, &request, Action::Allowed, 200, 0, 0, None);
        }
        Err(e) => {
            log_entry(shared, client_addr, &request, Action::Error, 0, 0, 0, None);
            warn!(error = %e, "CONNECT failed");
        }
    }
}

async fn read_request(conn: &mut TcpStream) -> Result<ParsedRequest, ProxyError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if has_complete_head(&buf) {
            break;
        }
        let n = conn
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::ParseError(format!("read error: {e}")))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let content_length = extract_content_length(&buf);
    if let Some(needed) = content_length {
        let head_len = head_length(&buf);
        while buf.len() < head_len + needed {
            let n = conn
                .read(&mut chunk)
                .await
                .map_err(|e| ProxyError::ParseError(format!("read error: {e}")))?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    let mut cursor = std::io::Cursor::new(buf);
    ParsedRequest::parse(&mut cursor)
}

fn has_complete_head(buf: &[u8]) -> bool {
    find_connect_line_end(buf).is_some() || buf.windows(4).any(|w| w == b"\r\n\r\n")
}

fn find_connect_line_end(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"CONNECT ") {
        buf.windows(2).position(|w| w == b"\r\n")
    } else {
        None
    }
}

fn head_length(buf: &[u8]) -> usize {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(buf.len())
}

fn extract_content_length(buf: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(buf);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

async fn respond_error(conn: &mut TcpStream, error: &ProxyError) {
    let (status, reason) = error.response();
    send_status(conn, status, reason).await;
}

async fn send_status(conn: &mut TcpStream, status: u16, reason: &str) {
    let body = format!("{status} {reason}");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = conn.write_all(response.as_bytes()).await;
}

async fn serve_cached(conn: &mut TcpStream, entry: &CacheEntry) {
    let mut head = format!("HTTP/1.1 {} OK\r\n", entry.status);
    for (name, value) in entry.headers.iter() {
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name.as_str(), value));
        }
    }
    head.push_str("\r\n");
    let _ = conn.write_all(head.as_bytes()).await;
    let _ = conn.write_all(&entry.body).await;
}

#[allow(clippy::too_many_arguments)]
fn log_entry(
    shared: &Arc<Shared>,
    client_addr: SocketAddr,
    request: &ParsedRequest,
    action: Action,
    status: u16,
    bytes_upstream: u64,
    bytes_downstream: u64,
    blocked_rule: Option<String>,
) {
    shared.logger.log(LogEntry {
        client_addr,
        dest_host: request.dest_host.clone(),
        dest_port: request.dest_port,
        method: request.method.clone(),
        target: request.target.clone(),
        action,
        status,
        bytes_upstream,
        bytes_downstream,
        blocked_rule,
    });
}

fn log_parse_or_io_error(shared: &Arc<Shared>, client_addr: SocketAddr, error: &ProxyError) {
    shared.logger.log(LogEntry {
        client_addr,
        dest_host: String::new(),
        dest_port: 0,
        method: String::new(),
        target: String::new(),
        action: Action::Error,
        status: error.response().0,
        bytes_upstream: 0,
        bytes_downstream: 0,
        blocked_rule: None,
    });
}

fn log_timeout(shared: &Arc<Shared>, client_addr: SocketAddr) {
    shared.logger.log(LogEntry {
        client_addr,
        dest_host: String::new(),
        dest_port: 0,
        method: String::new(),
        target: String::new(),
        action: Action::Error,
        status: 0,
        bytes_upstream: 0,
        bytes_downstream: 0,
        blocked_rule: None,
    });
}
