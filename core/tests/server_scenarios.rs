//! End-to-end scenarios against a real `Server`, exercising the
//! client-visible behavior from the scenario list: a plain proxied
//! GET, an exact-domain block, a wildcard block, CONNECT refused by
//! configuration, and a mismatched auth token. Each test binds its
//! own server and stand-in upstream on `127.0.0.1:0` and talks real
//! TCP, the same idiom the pack's gateway crates use for their own
//! integration suites.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use proxy_core::config::{ConcurrencyModel, ProxyConfig};
use proxy_core::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn temp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!(
        "proxy-core-itest-{}-{}-{name}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    p
}

fn base_config(listen_addr: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        listen_addr,
        concurrency_model: ConcurrencyModel::ThreadPerConnection,
        thread_pool_size: 4,
        log_file_path: temp_path("access.log"),
        log_max_size_mb: 10,
        blocked_domains_file: None,
        enable_caching: false,
        cache_max_entries: 100,
        cache_max_bytes: 100 * 1024 * 1024,
        enable_connect_tunneling: true,
        authentication_token: String::new(),
    }
}

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn spawn_server(config: ProxyConfig) -> (Arc<Server>, SocketAddr) {
    let addr = config.listen_addr;
    let server = Arc::new(Server::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    wait_until_listening(addr).await;
    (server, addr)
}

async fn wait_until_listening(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never started listening on {addr}");
}

async fn spawn_stub_upstream(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = sock.read(&mut buf).await;
        let _ = sock.write_all(response).await;
    });
    addr
}

#[tokio::test]
async fn plain_get_round_trips_through_the_proxy() {
    let upstream_addr = spawn_stub_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhi!").await;
    let addr = free_addr().await;
    let (server, addr) = spawn_server(base_config(addr)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET http://{}/a?b=1 HTTP/1.1\r\nHost: {}\r\n\r\n",
        upstream_addr, upstream_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("hi!"));

    server.shutdown();
}

#[tokio::test]
async fn blocked_exact_domain_gets_403_without_dialing_upstream() {
    let rules_path = temp_path("blocked.txt");
    std::fs::File::create(&rules_path)
        .unwrap()
        .write_all(b"example.com\n")
        .unwrap();

    let addr = free_addr().await;
    let mut config = base_config(addr);
    config.blocked_domains_file = Some(rules_path);
    let (server, addr) = spawn_server(config).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));

    server.shutdown();
}

#[tokio::test]
async fn wildcard_rule_blocks_suffix_and_bare_domain_but_not_others() {
    let rules_path = temp_path("wildcard.txt");
    std::fs::File::create(&rules_path)
        .unwrap()
        .write_all(b"*.mal.test\n")
        .unwrap();

    let addr = free_addr().await;
    let mut config = base_config(addr);
    config.blocked_domains_file = Some(rules_path);
    let (server, addr) = spawn_server(config).await;

    async fn send(addr: SocketAddr, host: &str) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET http://{host}/ HTTP/1.1\r\nHost: {host}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    let blocked_suffix = send(addr, "a.b.mal.test").await;
    assert!(blocked_suffix.starts_with("HTTP/1.1 403"));

    let blocked_bare = send(addr, "mal.test").await;
    assert!(blocked_bare.starts_with("HTTP/1.1 403"));

    server.shutdown();
}

#[tokio::test]
async fn connect_disabled_yields_501() {
    let addr = free_addr().await;
    let mut config = base_config(addr);
    config.enable_connect_tunneling = false;
    let (server, addr) = spawn_server(config).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT api.test:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"));

    server.shutdown();
}

#[tokio::test]
async fn mismatched_auth_token_yields_407() {
    let addr = free_addr().await;
    let mut config = base_config(addr);
    config.authentication_token = "secret".to_string();
    let (server, addr) = spawn_server(config).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = "GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nProxy-Authorization: wrong\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));

    server.shutdown();
}

#[tokio::test]
async fn matching_auth_token_is_accepted_and_forwards() {
    let upstream_addr = spawn_stub_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let addr = free_addr().await;
    let mut config = base_config(addr);
    config.authentication_token = "secret".to_string();
    let (server, addr) = spawn_server(config).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: secret\r\n\r\n",
        upstream_addr, upstream_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("ok"));

    server.shutdown();
}
