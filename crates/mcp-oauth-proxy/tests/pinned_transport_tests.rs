//! Tests for the `reqwest` transport behind `SsrfGuard`.
//!
//! The guard resolves a hostname once and the transport must connect to that
//! address and nothing else. An HTTP proxy taken from the environment would
//! resolve the hostname a second time, so the environment check re-runs the
//! pinned fetch in a child process with the proxy variables pointing at a
//! decoy listener.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use mcp_oauth_proxy::ssrf::{ReqwestTransport, Resolver, SsrfGuard, SsrfPolicy};

const PINNED_HOST: &str = "pinned.example";

/// Answers every lookup with the same address.
#[derive(Debug)]
struct FixedResolver(IpAddr);

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }
}

#[tokio::test]
async fn test_fetch_reaches_pinned_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 6\r\nconnection: close\r\n\r\npinned")
            .await
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase()
    });

    let guard = SsrfGuard::with_parts(
        SsrfPolicy::for_testing(),
        Arc::new(FixedResolver(IpAddr::V4(Ipv4Addr::LOCALHOST))),
        Arc::new(ReqwestTransport::default()),
    );
    let body = guard
        .ssrf_safe_fetch(&format!("http://{PINNED_HOST}:{port}/x"), 100)
        .await
        .unwrap();
    assert_eq!(&body[..], b"pinned");

    let request = server.await.unwrap();
    assert!(request.starts_with("get /x http/1.1"), "{request}");
    assert!(request.contains(&format!("host: {PINNED_HOST}:{port}")), "{request}");
}

#[test]
fn test_env_proxy_does_not_intercept_pinned_fetch() {
    let decoy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    decoy.set_nonblocking(true).unwrap();
    let proxy_url = format!("http://{}", decoy.local_addr().unwrap());

    let output = Command::new(std::env::current_exe().unwrap())
        .args(["test_fetch_reaches_pinned_listener", "--exact", "--test-threads=1"])
        .env("HTTP_PROXY", &proxy_url)
        .env("http_proxy", &proxy_url)
        .env("ALL_PROXY", &proxy_url)
        .env("all_proxy", &proxy_url)
        .env_remove("NO_PROXY")
        .env_remove("no_proxy")
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}\n{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("1 passed"), "{stdout}");

    let err = decoy.accept().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
}
