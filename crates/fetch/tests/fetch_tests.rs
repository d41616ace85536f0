//! End-to-end download behavior against local HTTP servers.
//!
//! The guard refuses loopback, so the tests give the mock server a public
//! looking hostname: the guard's resolver maps it to a documentation address
//! while the HTTP client is pinned to the mock's real socket.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fetch::{DownloadPolicy, FetchError, SafeFetcher};
use guard::{GuardConfig, Resolver, StaticResolver, UrlGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOST: &str = "docs.example";

fn fetcher_for(addr: SocketAddr, policy: DownloadPolicy) -> SafeFetcher {
    let resolver = StaticResolver::new().with_host(HOST, ["93.184.216.34".parse().unwrap()]);
    let guard = UrlGuard::new(&GuardConfig::default()).with_resolver(Arc::new(resolver));
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .resolve(HOST, addr)
        .build()
        .unwrap();
    SafeFetcher::with_client(client, guard, policy)
}

fn url(addr: SocketAddr, p: &str) -> String {
    format!("http://{HOST}:{}{p}", addr.port())
}

#[tokio::test]
async fn markdown_returned_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc.md"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("# Hello", "text/markdown"))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(*server.address(), DownloadPolicy::default());
    let text = fetcher.fetch(&url(*server.address(), "/doc.md")).await.unwrap();
    assert_eq!(text, "# Hello");
}

#[tokio::test]
async fn pdf_disguised_as_text_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fake.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(&b"%PDF-1.4 binary stuff"[..], "text/plain"),
        )
        .mount(&server)
        .await;

    let fetcher = fetcher_for(*server.address(), DownloadPolicy::default());
    let err = fetcher.fetch(&url(*server.address(), "/fake.txt")).await.unwrap_err();
    assert_eq!(err, FetchError::BinaryContent("PDF"));
}

#[tokio::test]
async fn disallowed_content_type_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(*server.address(), DownloadPolicy::default());
    let err = fetcher.fetch(&url(*server.address(), "/data.json")).await.unwrap_err();
    assert!(matches!(err, FetchError::UnsupportedContentType(ref t) if t == "application/json"));
}

#[tokio::test]
async fn declared_length_over_limit_rejected_up_front() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![b'a'; 5000], "text/plain"))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(*server.address(), DownloadPolicy::default().with_max_bytes(100));
    let err = fetcher.fetch(&url(*server.address(), "/big.txt")).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::ContentLengthExceeded {
            declared: 5000,
            limit: 100
        }
    );
}

#[tokio::test]
async fn redirect_to_metadata_service_is_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/latest/meta-data"),
        )
        .mount(&server)
        .await;

    let fetcher = fetcher_for(*server.address(), DownloadPolicy::default());
    let err = fetcher.fetch(&url(*server.address(), "/start")).await.unwrap_err();
    assert!(matches!(err, FetchError::RedirectBlocked { .. }));
    assert!(err.to_string().contains("blocked by SSRF"));
}

#[tokio::test]
async fn relative_redirect_followed_and_revalidated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old.md"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new.md"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new.md"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("moved", "text/plain; charset=utf-8"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(*server.address(), DownloadPolicy::default());
    let text = fetcher.fetch(&url(*server.address(), "/old.md")).await.unwrap();
    assert_eq!(text, "moved");
}

#[tokio::test]
async fn redirect_budget_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(
        *server.address(),
        DownloadPolicy::default().with_max_redirects(2),
    );
    let err = fetcher.fetch(&url(*server.address(), "/loop")).await.unwrap_err();
    assert_eq!(err, FetchError::TooManyRedirects(2));
}

#[tokio::test]
async fn blocked_initial_url_never_requested() {
    let fetcher = fetcher_for("127.0.0.1:9".parse().unwrap(), DownloadPolicy::default());
    let err = fetcher.fetch("http://10.1.2.3/doc.txt").await.unwrap_err();
    assert!(err.is_blocked());
}

/// Serves one chunked response with no Content-Length header.
async fn chunked_server(chunks: Vec<&'static [u8]>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut req = [0u8; 1024];
        let _ = socket.read(&mut req).await;
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        for chunk in chunks {
            let frame = format!("{:x}\r\n", chunk.len());
            if socket.write_all(frame.as_bytes()).await.is_err() {
                return;
            }
            if socket.write_all(chunk).await.is_err() {
                return;
            }
            if socket.write_all(b"\r\n").await.is_err() {
                return;
            }
            let _ = socket.flush().await;
        }
        let _ = socket.write_all(b"0\r\n\r\n").await;
    });
    addr
}

#[tokio::test]
async fn streamed_body_aborts_once_limit_crossed() {
    let addr = chunked_server(vec![b"12345678", b"12345678", b"12345678"]).await;
    let fetcher = fetcher_for(addr, DownloadPolicy::default().with_max_bytes(10));
    let err = fetcher.fetch(&url(addr, "/stream.txt")).await.unwrap_err();
    assert_eq!(err, FetchError::SizeExceeded { limit: 10 });
    assert!(err.to_string().contains("exceeded"));
}

#[tokio::test]
async fn streamed_body_within_limit_accepted() {
    let addr = chunked_server(vec![b"line one\n", b"line two\n"]).await;
    let fetcher = fetcher_for(addr, DownloadPolicy::default());
    let text = fetcher.fetch(&url(addr, "/stream.txt")).await.unwrap();
    assert_eq!(text, "line one\nline two\n");
}

/// Public on the first lookup, loopback afterwards.
#[derive(Default)]
struct Rebinding {
    calls: AtomicUsize,
}

#[async_trait]
impl Resolver for Rebinding {
    async fn lookup(&self, _host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        let addr = match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => "93.184.216.34",
            _ => "127.0.0.1",
        };
        Ok(vec![addr.parse().unwrap()])
    }
}

#[tokio::test]
async fn rebinding_to_loopback_never_reaches_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("secret", "text/plain"))
        .expect(0)
        .mount(&server)
        .await;

    let guard = UrlGuard::new(&GuardConfig::default()).with_resolver(Arc::new(Rebinding::default()));
    let fetcher = SafeFetcher::new(guard, DownloadPolicy::default()).unwrap();
    let err = fetcher
        .fetch(&format!("http://rebind.example:{}/doc.txt", server.address().port()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)), "{err:?}");
}
