//! Shared helpers for integration tests: in-process upstream servers and a
//! minimal raw HTTP client.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use nodeswitch::pool::ConnectionPool;
use nodeswitch::registry::{LifecycleSettings, NodeRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An upstream HTTP server running inside the test process.
///
/// Routes:
/// - `/health`: 200 `ok`
/// - `/status/{code}`: responds with `code`
/// - `/slow/{ms}`: sleeps, then answers like any other path
/// - anything else: 200 with body `{tag}:{uri}`, an `x-upstream: {tag}` header
///   and two `x-multi` headers
pub struct Upstream {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Upstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_upstream(tag: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req| upstream_response(tag, req));
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream { addr, task }
}

async fn upstream_response(
    tag: &'static str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    if path == "/health" {
        return Ok(Response::new(Full::new(Bytes::from("ok"))));
    }

    if let Some(code) = path.strip_prefix("/status/") {
        let status = code
            .parse::<u16>()
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::BAD_REQUEST);
        let mut response = Response::new(Full::new(Bytes::from(format!("{}:{}", tag, path))));
        *response.status_mut() = status;
        return Ok(response);
    }

    if let Some(ms) = path.strip_prefix("/slow/") {
        let ms: u64 = ms.parse().unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let response = Response::builder()
        .header("x-upstream", tag)
        .header("x-multi", "first")
        .header("x-multi", "second")
        .body(Full::new(Bytes::from(format!("{}:{}", tag, req.uri()))))
        .unwrap();
    Ok(response)
}

/// Registry with a short shutdown deadline, suitable for tests
pub fn test_registry(shutdown_deadline: Duration) -> Arc<NodeRegistry> {
    NodeRegistry::new(
        Arc::new(ConnectionPool::default()),
        LifecycleSettings {
            shutdown_deadline,
            ..Default::default()
        },
    )
}

/// A port nothing listens on right now
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn local_host(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(local_host(port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait for a port to stop accepting connections
pub async fn wait_for_closed(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(local_host(port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A parsed HTTP/1.1 response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    fn parse(head: &str, body: String) -> Result<Self, BoxError> {
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .ok_or("malformed status line")?;

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Send an HTTP request on a fresh connection and read the whole response
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> Result<HttpResponse, BoxError> {
    let mut stream = TcpStream::connect(local_host(port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;

    let (head, body) = raw.split_once("\r\n\r\n").ok_or("incomplete response")?;
    HttpResponse::parse(head, body.to_string())
}

/// Send a simple HTTP GET request and get the response
pub async fn http_get(port: u16, path: &str) -> Result<HttpResponse, BoxError> {
    http_request(port, "GET", path, None, None).await
}

/// Send a GET on an existing keep-alive connection and read exactly one response
pub async fn keep_alive_get(stream: &mut TcpStream, path: &str) -> Result<HttpResponse, BoxError> {
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("connection closed before response head".into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec())?;
    let mut response = HttpResponse::parse(&head, String::new())?;
    let length: usize = response
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .ok_or("response without content-length")?;

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("connection closed before response body".into());
        }
        body.extend_from_slice(&chunk[..n]);
    }
    response.body = String::from_utf8(body)?;
    Ok(response)
}
