//! Shared fixtures for gateway integration tests: a scriptable mock origin,
//! a gateway on an ephemeral port, and a bare HTTP/1.1 client.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use portico::body::{Body, full};
use portico::{Gateway, GatewayConfig, Origin, Server};

// ============================================================================
// Mock origin
// ============================================================================

/// What a mock origin saw of one request.
#[derive(Clone, Debug)]
pub struct Seen {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type Reply = Pin<Box<dyn Future<Output = Response<Body>> + Send>>;
type Handler = Arc<dyn Fn(usize, &Seen) -> Reply + Send + Sync>;

pub struct MockOrigin {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
    task: JoinHandle<()>,
}

impl MockOrigin {
    /// Starts an origin that answers every request with `handler(n, seen)`,
    /// where `n` counts requests from zero.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &Seen) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let task = {
            let (calls, connections, seen) = (Arc::clone(&calls), Arc::clone(&connections), Arc::clone(&seen));
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else { return };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (calls, seen, handler) = (Arc::clone(&calls), Arc::clone(&seen), Arc::clone(&handler));
                    tokio::spawn(async move {
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let (calls, seen, handler) = (Arc::clone(&calls), Arc::clone(&seen), Arc::clone(&handler));
                            async move {
                                let (parts, body) = req.into_parts();
                                let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                                let request = Seen {
                                    method: parts.method,
                                    uri: parts.uri.to_string(),
                                    headers: parts.headers,
                                    body,
                                };
                                let n = calls.fetch_add(1, Ordering::SeqCst);
                                let reply = handler(n, &request);
                                seen.lock().unwrap().push(request);
                                Ok::<_, Infallible>(reply.await)
                            }
                        });
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), svc)
                            .await;
                    });
                }
            })
        };

        Self { addr, calls, connections, seen, task }
    }

    /// An origin that answers `200` with `body` and `content_type`.
    pub async fn fixed(content_type: &'static str, body: &'static str) -> Self {
        Self::start(move |_, _| reply(StatusCode::OK, &[("content-type", content_type)], body)).await
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    pub fn connections(&self) -> usize { self.connections.load(Ordering::SeqCst) }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A ready reply with a full body.
pub fn reply(status: StatusCode, headers: &[(&'static str, &'static str)], body: &'static str) -> Reply {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    for (name, value) in headers {
        response.headers_mut().append(*name, http::HeaderValue::from_static(value));
    }
    Box::pin(async move { response })
}

/// A body fed chunk by chunk from the returned sender; ends when the sender
/// is dropped.
pub fn channel_body() -> (mpsc::Sender<Bytes>, Body) {
    let (tx, rx) = mpsc::channel(4);
    (tx, ChannelBody(rx).map_err(|never| match never {}).boxed_unsync())
}

struct ChannelBody(mpsc::Receiver<Bytes>);

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.0.poll_recv(cx).map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

/// An address nothing listens on.
pub fn dead_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

// ============================================================================
// Gateway
// ============================================================================

/// Default configuration pointed at the given API and SPA origins.
pub fn config(api: SocketAddr, spa: SocketAddr) -> GatewayConfig {
    GatewayConfig {
        origins: vec![
            Origin::parse("api", &format!("http://{api}")).unwrap(),
            Origin::parse("spa", &format!("http://{spa}")).unwrap(),
        ],
        upstream_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    task: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(config: GatewayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway = Arc::new(Gateway::new(config));
        let server = Server::from_listener(listener);
        let task = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let _ = server.serve_with_shutdown(gateway, std::future::pending()).await;
            })
        };
        Self { addr, gateway, task }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Fetched {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// Sends one request on a fresh connection and returns the response head.
pub async fn send(addr: SocketAddr, req: Request<Full<Bytes>>) -> Response<Incoming> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);
    sender.send_request(req).await.unwrap()
}

/// Sends one request and reads the whole response.
pub async fn fetch(addr: SocketAddr, req: Request<Full<Bytes>>) -> Fetched {
    let response = send(addr, req).await;
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Fetched { status: parts.status, headers: parts.headers, body }
}

pub fn get(path: &str) -> http::request::Builder {
    Request::builder().method(Method::GET).uri(path).header("host", "gateway.test")
}

pub async fn fetch_get(addr: SocketAddr, path: &str) -> Fetched {
    fetch(addr, get(path).body(Full::default()).unwrap()).await
}
