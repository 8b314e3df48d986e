use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::{HeaderMap, Method, Request, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::dns::{GaiAddrs, GaiResolver, Name};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower::Service;

use crate::stats::{Metrics, RequestRecord, RequestSnapshot, ResponseSnapshot};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

tokio::task_local! {
    static STAMPS: PhaseStamps;
}

/// Per-request timing stamps, shared between the connector stack and the
/// request driver through a task-local scope. Concurrent requests each carry
/// their own instance; connector activity outside a scope is a no-op.
#[derive(Clone, Default)]
struct PhaseStamps {
    slots: Arc<Mutex<StampSlots>>,
}

#[derive(Clone, Copy, Default)]
struct StampSlots {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    sent: Option<Instant>,
    first_byte: Option<Instant>,
}

impl PhaseStamps {
    fn mark(&self, update: impl FnOnce(&mut StampSlots)) {
        update(&mut self.slots.lock());
    }

    fn snapshot(&self) -> StampSlots {
        *self.slots.lock()
    }
}

fn stamp(update: impl FnOnce(&mut StampSlots)) {
    let _ = STAMPS.try_with(|stamps| stamps.mark(update));
}

/// DNS resolver wrapper that stamps lookup boundaries.
#[derive(Clone)]
struct MeasuredResolver {
    inner: GaiResolver,
}

impl MeasuredResolver {
    fn new() -> Self {
        Self {
            inner: GaiResolver::new(),
        }
    }
}

impl Service<Name> for MeasuredResolver {
    type Response = GaiAddrs;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<GaiAddrs, std::io::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        stamp(|s| s.dns_start = Some(Instant::now()));
        let fut = self.inner.call(name);
        Box::pin(async move {
            let addrs = fut.await;
            stamp(|s| s.dns_done = Some(Instant::now()));
            addrs
        })
    }
}

/// TCP connector wrapper: stamps connect boundaries, marks the TLS start for
/// https targets, and tunnels through an environment-configured proxy.
#[derive(Clone)]
struct MeasuredConnector {
    inner: HttpConnector<MeasuredResolver>,
    proxies: ProxySelector,
}

impl Service<Uri> for MeasuredConnector {
    type Response = TokioIo<TcpStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut inner = self.inner.clone();
        let proxies = self.proxies.clone();
        Box::pin(async move {
            let entered = Instant::now();
            let https = uri.scheme_str() == Some("https");

            let io = match proxies.proxy_for(&uri) {
                Some(proxy) => {
                    let io = inner.call(proxy).await.map_err(BoxError::from)?;
                    connect_tunnel(io, &uri).await?
                }
                None => inner.call(uri).await.map_err(BoxError::from)?,
            };

            let now = Instant::now();
            stamp(|s| {
                // DNS time is not part of the connect phase.
                s.connect_start = Some(s.dns_done.unwrap_or(entered));
                s.connect_done = Some(now);
                if https {
                    s.tls_start = Some(now);
                }
            });
            Ok(io)
        })
    }
}

/// Establish a CONNECT tunnel to `target` over an open proxy connection.
async fn connect_tunnel(
    io: TokioIo<TcpStream>,
    target: &Uri,
) -> Result<TokioIo<TcpStream>, BoxError> {
    let host = target.host().ok_or("request URI has no host")?;
    let port = target
        .port_u16()
        .unwrap_or(if target.scheme_str() == Some("https") { 443 } else { 80 });

    let mut stream = io.into_inner();
    stream
        .write_all(
            format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n").as_bytes(),
        )
        .await?;

    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("proxy closed the connection during CONNECT".into());
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > 8192 {
            return Err("oversized CONNECT response from proxy".into());
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status = head.split_whitespace().nth(1).unwrap_or("");
    if !status.starts_with('2') {
        let line = head.lines().next().unwrap_or_default();
        return Err(format!("proxy refused CONNECT: {line}").into());
    }
    Ok(TokioIo::new(stream))
}

/// Proxy configuration from the standard environment variables.
#[derive(Clone, Debug, Default)]
struct ProxySelector {
    http: Option<Uri>,
    https: Option<Uri>,
    no_proxy: Vec<String>,
    bypass_all: bool,
}

impl ProxySelector {
    fn from_env() -> Self {
        let var = |upper: &str, lower: &str| {
            std::env::var(upper)
                .or_else(|_| std::env::var(lower))
                .ok()
                .filter(|v| !v.is_empty())
        };

        let no_proxy_raw = var("NO_PROXY", "no_proxy").unwrap_or_default();
        Self {
            http: var("HTTP_PROXY", "http_proxy").and_then(|v| v.parse().ok()),
            https: var("HTTPS_PROXY", "https_proxy").and_then(|v| v.parse().ok()),
            no_proxy: parse_no_proxy(&no_proxy_raw),
            bypass_all: no_proxy_raw.trim() == "*",
        }
    }

    fn proxy_for(&self, uri: &Uri) -> Option<Uri> {
        let proxy = match uri.scheme_str() {
            Some("https") => self.https.as_ref(),
            _ => self.http.as_ref(),
        }?;
        let host = uri.host()?.to_ascii_lowercase();
        if self.bypasses(&host) {
            return None;
        }
        Some(proxy.clone())
    }

    fn bypasses(&self, host: &str) -> bool {
        self.bypass_all
            || self
                .no_proxy
                .iter()
                .any(|entry| host == entry || host.ends_with(&format!(".{entry}")))
    }
}

fn parse_no_proxy(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|entry| !entry.is_empty() && entry != "*")
        .collect()
}

#[derive(Clone)]
struct TimedTlsConnector {
    inner: HttpsConnector<MeasuredConnector>,
}

impl Service<Uri> for TimedTlsConnector {
    type Response = <HttpsConnector<MeasuredConnector> as Service<Uri>>::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut inner = self.inner.clone();
        let https = uri.scheme_str() == Some("https");
        Box::pin(async move {
            // The handshake is not separately observable from out here, so
            // its budget rides on top of the dial allowance.
            let io = tokio::time::timeout(DIAL_TIMEOUT + TLS_HANDSHAKE_TIMEOUT, inner.call(uri))
                .await
                .map_err(|_| BoxError::from("connection handshake timed out"))??;
            if https {
                stamp(|s| s.tls_done = Some(Instant::now()));
            }
            Ok(io)
        })
    }
}

/// Connection-pooled client whose connector stack records per-phase timings.
/// Every transaction that reaches the transport is appended to the
/// aggregator handed in at construction, errors included.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<TimedTlsConnector, Full<Bytes>>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        Self::with_capacity(metrics, 0)
    }

    /// `peak_users` raises the per-host idle pool when a test runs more
    /// concurrent users than the default cap.
    pub fn with_capacity(metrics: Arc<Metrics>, peak_users: usize) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new_with_resolver(MeasuredResolver::new());
        http.enforce_http(false);
        http.set_connect_timeout(Some(DIAL_TIMEOUT));
        http.set_keepalive(Some(TCP_KEEPALIVE));
        http.set_nodelay(true);

        let connector = MeasuredConnector {
            inner: http,
            proxies: ProxySelector::from_env(),
        };

        let tls = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(IDLE_PER_HOST.max(peak_users))
            .build(TimedTlsConnector { inner: tls });

        Ok(Self {
            client,
            metrics,
            timeout: REQUEST_TIMEOUT,
        })
    }

    /// Perform one request and record it. The returned snapshot owns its
    /// body; the wire stream was fully drained for connection reuse.
    pub async fn request(
        &self,
        method: Method,
        url: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ResponseSnapshot, String> {
        let snapshot = RequestSnapshot {
            method: method.to_string(),
            url: url.to_string(),
            proto: "HTTP/1.1".to_string(),
            headers: headers.clone(),
            body: body.clone(),
        };

        let stamps = PhaseStamps::default();
        let start = Instant::now();
        let outcome = STAMPS
            .scope(
                stamps.clone(),
                self.dispatch(method, url, headers, body, stamps.clone()),
            )
            .await;
        let end = Instant::now();

        let slots = stamps.snapshot();
        let (response, error) = match outcome {
            Ok(response) => (Some(response), None),
            Err(message) => (None, Some(message)),
        };

        // Pooled connections leave no connector trace; headers go out as
        // soon as the connection is ready, so fall back to the send instant.
        let conn_ready = slots.tls_done.or(slots.connect_done).or(slots.sent);

        self.metrics.append(RequestRecord {
            start,
            end,
            dns_start: slots.dns_start,
            dns_done: slots.dns_done,
            connect_start: slots.connect_start,
            connect_done: slots.connect_done,
            tls_start: slots.tls_start,
            tls_done: slots.tls_done,
            got_conn: conn_ready,
            wrote_headers: conn_ready,
            wrote_request: conn_ready,
            first_byte: slots.first_byte,
            request: snapshot,
            response: response.clone(),
            error: error.clone(),
        });

        match (response, error) {
            (Some(response), _) => Ok(response),
            (None, Some(message)) => Err(message),
            (None, None) => unreachable!("request outcome has neither response nor error"),
        }
    }

    async fn dispatch(
        &self,
        method: Method,
        url: Uri,
        headers: HeaderMap,
        body: Bytes,
        stamps: PhaseStamps,
    ) -> Result<ResponseSnapshot, String> {
        let mut builder = Request::builder().method(method).uri(url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let request = builder.body(Full::new(body)).map_err(|e| error_chain(&e))?;

        let fut = async {
            stamps.mark(|s| s.sent = Some(Instant::now()));
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| error_chain(&e))?;
            stamps.mark(|s| s.first_byte = Some(Instant::now()));

            let (parts, incoming) = response.into_parts();
            let collected = incoming
                .collect()
                .await
                .map_err(|e| error_chain(&e))?
                .to_bytes();

            Ok(ResponseSnapshot {
                status: parts.status.as_u16(),
                status_text: format!(
                    "{} {}",
                    parts.status.as_u16(),
                    parts.status.canonical_reason().unwrap_or("")
                )
                .trim_end()
                .to_string(),
                proto: version_str(parts.version).to_string(),
                headers: parts.headers,
                body: collected,
            })
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(format!("request timed out after {}s", self.timeout.as_secs())),
        }
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
