//! Application router core
//! Resolves destinations and relays HTTP requests to their backends

use crate::destinations::{Destination, DestinationTable};
use crate::error::ForwardError;
use anyhow::{Result, anyhow};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Headers that describe the connection to the router itself and are
/// never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Router runtime configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Application router server
pub struct ProxyServer {
    config: ProxyConfig,
    table: Arc<DestinationTable>,
    client: Client<HttpConnector, Incoming>,
}

impl ProxyServer {
    /// Create a new router over a validated destination table
    pub fn new(config: ProxyConfig, table: Arc<DestinationTable>) -> Self {
        // One pooled client shared by all requests, so connections to a
        // destination are reused across requests.
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            config,
            table,
            client,
        }
    }

    /// Serve connections from an already-bound listener
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Application router listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        let request_id = Uuid::new_v4();

        match self.process_request(req, remote_addr, request_id).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if matches!(e, ForwardError::NoDestination(_)) {
                    warn!("{} {}", request_id, e);
                } else {
                    error!("{} {}", request_id, e);
                }
                Ok(Self::error_response(e.status(), Self::gateway_message(&e)))
            }
        }
    }

    /// Resolve the destination for a request and relay it
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        request_id: Uuid,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(|q| q.to_string());

        debug!("{} {} {} from {}", request_id, req.method(), path, remote_addr);

        let dest = self
            .table
            .resolve(&path)
            .ok_or_else(|| ForwardError::NoDestination(path.clone()))?;

        let target_uri = Self::build_target_uri(dest, &path, query.as_deref())?;

        debug!("{} routing to {} via destination {}", request_id, target_uri, dest.name);

        let headers = Self::forward_headers(dest, req.headers(), remote_addr.ip());

        // The inbound body streams through to the backend untouched.
        let (parts, body) = req.into_parts();
        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(target_uri)
            .version(Version::HTTP_11)
            .body(body)
            .map_err(|e| ForwardError::Invalid {
                name: dest.name.clone(),
                reason: e.to_string(),
            })?;
        *outbound.headers_mut() = headers;

        // The timeout covers connection establishment and the wait for
        // response headers; dropping the future aborts the exchange.
        let upstream = self.client.request(outbound);
        let response = match timeout(self.config.upstream_timeout, upstream).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                return Err(ForwardError::Upstream {
                    name: dest.name.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(ForwardError::Timeout {
                    name: dest.name.clone(),
                    timeout: self.config.upstream_timeout,
                });
            }
        };

        // Relay status and headers as-is; the body streams back.
        let (mut parts, body) = response.into_parts();
        Self::strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Compose the upstream URI from the destination's base URL and the
    /// prefix-stripped request path
    fn build_target_uri(
        dest: &Destination,
        path: &str,
        query: Option<&str>,
    ) -> Result<Uri, ForwardError> {
        let remainder = dest.strip_matched_prefix(path);
        let mut target = format!("{}{}", dest.target_base_url, remainder);

        // The request target always carries an explicit path
        let authority_end = target.find("://").map(|i| i + 3).unwrap_or(0);
        if !target[authority_end..].contains('/') {
            target.push('/');
        }

        if let Some(q) = query {
            target.push('?');
            target.push_str(q);
        }

        target.parse::<Uri>().map_err(|e| ForwardError::Invalid {
            name: dest.name.clone(),
            reason: format!("composed target {} is not a valid URI: {}", target, e),
        })
    }

    /// Build the outbound header set for a destination
    fn forward_headers(dest: &Destination, inbound: &HeaderMap, client_ip: IpAddr) -> HeaderMap {
        let mut headers = inbound.clone();

        Self::strip_hop_by_hop(&mut headers);

        // The client derives Host from the target URI; the original
        // value travels in X-Forwarded-Host.
        let original_host = headers.remove(HOST);

        if !dest.forward_auth_token {
            headers.remove(AUTHORIZATION);
        }

        // The chain stays a single comma-joined value, not repeated
        // header lines.
        let prior: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let chain = if prior.is_empty() {
            client_ip.to_string()
        } else {
            format!("{}, {}", prior.join(", "), client_ip)
        };
        headers.remove("x-forwarded-for");
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert("x-forwarded-for", value);
        }
        if let Some(host) = original_host {
            headers.insert("x-forwarded-host", host);
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

        headers
    }

    /// Remove hop-by-hop headers, including any nominated by Connection
    fn strip_hop_by_hop(headers: &mut HeaderMap) {
        let nominated: Vec<HeaderName> = headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();

        for name in nominated {
            headers.remove(&name);
        }

        for name in HOP_BY_HOP_HEADERS {
            headers.remove(*name);
        }
    }

    /// Body text reported alongside each gateway error status
    fn gateway_message(err: &ForwardError) -> &'static str {
        match err {
            ForwardError::NoDestination(_) => "no matching destination",
            ForwardError::Upstream { .. } => "destination unreachable",
            ForwardError::Timeout { .. } => "destination timed out",
            ForwardError::Invalid { .. } => "internal routing error",
        }
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Self::full_body(Bytes::from(message.to_string())))
            .unwrap()
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
        Full::new(bytes)
            .map_err(|never| match never {})
            .boxed()
    }
}
