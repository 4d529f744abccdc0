//! Local anonymizing forwarder
//!
//! A forwarder is an unauthenticated HTTP/1.1 proxy listener bound to a local
//! port. Every request it accepts is relayed to exactly one paid upstream with
//! that upstream's credentials injected, so browsers and clients that cannot
//! carry proxy credentials can still use the paid tier.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{is_bypassed, Config};
use crate::error::{EgressError, Result};
use crate::models::proxy::format_tcp_addr;
use crate::models::{Upstream, UpstreamProtocol};
use crate::proxy::transport::ProxyTransport;
use crate::proxy::tunnel;

/// Settings shared by every forwarder in a farm
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// Host the local listener binds to
    pub bind_host: String,
    /// Timeout for dialing the upstream (or the target, when bypassed)
    pub connect_timeout: Duration,
    /// Timeout for a forwarded plain-HTTP request
    pub request_timeout: Duration,
    /// Hosts dialed directly instead of through the upstream
    pub bypass_domains: Vec<String>,
}

impl ForwarderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_host: config.paid.bind_host.clone(),
            connect_timeout: config.paid.connect_timeout,
            request_timeout: config.paid.request_timeout,
            bypass_domains: config.selection.bypass_domains.clone(),
        }
    }
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Running forwarder listener
pub struct ForwarderHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ForwarderHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Unauthenticated proxy URL clients connect to
    pub fn local_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
            && self
                .task
                .lock()
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false)
    }

    /// Stop accepting connections. Tunnels already open run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.task.lock().take();
    }
}

impl std::fmt::Debug for ForwarderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderHandle")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Spawns forwarder listeners
pub struct ForwarderServer;

impl ForwarderServer {
    /// Bind a local listener and start relaying to `upstream`
    #[instrument(skip(upstream, settings), fields(upstream = %upstream))]
    pub async fn spawn(upstream: Upstream, settings: ForwarderSettings) -> Result<ForwarderHandle> {
        let listener = TcpListener::bind(format_tcp_addr(&settings.bind_host, 0)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("Forwarder listening on {} -> {}", local_addr, upstream);

        let handler = Arc::new(ForwardHandler { upstream, settings });
        let task = tokio::spawn(Self::run(listener, handler, shutdown_rx));

        Ok(ForwarderHandle {
            local_addr,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run(
        listener: TcpListener,
        handler: Arc<ForwardHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!("Connection error from {}: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Forwarder shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, handler: Arc<ForwardHandler>) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move {
                match handler.handle(req).await {
                    Ok(response) => Ok::<_, Infallible>(response),
                    Err(e) => {
                        warn!("Forwarding error: {}", e);
                        Ok(error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
                    }
                }
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| EgressError::ProxyConnectionFailed(e.to_string()))?;

        Ok(())
    }
}

struct ForwardHandler {
    upstream: Upstream,
    settings: ForwarderSettings,
}

impl ForwardHandler {
    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        self.handle_http(req).await
    }

    /// Open a tunnel to the CONNECT target, then relay once the client upgrades
    async fn handle_connect(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let uri = req.uri().clone();
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| uri.to_string());
        let (target_host, target_port) = ProxyTransport::parse_authority(&authority)?;

        // Don't respond 200 until the upstream tunnel is up.
        let server = self.dial_tunnel(&target_host, target_port).await?;
        debug!("CONNECT tunnel established to {}:{}", target_host, target_port);

        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    tunnel::relay(TokioIo::new(upgraded), server).await;
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
    }

    /// Forward an absolute-form HTTP request
    async fn handle_http(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let uri = req.uri().clone();
        let (target_host, target_port) = ProxyTransport::parse_target(&uri)?;

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| EgressError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let via_http_upstream = self.upstream.protocol == UpstreamProtocol::Http
            && !is_bypassed(&self.settings.bypass_domains, &target_host);

        // An HTTP upstream receives the absolute-form URI plus credentials;
        // anything else gets an origin-form request over a raw tunnel.
        let (stream, request_uri) = if via_http_upstream {
            let stream = tokio::time::timeout(
                self.settings.connect_timeout,
                TcpStream::connect(self.upstream.address()),
            )
            .await
            .map_err(|_| EgressError::Timeout)?
            .map_err(|e| {
                EgressError::ProxyConnectionFailed(format!("TCP connect failed: {}", e))
            })?;
            let authority = if target_port == 80 {
                target_host.clone()
            } else {
                format_tcp_addr(&target_host, target_port)
            };
            (stream, format!("http://{}{}", authority, path))
        } else {
            (self.dial_tunnel(&target_host, target_port).await?, path)
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(&request_uri);
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        if via_http_upstream {
            if let Some((username, password)) = self.upstream.credentials() {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", encoded));
            }
        }

        let request = builder
            .body(Full::new(body))
            .map_err(|e| EgressError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| EgressError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        });

        let response = tokio::time::timeout(self.settings.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| EgressError::Timeout)?
            .map_err(|e| EgressError::ProxyConnectionFailed(format!("Request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| EgressError::ProxyConnectionFailed(format!("Failed to read response: {}", e)))?
            .to_bytes();

        Ok(Response::from_parts(parts, Full::new(body)))
    }

    /// Tunnel to the target through the upstream, or directly for bypassed hosts
    async fn dial_tunnel(&self, target_host: &str, target_port: u16) -> Result<TcpStream> {
        let dial = async {
            if is_bypassed(&self.settings.bypass_domains, target_host) {
                debug!("{} is bypassed, dialing directly", target_host);
                ProxyTransport::connect_direct(target_host, target_port).await
            } else {
                ProxyTransport::connect(&self.upstream, target_host, target_port).await
            }
        };

        tokio::time::timeout(self.settings.connect_timeout, dial)
            .await
            .map_err(|_| EgressError::Timeout)?
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
