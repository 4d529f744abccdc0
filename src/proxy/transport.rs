//! Proxy transport layer for HTTP CONNECT and SOCKS5 upstreams
//!
//! Handles establishing tunnels through free proxies and paid upstreams.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::Uri;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{EgressError, Result};
use crate::models::proxy::format_tcp_addr;
use crate::models::{Upstream, UpstreamProtocol};

/// Upper bound on a CONNECT response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to a target through a paid upstream
    #[instrument(skip(upstream), fields(upstream = %upstream, target = %target_host))]
    pub async fn connect(
        upstream: &Upstream,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        match upstream.protocol {
            UpstreamProtocol::Http => {
                Self::open_tunnel(
                    &upstream.address(),
                    upstream.credentials(),
                    target_host,
                    target_port,
                )
                .await
            }
            UpstreamProtocol::Socks5 => Self::connect_socks5(upstream, target_host, target_port).await,
        }
    }

    /// Issue an HTTP CONNECT through `proxy_addr` and require a 2xx status line
    pub async fn open_tunnel(
        proxy_addr: &str,
        credentials: Option<(&str, &str)>,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to HTTP proxy at {}", proxy_addr);

        let mut stream = TcpStream::connect(proxy_addr)
            .await
            .map_err(|e| EgressError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))?;

        let connect_request = build_connect_request(credentials, target_host, target_port);
        stream.write_all(connect_request.as_bytes()).await.map_err(|e| {
            EgressError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
        })?;

        let head = read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or("").to_string();
        match parse_status_code(&status_line) {
            Some(code) if (200..300).contains(&code) => {
                debug!("HTTP CONNECT tunnel established");
                Ok(stream)
            }
            _ => Err(EgressError::ConnectFailed(if status_line.is_empty() {
                "empty CONNECT response".to_string()
            } else {
                status_line
            })),
        }
    }

    /// Connect through a SOCKS5 upstream
    async fn connect_socks5(
        upstream: &Upstream,
        target_host: &str,
        target_port: u16,
    ) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", upstream.address());

        let socket = TcpStream::connect(upstream.address())
            .await
            .map_err(|e| EgressError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))?;

        let stream = match upstream.credentials() {
            Some((username, password)) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    (target_host, target_port),
                    username,
                    password,
                )
                .await
            }
            None => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await,
        }
        .map_err(|e| EgressError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(stream.into_inner())
    }

    /// Dial the target without any proxy
    pub async fn connect_direct(target_host: &str, target_port: u16) -> Result<TcpStream> {
        let addr = format_tcp_addr(target_host, target_port);
        debug!("Establishing direct connection to {}", addr);

        TcpStream::connect(&addr)
            .await
            .map_err(|e| EgressError::ProxyConnectionFailed(format!("Direct connect failed: {}", e)))
    }

    /// Parse host and port from a URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| EgressError::InvalidRequest("Missing host in URI".to_string()))?
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }

    /// Parse host and port from authority (for CONNECT requests)
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        if let Some((host, port_str)) = authority.rsplit_once(':') {
            if !host.starts_with('[') || host.ends_with(']') {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| EgressError::InvalidRequest("Invalid port".to_string()))?;
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host);
                return Ok((host.to_string(), port));
            }
        }
        // Default to port 443 for CONNECT (typically HTTPS)
        Ok((authority.to_string(), 443))
    }
}

/// Build HTTP CONNECT request
fn build_connect_request(
    credentials: Option<(&str, &str)>,
    target_host: &str,
    target_port: u16,
) -> String {
    let authority = format_tcp_addr(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some((username, password)) = credentials {
        let credentials = format!("{}:{}", username, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    request
}

/// Read until the end of the response head without consuming tunnel bytes
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(EgressError::ConnectFailed(
                "CONNECT response head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await.map_err(|e| {
            EgressError::ProxyConnectionFailed(format!("Failed to read CONNECT response: {}", e))
        })?;
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Status code of an `HTTP/1.x NNN reason` line
pub(crate) fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
