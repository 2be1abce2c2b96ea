//! Manual SOCKS5 + TLS egress transport.
//!
//! Used when the tax service cannot be reached through normal HTTPS. The
//! transport resolves the target hostname to IPv4 candidates itself (the
//! SOCKS5 remote-resolve variant is deliberately bypassed) and tries each in
//! turn, tunnelling through the proxy when one is configured. Every read is
//! a deadline-bounded accumulation loop and every failure carries the stage
//! and target that produced it.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_native_tls::TlsStream;

#[derive(Debug, Error)]
#[error("{stage} failed for {target}: {detail}")]
pub struct TunnelError {
    pub stage: &'static str,
    pub target: String,
    pub detail: String,
}

impl TunnelError {
    fn new(stage: &'static str, target: impl Into<String>, detail: impl ToString) -> Self {
        Self {
            stage,
            target: target.into(),
            detail: detail.to_string(),
        }
    }
}

/// A SOCKS5 proxy endpoint with optional username/password
/// sub-negotiation credentials.
#[derive(Debug, Clone)]
pub struct SocksProxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl FromStr for SocksProxy {
    type Err = String;

    /// Accepts `[socks5://][user:pass@]host:port`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let rest = raw
            .strip_prefix("socks5://")
            .or_else(|| raw.strip_prefix("socks://"))
            .unwrap_or(raw);

        let (creds, endpoint) = match rest.rsplit_once('@') {
            Some((creds, endpoint)) => (Some(creds), endpoint),
            None => (None, rest),
        };
        let (username, password) = match creds {
            Some(creds) => {
                let (user, pass) = creds
                    .split_once(':')
                    .ok_or_else(|| "proxy credentials must be user:pass".to_string())?;
                (Some(user.to_string()), Some(pass.to_string()))
            }
            None => (None, None),
        };

        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| "proxy endpoint must be host:port".to_string())?;
        if host.is_empty() {
            return Err("proxy host is missing".to_string());
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid proxy port {:?}", port))?;

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }
}

/// Response of a tunnelled HTTP exchange.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Resolve `host` to its IPv4 candidates, failing when none exist.
pub async fn resolve_ipv4(host: &str, port: u16) -> Result<Vec<Ipv4Addr>, TunnelError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TunnelError::new("dns", host, e))?;
    let v4: Vec<Ipv4Addr> = addrs
        .filter_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .collect();
    if v4.is_empty() {
        return Err(TunnelError::new("dns", host, "no IPv4 addresses"));
    }
    Ok(v4)
}

/// Read exactly `buf.len()` bytes or fail at the deadline.
async fn read_exact_deadline<S>(
    stream: &mut S,
    buf: &mut [u8],
    deadline: Instant,
    stage: &'static str,
    target: &str,
) -> Result<(), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = timeout_at(deadline, stream.read(&mut buf[filled..]))
            .await
            .map_err(|_| TunnelError::new(stage, target, "read timed out"))?
            .map_err(|e| TunnelError::new(stage, target, e))?;
        if n == 0 {
            return Err(TunnelError::new(stage, target, "connection closed early"));
        }
        filled += n;
    }
    Ok(())
}

/// Read until EOF or the deadline.
async fn read_to_end_deadline<S>(
    stream: &mut S,
    deadline: Instant,
    stage: &'static str,
    target: &str,
) -> Result<Vec<u8>, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| TunnelError::new(stage, target, "read timed out"))?
            .map_err(|e| TunnelError::new(stage, target, e))?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Negotiate a SOCKS5 CONNECT to `target_ip:target_port` through `proxy`.
pub async fn socks5_connect(
    proxy: &SocksProxy,
    target_ip: Ipv4Addr,
    target_port: u16,
    deadline: Instant,
) -> Result<TcpStream, TunnelError> {
    let proxy_addr = format!("{}:{}", proxy.host, proxy.port);
    let target = format!("{}:{}", target_ip, target_port);

    let mut stream = timeout_at(deadline, TcpStream::connect(&proxy_addr))
        .await
        .map_err(|_| TunnelError::new("proxy connect", &proxy_addr, "connect timed out"))?
        .map_err(|e| TunnelError::new("proxy connect", &proxy_addr, e))?;

    // Method selection: no-auth, plus user/pass when credentials are set.
    let greeting: &[u8] = if proxy.username.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| TunnelError::new("socks greeting", &proxy_addr, e))?;

    let mut method = [0u8; 2];
    read_exact_deadline(&mut stream, &mut method, deadline, "socks greeting", &proxy_addr).await?;
    if method[0] != 0x05 {
        return Err(TunnelError::new(
            "socks greeting",
            &proxy_addr,
            format!("unexpected version {:#04x}", method[0]),
        ));
    }

    match method[1] {
        0x00 => {}
        0x02 => {
            let (user, pass) = match (&proxy.username, &proxy.password) {
                (Some(u), Some(p)) => (u.as_bytes(), p.as_bytes()),
                _ => {
                    return Err(TunnelError::new(
                        "socks auth",
                        &proxy_addr,
                        "proxy requires credentials but none configured",
                    ))
                }
            };
            if user.len() > 255 || pass.len() > 255 {
                return Err(TunnelError::new(
                    "socks auth",
                    &proxy_addr,
                    "credentials longer than 255 bytes",
                ));
            }
            let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
            auth.push(0x01);
            auth.push(user.len() as u8);
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream
                .write_all(&auth)
                .await
                .map_err(|e| TunnelError::new("socks auth", &proxy_addr, e))?;

            let mut auth_reply = [0u8; 2];
            read_exact_deadline(&mut stream, &mut auth_reply, deadline, "socks auth", &proxy_addr)
                .await?;
            if auth_reply[1] != 0x00 {
                return Err(TunnelError::new(
                    "socks auth",
                    &proxy_addr,
                    "credentials rejected",
                ));
            }
        }
        other => {
            return Err(TunnelError::new(
                "socks greeting",
                &proxy_addr,
                format!("no acceptable auth method (offered {:#04x})", other),
            ))
        }
    }

    // CONNECT with an explicit IPv4 address: name resolution already
    // happened locally.
    let mut request = Vec::with_capacity(10);
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01]);
    request.extend_from_slice(&target_ip.octets());
    request.extend_from_slice(&target_port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| TunnelError::new("socks connect", &target, e))?;

    let mut reply_head = [0u8; 4];
    read_exact_deadline(&mut stream, &mut reply_head, deadline, "socks connect", &target).await?;
    if reply_head[1] != 0x00 {
        return Err(TunnelError::new(
            "socks connect",
            &target,
            format!("proxy refused with code {:#04x}", reply_head[1]),
        ));
    }
    let bound_len = match reply_head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            read_exact_deadline(&mut stream, &mut len, deadline, "socks connect", &target).await?;
            usize::from(len[0])
        }
        other => {
            return Err(TunnelError::new(
                "socks connect",
                &target,
                format!("unknown bound address type {:#04x}", other),
            ))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    read_exact_deadline(&mut stream, &mut bound, deadline, "socks connect", &target).await?;

    Ok(stream)
}

/// Layer a TLS session over an established stream, validating the
/// certificate against the service's real hostname.
pub async fn tls_handshake(
    stream: TcpStream,
    server_name: &str,
    deadline: Instant,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let connector = native_tls::TlsConnector::new()
        .map_err(|e| TunnelError::new("tls setup", server_name, e))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    timeout_at(deadline, connector.connect(server_name, stream))
        .await
        .map_err(|_| TunnelError::new("tls handshake", server_name, "handshake timed out"))?
        .map_err(|e| TunnelError::new("tls handshake", server_name, e))
}

/// One HTTPS POST over the manual transport. Tries each resolved IPv4
/// candidate in turn, through the proxy when one is configured.
pub async fn https_post_json(
    proxy: Option<&SocksProxy>,
    host: &str,
    path: &str,
    bearer: Option<&str>,
    body: &[u8],
    timeout: Duration,
) -> Result<HttpResponse, TunnelError> {
    let deadline = Instant::now() + timeout;
    let candidates = resolve_ipv4(host, 443).await?;

    let mut last_error = None;
    for candidate in candidates {
        let target = format!("{}:{}", candidate, 443);
        let connected = match proxy {
            Some(proxy) => socks5_connect(proxy, candidate, 443, deadline).await,
            None => timeout_at(deadline, TcpStream::connect((candidate, 443)))
                .await
                .map_err(|_| TunnelError::new("tcp connect", &target, "connect timed out"))
                .and_then(|r| r.map_err(|e| TunnelError::new("tcp connect", &target, e))),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                last_error = Some(err);
                continue;
            }
        };

        match exchange(stream, host, path, bearer, body, deadline).await {
            Ok(response) => return Ok(response),
            Err(err) => last_error = Some(err),
        }
    }

    Err(last_error.unwrap_or_else(|| TunnelError::new("tcp connect", host, "no candidates tried")))
}

async fn exchange(
    stream: TcpStream,
    host: &str,
    path: &str,
    bearer: Option<&str>,
    body: &[u8],
    deadline: Instant,
) -> Result<HttpResponse, TunnelError> {
    let mut tls = tls_handshake(stream, host, deadline).await?;

    let mut request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        path,
        host,
        body.len()
    );
    if let Some(token) = bearer {
        request.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    request.push_str("\r\n");

    write_all_deadline(&mut tls, request.as_bytes(), deadline, host).await?;
    write_all_deadline(&mut tls, body, deadline, host).await?;

    let raw = read_to_end_deadline(&mut tls, deadline, "http read", host).await?;
    parse_response(&raw, host)
}

async fn write_all_deadline<S>(
    stream: &mut S,
    data: &[u8],
    deadline: Instant,
    target: &str,
) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    timeout_at(deadline, stream.write_all(data))
        .await
        .map_err(|_| TunnelError::new("http write", target, "write timed out"))?
        .map_err(|e| TunnelError::new("http write", target, e))
}

fn parse_response(raw: &[u8], target: &str) -> Result<HttpResponse, TunnelError> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| TunnelError::new("http parse", target, "missing header terminator"))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let status_line = head
        .lines()
        .next()
        .ok_or_else(|| TunnelError::new("http parse", target, "empty response"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            TunnelError::new("http parse", target, format!("bad status line {:?}", status_line))
        })?;

    let mut body = raw[split + 4..].to_vec();
    // Connection: close responses may still arrive chunked.
    if head
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("transfer-encoding:") && l.contains("chunked"))
    {
        body = dechunk(&body);
    }
    Ok(HttpResponse { status, body })
}

fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    loop {
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let end = start + size;
        if end > rest.len() {
            break;
        }
        out.extend_from_slice(&rest[start..end]);
        rest = rest.get(end + 2..).unwrap_or(&[]);
    }
    out
}
