//! Upstream proxy tunnelling.
//!
//! When the user's network only allows egress through another proxy, the
//! target connection is opened through it. Two protocols are supported:
//! HTTP `CONNECT` and SOCKS5 with no authentication.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::Destination;

/// Largest HTTP response head accepted from an upstream proxy.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

/// An upstream proxy the target connection should be tunnelled through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamProxy {
    /// HTTP proxy speaking `CONNECT`.
    Http(Destination),
    /// SOCKS5 proxy, no authentication.
    Socks5(Destination),
}

impl UpstreamProxy {
    /// Address of the proxy itself.
    pub fn endpoint(&self) -> &Destination {
        match self {
            UpstreamProxy::Http(dest) | UpstreamProxy::Socks5(dest) => dest,
        }
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamProxy::Http(dest) => write!(f, "http://{}", dest),
            UpstreamProxy::Socks5(dest) => write!(f, "socks5://{}", dest),
        }
    }
}

impl FromStr for UpstreamProxy {
    type Err = String;

    /// Parse `http://host:port` or `socks5://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, authority) = s
            .split_once("://")
            .ok_or_else(|| format!("upstream proxy '{}' is missing a scheme", s))?;
        let authority = authority.trim_end_matches('/');
        let endpoint: Destination = authority.parse().map_err(|e| format!("{}", e))?;
        if !authority.contains(':') || authority.ends_with(']') {
            return Err(format!("upstream proxy '{}' must include a port", s));
        }
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Ok(UpstreamProxy::Http(endpoint)),
            "socks5" | "socks" => Ok(UpstreamProxy::Socks5(endpoint)),
            other => Err(format!("unsupported upstream proxy scheme '{}'", other)),
        }
    }
}

/// Why a tunnel could not be opened.
#[derive(Debug)]
pub enum TunnelFailure {
    /// The proxy answered but refused.
    Rejected(String),
    /// The conversation with the proxy failed.
    Io(std::io::Error),
}

impl From<std::io::Error> for TunnelFailure {
    fn from(e: std::io::Error) -> Self {
        TunnelFailure::Io(e)
    }
}

/// Ask an HTTP proxy to open a tunnel to `target`.
///
/// Reads the response head one byte at a time so no bytes past the blank
/// line are consumed from the stream.
pub async fn http_connect<S>(stream: &mut S, target: &Destination) -> Result<(), TunnelFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.to_string();
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TunnelFailure::Rejected(
                "response head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TunnelFailure::Rejected(
                "proxy closed the connection".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default().trim().to_string();
    trace!("Upstream proxy answered: {}", status_line);

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse::<u16>().ok());
    if !version.starts_with("HTTP/1.") || !matches!(code, Some(200..=299)) {
        return Err(TunnelFailure::Rejected(status_line));
    }
    Ok(())
}

/// Ask a SOCKS5 proxy to open a tunnel to `target`.
pub async fn socks5_connect<S>(stream: &mut S, target: &Destination) -> Result<(), TunnelFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(TunnelFailure::Rejected(format!(
            "unexpected SOCKS version {}",
            choice[0]
        )));
    }
    if choice[1] != SOCKS_NO_AUTH {
        return Err(TunnelFailure::Rejected(
            "proxy requires authentication".to_string(),
        ));
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(SOCKS_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target.host.as_bytes();
            let len = u8::try_from(host.len()).map_err(|_| {
                TunnelFailure::Rejected("host name too long for SOCKS5".to_string())
            })?;
            request.push(SOCKS_ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host);
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(TunnelFailure::Rejected(format!(
            "unexpected SOCKS version {}",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(TunnelFailure::Rejected(socks_reply_message(reply[1])));
    }

    // Drain the bound address so the stream is positioned at tunnel data.
    let bound_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(TunnelFailure::Rejected(format!(
                "unknown address type {}",
                other
            )));
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn socks_reply_message(code: u8) -> String {
    let text = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS error",
    };
    format!("{} (0x{:02x})", text, code)
}
