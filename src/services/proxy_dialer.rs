use crate::models::{Destination, ProxyCredentials, ProxyEndpoint, ProxyScheme};
use crate::utils::error::{ProxySshError, Result};
use base64::Engine;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest HTTP CONNECT response header accepted from a proxy
const MAX_HTTP_HEADER: usize = 8192;

/// SOCKS4 protocol constants
mod socks4 {
    pub const VERSION: u8 = 0x04;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const REP_GRANTED: u8 = 0x5A;
    pub const REP_REJECTED: u8 = 0x5B;
    pub const REP_NO_IDENTD: u8 = 0x5C;
    pub const REP_IDENTD_MISMATCH: u8 = 0x5D;
}

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_PASSWORD: u8 = 0x02;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const AUTH_SUBNEGOTIATION_VERSION: u8 = 0x01;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
}

/// Opens byte-stream tunnels through a proxy
#[derive(Debug, Clone, Default)]
pub struct ProxyDialer {
    /// Bound on connecting to the proxy and completing its handshake
    pub connect_timeout: Option<Duration>,
}

impl ProxyDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    /// Open a tunnel to `destination` through `proxy`.
    ///
    /// The returned stream carries raw bytes to and from the destination.
    pub async fn dial(
        &self,
        proxy: &ProxyEndpoint,
        destination: &Destination,
    ) -> Result<TcpStream> {
        let target = match proxy.scheme {
            ProxyScheme::Direct => destination.to_string(),
            _ => proxy.address(),
        };

        tracing::info!("Dialing {} via {}", destination, proxy);

        let mut stream = self
            .bounded(TcpStream::connect(target.as_str()), &target)
            .await
            .map_err(|e| match e {
                ProxySshError::IoError(io) => {
                    ProxySshError::ProxyUnreachable(format!("{}: {}", target, io))
                }
                other => other,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        tracing::debug!("Connected to {}", target);

        self.bounded(handshake(&mut stream, proxy, destination), &target)
            .await?;

        tracing::info!("Tunnel to {} established", destination);
        Ok(stream)
    }

    async fn bounded<T, E, F>(&self, future: F, target: &str) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        ProxySshError: From<E>,
    {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| {
                    ProxySshError::ProxyUnreachable(format!(
                        "{} did not respond within {}s",
                        target,
                        limit.as_secs_f32()
                    ))
                })?
                .map_err(ProxySshError::from),
            None => future.await.map_err(ProxySshError::from),
        }
    }
}

/// Run the scheme-specific handshake on a freshly connected proxy stream
async fn handshake<S>(
    stream: &mut S,
    proxy: &ProxyEndpoint,
    destination: &Destination,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy.scheme {
        ProxyScheme::Direct => Ok(()),
        ProxyScheme::Http => http_connect(stream, destination, proxy.credentials.as_ref()).await,
        ProxyScheme::Socks4 | ProxyScheme::Socks4a => {
            let target = resolve_for_socks(destination, proxy.scheme.resolves_remotely()).await?;
            let user_id = proxy
                .credentials
                .as_ref()
                .map(|c| c.username.as_str())
                .unwrap_or("");
            socks4_connect(stream, &target, user_id).await
        }
        ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
            let target = resolve_for_socks(destination, proxy.scheme.resolves_remotely()).await?;
            socks5_connect(stream, &target, proxy.credentials.as_ref()).await
        }
    }
}

/// Destination as it is written into a SOCKS request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksTarget {
    Ip(IpAddr, u16),
    Domain(String, u16),
}

/// Turn the destination into a SOCKS address, resolving locally unless the
/// proxy is expected to do it.
pub async fn resolve_for_socks(destination: &Destination, remote: bool) -> Result<SocksTarget> {
    if let Some(ip) = destination.ip() {
        return Ok(SocksTarget::Ip(ip, destination.port));
    }

    if remote {
        return Ok(SocksTarget::Domain(destination.host.clone(), destination.port));
    }

    let addrs: Vec<_> = tokio::net::lookup_host((destination.host.as_str(), destination.port))
        .await
        .map_err(|e| {
            ProxySshError::InvalidDestination(format!("cannot resolve {}: {}", destination.host, e))
        })?
        .collect();

    // SOCKS4 can only carry IPv4
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| SocksTarget::Ip(addr.ip(), addr.port()))
        .ok_or_else(|| {
            ProxySshError::InvalidDestination(format!("no address found for {}", destination.host))
        })
}

fn truncated(stage: &str, e: std::io::Error) -> ProxySshError {
    ProxySshError::ProtocolError(format!("{}: {}", stage, e))
}

/// Perform an HTTP CONNECT handshake on `stream`
pub async fn http_connect<S>(
    stream: &mut S,
    destination: &Destination,
    credentials: Option<&ProxyCredentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = destination.to_string();
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n",
        authority = authority
    );
    if let Some(creds) = credentials {
        let token = format!(
            "{}:{}",
            creds.username,
            creds.password.as_deref().unwrap_or("")
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(token);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| truncated("CONNECT request failed", e))?;
    stream
        .flush()
        .await
        .map_err(|e| truncated("CONNECT request failed", e))?;

    // Byte at a time so nothing past the header is consumed
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_HTTP_HEADER {
            return Err(ProxySshError::ProtocolError(format!(
                "CONNECT response header exceeds {} bytes",
                MAX_HTTP_HEADER
            )));
        }
        match stream.read(&mut byte).await {
            Ok(0) => {
                return Err(ProxySshError::ProtocolError(
                    "proxy closed the connection during CONNECT".to_string(),
                ))
            }
            Ok(_) => header.push(byte[0]),
            Err(e) => return Err(truncated("CONNECT response failed", e)),
        }
    }

    let header = String::from_utf8_lossy(&header);
    let status_line = header.lines().next().unwrap_or_default();
    let (code, reason) = parse_status_line(status_line)?;

    tracing::debug!("CONNECT response: {}", status_line);

    if (200..300).contains(&code) {
        Ok(())
    } else if reason.is_empty() {
        Err(ProxySshError::TunnelRejected(format!("HTTP {}", code)))
    } else {
        Err(ProxySshError::TunnelRejected(format!("HTTP {} {}", code, reason)))
    }
}

/// Split `HTTP/1.1 200 Connection established` into its code and reason
fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let malformed = || ProxySshError::ProtocolError(format!("malformed status line {:?}", line));

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(malformed)?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((code, reason))
}

/// Perform a SOCKS4 or SOCKS4a CONNECT on `stream`
pub async fn socks4_connect<S>(stream: &mut S, target: &SocksTarget, user_id: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![socks4::VERSION, socks4::CMD_CONNECT];

    match target {
        SocksTarget::Ip(IpAddr::V4(ip), port) => {
            request.extend_from_slice(&port.to_be_bytes());
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(user_id.as_bytes());
            request.push(0);
        }
        SocksTarget::Ip(IpAddr::V6(ip), _) => {
            return Err(ProxySshError::InvalidDestination(format!(
                "SOCKS4 cannot reach IPv6 address {}",
                ip
            )));
        }
        SocksTarget::Domain(host, port) => {
            // SOCKS4a: invalid IP 0.0.0.x signals that a hostname follows
            request.extend_from_slice(&port.to_be_bytes());
            request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
            request.extend_from_slice(user_id.as_bytes());
            request.push(0);
            request.extend_from_slice(host.as_bytes());
            request.push(0);
        }
    }

    stream
        .write_all(&request)
        .await
        .map_err(|e| truncated("SOCKS4 request failed", e))?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| truncated("SOCKS4 reply truncated", e))?;

    // Reply version is 0 by the protocol; some proxies echo 4
    if reply[0] != 0 && reply[0] != socks4::VERSION {
        return Err(ProxySshError::ProtocolError(format!(
            "unexpected SOCKS4 reply version {}",
            reply[0]
        )));
    }

    match reply[1] {
        socks4::REP_GRANTED => Ok(()),
        code => Err(ProxySshError::TunnelRejected(socks4_reason(code).to_string())),
    }
}

fn socks4_reason(code: u8) -> &'static str {
    match code {
        socks4::REP_REJECTED => "request rejected or failed",
        socks4::REP_NO_IDENTD => "proxy cannot reach identd on the client",
        socks4::REP_IDENTD_MISMATCH => "identd reported a different user id",
        _ => "unknown SOCKS4 failure",
    }
}

/// Perform a SOCKS5 CONNECT on `stream`, with username/password sub-negotiation
/// when credentials are present
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &SocksTarget,
    credentials: Option<&ProxyCredentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[socks5::VERSION, 2, socks5::AUTH_NONE, socks5::AUTH_PASSWORD]
    } else {
        &[socks5::VERSION, 1, socks5::AUTH_NONE]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| truncated("SOCKS5 greeting failed", e))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| truncated("SOCKS5 method reply truncated", e))?;

    if choice[0] != socks5::VERSION {
        return Err(ProxySshError::ProtocolError(format!(
            "unexpected SOCKS version {} in method reply",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (socks5::AUTH_NONE, _) => {}
        (socks5::AUTH_PASSWORD, Some(creds)) => socks5_password_auth(stream, creds).await?,
        (socks5::AUTH_NO_ACCEPTABLE, _) => {
            return Err(ProxySshError::TunnelRejected(
                "no acceptable authentication method".to_string(),
            ))
        }
        (method, _) => {
            return Err(ProxySshError::ProtocolError(format!(
                "proxy selected unoffered authentication method {:#04x}",
                method
            )))
        }
    }

    let mut request = vec![socks5::VERSION, socks5::CMD_CONNECT, 0x00];
    let port = match target {
        SocksTarget::Ip(IpAddr::V4(ip), port) => {
            request.push(socks5::ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
            *port
        }
        SocksTarget::Ip(IpAddr::V6(ip), port) => {
            request.push(socks5::ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
            *port
        }
        SocksTarget::Domain(host, port) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                ProxySshError::InvalidDestination(format!("hostname too long: {}", host))
            })?;
            request.push(socks5::ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
            *port
        }
    };
    request.extend_from_slice(&port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| truncated("SOCKS5 request failed", e))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| truncated("SOCKS5 reply truncated", e))?;

    if head[0] != socks5::VERSION {
        return Err(ProxySshError::ProtocolError(format!(
            "unexpected SOCKS version {} in reply",
            head[0]
        )));
    }
    if head[1] != socks5::REP_SUCCESS {
        return Err(ProxySshError::TunnelRejected(socks5_reason(head[1]).to_string()));
    }

    // Drain the bound address so the stream starts at the tunnelled bytes
    let bound_len = match head[3] {
        socks5::ATYP_IPV4 => 4,
        socks5::ATYP_IPV6 => 16,
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| truncated("SOCKS5 reply truncated", e))?;
            len[0] as usize
        }
        other => {
            return Err(ProxySshError::ProtocolError(format!(
                "unknown SOCKS5 address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| truncated("SOCKS5 reply truncated", e))?;

    Ok(())
}

async fn socks5_password_auth<S>(stream: &mut S, creds: &ProxyCredentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let password = creds.password.as_deref().unwrap_or("");
    let ulen = u8::try_from(creds.username.len())
        .map_err(|_| ProxySshError::ConfigError("SOCKS5 username too long".to_string()))?;
    let plen = u8::try_from(password.len())
        .map_err(|_| ProxySshError::ConfigError("SOCKS5 password too long".to_string()))?;

    let mut request = vec![socks5::AUTH_SUBNEGOTIATION_VERSION, ulen];
    request.extend_from_slice(creds.username.as_bytes());
    request.push(plen);
    request.extend_from_slice(password.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| truncated("SOCKS5 authentication failed", e))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| truncated("SOCKS5 authentication reply truncated", e))?;

    if reply[1] != 0 {
        return Err(ProxySshError::TunnelRejected(
            "proxy rejected the username/password".to_string(),
        ));
    }
    Ok(())
}

fn socks5_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 failure",
    }
}
