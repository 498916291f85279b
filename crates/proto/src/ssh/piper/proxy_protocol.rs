//! HAProxy PROXY protocol headers (v1 text, v2 binary).
//!
//! A load balancer in front of the listener prepends one header carrying
//! the real client address. The header is only honoured from configured
//! source networks and must arrive within a short timeout; anything else
//! means "no header" and the socket peer address is kept.

use ipnet::IpNet;
use piper_platform::{PiperError, PiperResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::debug;

/// Longest legal v1 header, CR LF included.
pub const V1_MAX_LENGTH: usize = 107;

/// Default time allowed for the header to arrive.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_millis(200);

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Who may send a PROXY header and how long to wait for it.
#[derive(Debug, Clone)]
pub struct ProxyProtocolConfig {
    /// Peers allowed to send a header
    pub allowed_sources: Vec<IpNet>,
    /// Time allowed for the header
    pub header_timeout: Duration,
}

impl ProxyProtocolConfig {
    /// Config trusting `allowed_sources` with the default timeout.
    pub fn new(allowed_sources: Vec<IpNet>) -> Self {
        Self {
            allowed_sources,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
        }
    }

    /// Whether `peer` may send a header.
    pub fn allows(&self, peer: IpAddr) -> bool {
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(peer),
            v4 => v4,
        };
        self.allowed_sources.iter().any(|net| net.contains(&peer))
    }
}

/// Returns the client address for a freshly accepted connection: the one in
/// its PROXY header when `peer` is trusted and a header arrives in time,
/// `peer` otherwise.
///
/// # Errors
///
/// [`PiperError::Protocol`] for a malformed header from a trusted peer.
pub async fn resolve_remote_addr<R>(
    reader: &mut R,
    peer: SocketAddr,
    config: &ProxyProtocolConfig,
) -> PiperResult<SocketAddr>
where
    R: AsyncBufRead + Unpin,
{
    if !config.allows(peer.ip()) {
        return Ok(peer);
    }
    match tokio::time::timeout(config.header_timeout, read_proxy_header(reader)).await {
        Ok(Ok(Some(addr))) => {
            debug!(%peer, client = %addr, "PROXY header accepted");
            Ok(addr)
        }
        Ok(Ok(None)) => Ok(peer),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!(%peer, "no PROXY header before timeout");
            Ok(peer)
        }
    }
}

/// Reads a PROXY header if the stream starts with one.
///
/// Nothing is consumed when the first byte cannot start a header. Returns
/// `None` for headers without a usable source (`UNKNOWN`, `LOCAL`, non-TCP
/// families).
///
/// # Errors
///
/// [`PiperError::Protocol`] for malformed headers, I/O errors while reading.
pub async fn read_proxy_header<R>(reader: &mut R) -> PiperResult<Option<SocketAddr>>
where
    R: AsyncBufRead + Unpin,
{
    let first = match reader.fill_buf().await?.first() {
        Some(&byte) => byte,
        None => return Ok(None),
    };
    match first {
        b'P' => read_v1(reader).await,
        0x0D => read_v2(reader).await,
        _ => Ok(None),
    }
}

async fn read_v1<R>(reader: &mut R) -> PiperResult<Option<SocketAddr>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(V1_MAX_LENGTH);
    (&mut *reader)
        .take(V1_MAX_LENGTH as u64)
        .read_until(b'\n', &mut line)
        .await?;
    parse_v1(&line)
}

fn parse_v1(line: &[u8]) -> PiperResult<Option<SocketAddr>> {
    let line = line
        .strip_suffix(b"\r\n")
        .ok_or_else(|| PiperError::Protocol("PROXY v1 header not terminated".to_string()))?;
    let line = std::str::from_utf8(line)
        .map_err(|_| PiperError::Protocol("PROXY v1 header is not ASCII".to_string()))?;

    let fields: Vec<&str> = line.split(' ').collect();
    match fields.as_slice() {
        ["PROXY", "UNKNOWN", ..] => Ok(None),
        ["PROXY", family @ ("TCP4" | "TCP6"), source, _, source_port, _] => {
            let ip: IpAddr = source
                .parse()
                .map_err(|_| PiperError::Protocol(format!("bad PROXY source address {}", source)))?;
            if ip.is_ipv4() != (*family == "TCP4") {
                return Err(PiperError::Protocol(format!(
                    "PROXY {} header with address {}",
                    family, ip
                )));
            }
            let port: u16 = source_port
                .parse()
                .map_err(|_| {
                    PiperError::Protocol(format!("bad PROXY source port {}", source_port))
                })?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        _ => Err(PiperError::Protocol(format!("malformed PROXY v1 header: {}", line))),
    }
}

async fn read_v2<R>(reader: &mut R) -> PiperResult<Option<SocketAddr>>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = [0u8; 16];
    reader.read_exact(&mut header).await?;
    if header[..12] != V2_SIGNATURE {
        return Err(PiperError::Protocol("bad PROXY v2 signature".to_string()));
    }
    let length = u16::from_be_bytes([header[14], header[15]]) as usize;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    parse_v2(&header, &body)
}

fn parse_v2(header: &[u8; 16], body: &[u8]) -> PiperResult<Option<SocketAddr>> {
    let version = header[12] >> 4;
    let command = header[12] & 0x0F;
    if version != 2 {
        return Err(PiperError::Protocol(format!("PROXY v2 header with version {}", version)));
    }
    match command {
        0x0 => return Ok(None),
        0x1 => {}
        other => return Err(PiperError::Protocol(format!("unknown PROXY v2 command {}", other))),
    }

    // Only stream transports carry an address we use; TLVs after it are skipped.
    let family = header[13];
    match family {
        0x11 => {
            if body.len() < 12 {
                return Err(PiperError::Protocol("short PROXY v2 IPv4 block".to_string()));
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[8], body[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        0x21 => {
            if body.len() < 36 {
                return Err(PiperError::Protocol("short PROXY v2 IPv6 block".to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[32], body[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn v2(command: u8, family: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = V2_SIGNATURE.to_vec();
        packet.push(0x20 | command);
        packet.push(family);
        packet.extend_from_slice(&(body.len() as u16).to_be_bytes());
        packet.extend_from_slice(body);
        packet
    }

    #[tokio::test]
    async fn test_v1_tcp4_leaves_ssh_bytes() {
        let input = b"PROXY TCP4 192.0.2.10 198.51.100.1 51234 22\r\nSSH-2.0-client\r\n";
        let mut reader = BufReader::new(&input[..]);
        let addr = read_proxy_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(addr, "192.0.2.10:51234".parse::<SocketAddr>().unwrap());

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "SSH-2.0-client\r\n");
    }

    #[test]
    fn test_v1_variants() {
        assert_eq!(
            parse_v1(b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 22\r\n").unwrap(),
            Some("[2001:db8::1]:4000".parse().unwrap())
        );
        assert_eq!(parse_v1(b"PROXY UNKNOWN\r\n").unwrap(), None);
        assert!(parse_v1(b"PROXY TCP4 2001:db8::1 192.0.2.1 1 2\r\n").is_err());
        assert!(parse_v1(b"PROXY TCP4 192.0.2.1 192.0.2.2 1\r\n").is_err());
        assert!(parse_v1(b"PROXY TCP4 192.0.2.1 192.0.2.2 1 2\n").is_err());
    }

    #[tokio::test]
    async fn test_v2_ipv4_with_tlv() {
        let mut body = vec![203, 0, 113, 7, 10, 0, 0, 1];
        body.extend_from_slice(&40000u16.to_be_bytes());
        body.extend_from_slice(&22u16.to_be_bytes());
        body.extend_from_slice(&[0x04, 0x00, 0x01, 0xAA]);
        let mut input = v2(0x1, 0x11, &body);
        input.extend_from_slice(b"SSH-2.0-x\r\n");

        let mut reader = BufReader::new(&input[..]);
        let addr = read_proxy_header(&mut reader).await.unwrap();
        assert_eq!(addr, Some("203.0.113.7:40000".parse().unwrap()));
        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "SSH-2.0-x\r\n");
    }

    #[tokio::test]
    async fn test_v2_local_and_bad_signature() {
        let input = v2(0x0, 0x00, &[]);
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(read_proxy_header(&mut reader).await.unwrap(), None);

        let mut broken = v2(0x1, 0x11, &[0; 12]);
        broken[3] = 0xFF;
        let mut reader = BufReader::new(&broken[..]);
        assert!(read_proxy_header(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_no_header_consumes_nothing() {
        let input = b"SSH-2.0-OpenSSH_9.6\r\n";
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(read_proxy_header(&mut reader).await.unwrap(), None);
        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "SSH-2.0-OpenSSH_9.6\r\n");
    }

    #[tokio::test]
    async fn test_untrusted_peer_header_ignored() {
        let config = ProxyProtocolConfig::new(vec!["10.0.0.0/8".parse().unwrap()]);
        let input = b"PROXY TCP4 192.0.2.10 198.51.100.1 51234 22\r\n";
        let peer: SocketAddr = "192.0.2.99:1000".parse().unwrap();
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(resolve_remote_addr(&mut reader, peer, &config).await.unwrap(), peer);

        let trusted: SocketAddr = "[::ffff:10.1.2.3]:1000".parse().unwrap();
        assert!(config.allows(trusted.ip()));
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(
            resolve_remote_addr(&mut reader, trusted, &config).await.unwrap(),
            "192.0.2.10:51234".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_header_timeout_keeps_peer() {
        let (client, server) = tokio::io::duplex(64);
        let config = ProxyProtocolConfig {
            allowed_sources: vec!["127.0.0.0/8".parse().unwrap()],
            header_timeout: Duration::from_millis(50),
        };
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut reader = BufReader::new(server);
        let addr = resolve_remote_addr(&mut reader, peer, &config).await.unwrap();
        assert_eq!(addr, peer);
        drop(client);
    }
}
