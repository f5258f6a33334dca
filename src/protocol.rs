//! SOCKS5 wire structures (RFC 1928).
//!
//! Everything here is pure: functions take byte slices and produce values, or
//! take values and produce bytes. Decoders return the number of bytes they
//! consumed so callers can keep whatever the client pipelined after a frame.

// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+
//
// +----+-----+-------+------+----------+----------+
// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
// +----+-----+-------+------+----------+----------+
// | 1  |  1  | X'00' |  1   | Variable |    2     |
// +----+-----+-------+------+----------+----------+
//
// +----+------+------+----------+----------+----------+
// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
// +----+------+------+----------+----------+----------+
// | 2  |  1   |  1   | Variable |    2     | Variable |
// +----+------+------+----------+----------+----------+

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_GSSAPI: u8 = 0x01;
pub const METHOD_PASSWORD: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const RESERVED: u8 = 0x00;

/// Host part of a SOCKS5 address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// A SOCKS5 address: host plus big-endian port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddressSpec {
    pub host: Host,
    pub port: u16,
}

impl AddressSpec {
    pub fn new(host: Host, port: u16) -> Self {
        AddressSpec { host, port }
    }

    /// `0.0.0.0:0`, used in replies when no better address is known.
    pub fn unspecified() -> Self {
        AddressSpec::new(Host::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// The socket address for IP hosts. Domains need the resolver.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::Ipv4(ip) => Some(SocketAddr::V4(SocketAddrV4::new(*ip, self.port))),
            Host::Ipv6(ip) => Some(SocketAddr::V6(SocketAddrV6::new(*ip, self.port, 0, 0))),
            Host::Domain(_) => None,
        }
    }

    /// Decodes `ATYP | ADDR | PORT` from the start of `buf`.
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf.first().ok_or(Error::Truncated {
            expected: 1,
            actual: 0,
        })?;

        let (host, addr_len) = match atyp {
            ATYP_IPV4 => {
                ensure_len(buf, 1 + 4 + 2)?;
                let octets: [u8; 4] = [buf[1], buf[2], buf[3], buf[4]];
                (Host::Ipv4(Ipv4Addr::from(octets)), 4)
            }
            ATYP_IPV6 => {
                ensure_len(buf, 1 + 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                (Host::Ipv6(Ipv6Addr::from(octets)), 16)
            }
            ATYP_DOMAIN => {
                ensure_len(buf, 2)?;
                let len = buf[1] as usize;
                ensure_len(buf, 2 + len + 2)?;
                let name = std::str::from_utf8(&buf[2..2 + len]).map_err(|_| Error::Domain)?;
                (Host::Domain(name.to_owned()), 1 + len)
            }
            other => return Err(Error::AddressType(other)),
        };

        let port_at = 1 + addr_len;
        let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);
        Ok((AddressSpec { host, port }, port_at + 2))
    }

    /// Encodes `ATYP | ADDR | PORT`. Only domain names carry a length byte.
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        match &self.host {
            Host::Ipv4(ip) => {
                out.put_u8(ATYP_IPV4);
                out.put_slice(&ip.octets());
            }
            Host::Ipv6(ip) => {
                out.put_u8(ATYP_IPV6);
                out.put_slice(&ip.octets());
            }
            Host::Domain(name) => {
                let len = u8::try_from(name.len()).map_err(|_| Error::Domain)?;
                out.put_u8(ATYP_DOMAIN);
                out.put_u8(len);
                out.put_slice(name.as_bytes());
            }
        }
        out.put_u16(self.port);
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        match &self.host {
            Host::Ipv4(_) => 1 + 4 + 2,
            Host::Ipv6(_) => 1 + 16 + 2,
            Host::Domain(name) => 1 + 1 + name.len() + 2,
        }
    }
}

impl From<SocketAddr> for AddressSpec {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => AddressSpec::new(Host::Ipv4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => AddressSpec::new(Host::Ipv4(v4), v6.port()),
                None => AddressSpec::new(Host::Ipv6(*v6.ip()), v6.port()),
            },
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Host::Ipv4(v4),
            IpAddr::V6(v6) => Host::Ipv6(v6),
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Host::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

fn ensure_len(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::Truncated {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Method selection message sent first by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

pub fn decode_handshake(buf: &[u8]) -> Result<(HandshakeRequest, usize)> {
    ensure_len(buf, 2)?;
    let version = buf[0];
    let count = buf[1] as usize;
    ensure_len(buf, 2 + count)?;

    let request = HandshakeRequest {
        version,
        methods: buf[2..2 + count].to_vec(),
    };
    Ok((request, 2 + count))
}

/// Rejects any protocol version other than SOCKS5.
pub fn check_version(version: u8) -> Result<()> {
    if version != SOCKS5_VERSION {
        return Err(Error::Version(version));
    }
    Ok(())
}

pub fn encode_handshake_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Command> {
        match code {
            CMD_CONNECT => Some(Command::Connect),
            CMD_BIND => Some(Command::Bind),
            CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u8,
    pub command: Command,
    pub destination: AddressSpec,
}

/// Decodes a request. The reserved byte is checked before anything that
/// follows it; an unknown command is reported only once the whole frame has
/// been seen.
pub fn decode_connect_request(buf: &[u8]) -> Result<(ConnectRequest, usize)> {
    ensure_len(buf, 4)?;
    let version = buf[0];
    let command = buf[1];
    if buf[2] != RESERVED {
        return Err(Error::Reserved(buf[2]));
    }

    let (destination, addr_len) = AddressSpec::decode(&buf[3..])?;
    let command = Command::from_code(command).ok_or(Error::Command(command))?;

    let request = ConnectRequest {
        version,
        command,
        destination,
    };
    Ok((request, 3 + addr_len))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unassigned(u8),
}

impl Reply {
    pub fn code(self) -> u8 {
        match self {
            Reply::Succeeded => REPLY_SUCCEEDED,
            Reply::GeneralFailure => REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed => REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable => REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused => REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired => REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported => REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::Unassigned(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Reply {
        match code {
            REPLY_SUCCEEDED => Reply::Succeeded,
            REPLY_GENERAL_FAILURE => Reply::GeneralFailure,
            REPLY_CONNECTION_NOT_ALLOWED => Reply::ConnectionNotAllowed,
            REPLY_NETWORK_UNREACHABLE => Reply::NetworkUnreachable,
            REPLY_HOST_UNREACHABLE => Reply::HostUnreachable,
            REPLY_CONNECTION_REFUSED => Reply::ConnectionRefused,
            REPLY_TTL_EXPIRED => Reply::TtlExpired,
            REPLY_COMMAND_NOT_SUPPORTED => Reply::CommandNotSupported,
            REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Reply::AddressTypeNotSupported,
            _ => Reply::Unassigned(code),
        }
    }
}

impl From<&io::Error> for Reply {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::PermissionDenied => Reply::ConnectionNotAllowed,
            io::ErrorKind::AddrNotAvailable => Reply::HostUnreachable,
            _ => Reply::NetworkUnreachable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectReply {
    pub reply: Reply,
    pub bound: AddressSpec,
}

impl ConnectReply {
    pub fn new(reply: Reply, bound: AddressSpec) -> Self {
        ConnectReply { reply, bound }
    }
}

pub fn encode_connect_reply(reply: &ConnectReply) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(3 + reply.bound.encoded_len());
    out.put_u8(SOCKS5_VERSION);
    out.put_u8(reply.reply.code());
    out.put_u8(RESERVED);
    reply.bound.encode(&mut out)?;
    Ok(out.freeze())
}

/// Header of a datagram relayed through a UDP association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: AddressSpec,
}

impl UdpHeader {
    pub fn new(address: AddressSpec) -> Self {
        UdpHeader { frag: 0, address }
    }
}

/// Decodes a datagram header; the payload starts at the returned offset.
pub fn decode_udp_envelope(buf: &[u8]) -> Result<(UdpHeader, usize)> {
    ensure_len(buf, 4)?;
    if buf[0] != RESERVED {
        return Err(Error::Reserved(buf[0]));
    }
    if buf[1] != RESERVED {
        return Err(Error::Reserved(buf[1]));
    }

    let frag = buf[2];
    let (address, addr_len) = AddressSpec::decode(&buf[3..])?;
    Ok((UdpHeader { frag, address }, 3 + addr_len))
}

pub fn encode_udp_envelope(header: &UdpHeader, payload: &[u8]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(3 + header.address.encoded_len() + payload.len());
    out.put_u8(RESERVED);
    out.put_u8(RESERVED);
    out.put_u8(header.frag);
    header.address.encode(&mut out)?;
    out.put_slice(payload);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_handshake() {
        let (request, consumed) = decode_handshake(&[0x05, 0x02, 0x02, 0x00]).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(request.version, SOCKS5_VERSION);
        assert_eq!(request.methods, vec![METHOD_PASSWORD, METHOD_NO_AUTH]);
        assert!(request.offers(METHOD_NO_AUTH));
        assert!(!request.offers(METHOD_GSSAPI));
    }

    #[test]
    fn test_check_version() {
        assert!(check_version(SOCKS5_VERSION).is_ok());
        let err = check_version(0x04).unwrap_err();
        assert!(matches!(err, Error::Version(0x04)));
        assert_eq!(err.reply(), Reply::GeneralFailure);
    }

    #[test]
    fn test_decode_handshake_zero_methods() {
        let (request, consumed) = decode_handshake(&[0x05, 0x00]).unwrap();
        assert_eq!(consumed, 2);
        assert!(request.methods.is_empty());
    }

    #[test]
    fn test_decode_handshake_keeps_trailing_bytes() {
        let buf = [0x05, 0x01, 0x00, 0x05, 0x01, 0x00];
        let (_, consumed) = decode_handshake(&buf).unwrap();
        assert_eq!(&buf[consumed..], &[0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_decode_handshake_truncated() {
        assert!(matches!(
            decode_handshake(&[0x05]),
            Err(Error::Truncated {
                expected: 2,
                actual: 1
            })
        ));
        assert!(matches!(
            decode_handshake(&[0x05, 0x03, 0x00]),
            Err(Error::Truncated {
                expected: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_handshake_reply() {
        assert_eq!(encode_handshake_reply(METHOD_NO_AUTH), [0x05, 0x00]);
        assert_eq!(encode_handshake_reply(METHOD_NO_ACCEPTABLE), [0x05, 0xff]);
    }

    #[test]
    fn test_connect_request_ipv4() {
        let buf = [0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
        let (request, consumed) = decode_connect_request(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.destination.to_string(), "127.0.0.1:80");

        let reply = ConnectReply::new(Reply::Succeeded, request.destination);
        let encoded = encode_connect_reply(&reply).unwrap();
        assert_eq!(&encoded[3..], &buf[3..]);
    }

    #[test]
    fn test_connect_request_ipv6() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x04];
        let octets: Vec<u8> = (1..=16).collect();
        buf.extend_from_slice(&octets);
        buf.extend_from_slice(&443u16.to_be_bytes());

        let (request, consumed) = decode_connect_request(&buf).unwrap();
        assert_eq!(consumed, 22);
        assert!(matches!(request.destination.host, Host::Ipv6(_)));
        assert_eq!(request.destination.port, 443);

        let reply = ConnectReply::new(Reply::Succeeded, request.destination);
        let encoded = encode_connect_reply(&reply).unwrap();
        assert_eq!(&encoded[3..], &buf[3..]);
    }

    #[test]
    fn test_connect_request_domain() {
        let mut buf = vec![0x05, 0x03, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&[0x1f, 0x90]);

        let (request, consumed) = decode_connect_request(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(request.command, Command::UdpAssociate);
        assert_eq!(
            request.destination,
            AddressSpec::new(Host::Domain("example.com".into()), 8080)
        );
    }

    #[test]
    fn test_connect_request_reserved() {
        let buf = [0x05, 0x01, 0x01, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
        assert!(matches!(decode_connect_request(&buf), Err(Error::Reserved(0x01))));
    }

    #[test]
    fn test_connect_request_errors() {
        let truncated = [0x05, 0x01, 0x00, 0x01, 0x7f, 0x00];
        assert!(matches!(
            decode_connect_request(&truncated),
            Err(Error::Truncated { .. })
        ));

        let bad_atyp = [0x05, 0x01, 0x00, 0x02, 0x00, 0x00];
        assert!(matches!(
            decode_connect_request(&bad_atyp),
            Err(Error::AddressType(0x02))
        ));

        let bad_cmd = [0x05, 0x09, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
        assert!(matches!(
            decode_connect_request(&bad_cmd),
            Err(Error::Command(0x09))
        ));

        let bad_domain = [0x05, 0x01, 0x00, 0x03, 0x02, 0xff, 0xfe, 0x00, 0x50];
        assert!(matches!(decode_connect_request(&bad_domain), Err(Error::Domain)));
    }

    #[test]
    fn test_reply_length_prefix_only_for_domain() {
        let ipv4 = ConnectReply::new(Reply::Succeeded, "10.0.0.1:1080".parse::<SocketAddr>().unwrap().into());
        let encoded = encode_connect_reply(&ipv4).unwrap();
        assert_eq!(&encoded[..], &[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x04, 0x38]);

        let domain = ConnectReply::new(
            Reply::HostUnreachable,
            AddressSpec::new(Host::Domain("a.io".into()), 80),
        );
        let encoded = encode_connect_reply(&domain).unwrap();
        assert_eq!(
            &encoded[..],
            &[0x05, 0x04, 0x00, 0x03, 4, b'a', b'.', b'i', b'o', 0x00, 0x50]
        );
    }

    #[test]
    fn test_reply_rejects_long_domain() {
        let name = "a".repeat(256);
        let reply = ConnectReply::new(Reply::Succeeded, AddressSpec::new(Host::Domain(name), 1));
        assert!(matches!(encode_connect_reply(&reply), Err(Error::Domain)));
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(Reply::TtlExpired.code(), 0x06);
        assert_eq!(Reply::from_code(0x05), Reply::ConnectionRefused);
        assert_eq!(Reply::from_code(0x09), Reply::Unassigned(0x09));

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(Reply::from(&refused), Reply::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(Reply::from(&timed_out), Reply::TtlExpired);
    }

    #[test]
    fn test_udp_envelope() {
        let header = UdpHeader::new("192.168.1.2:53".parse::<SocketAddr>().unwrap().into());
        let encoded = encode_udp_envelope(&header, b"query").unwrap();
        assert_eq!(&encoded[..4], &[0x00, 0x00, 0x00, 0x01]);

        let (decoded, offset) = decode_udp_envelope(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&encoded[offset..], b"query");
    }

    #[test]
    fn test_udp_envelope_errors() {
        assert!(matches!(
            decode_udp_envelope(&[0x00, 0x01, 0x00, 0x01]),
            Err(Error::Reserved(0x01))
        ));
        assert!(matches!(
            decode_udp_envelope(&[0x00, 0x00, 0x00]),
            Err(Error::Truncated { .. })
        ));

        let fragmented = [0x00, 0x00, 0x02, 0x01, 1, 2, 3, 4, 0x00, 0x35, 0xaa];
        let (header, offset) = decode_udp_envelope(&fragmented).unwrap();
        assert_eq!(header.frag, 2);
        assert_eq!(offset, 10);
    }

    #[test]
    fn test_address_from_mapped_ipv6() {
        let addr: SocketAddr = "[::ffff:10.1.2.3]:99".parse().unwrap();
        let spec = AddressSpec::from(addr);
        assert_eq!(spec.host, Host::Ipv4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(spec.socket_addr(), Some("10.1.2.3:99".parse().unwrap()));
    }
}
