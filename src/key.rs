use std::borrow::Cow;
use std::fmt;
use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Maximum key length memcached accepts on the wire.
pub const MAX_KEY_LENGTH: usize = 250;

/// A cache key.
///
/// The storage token is what goes on the wire; the routing token is what
/// the ring hashes. By default they are the same bytes — a distinct
/// routing token colocates related keys on one server. The optional
/// domain tag selects a codec namespace and labels metrics; it never
/// reaches the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    storage: Vec<u8>,
    routing: Option<Vec<u8>>,
    domain: Option<String>,
}

impl Key {
    /// Creates a key whose routing token equals its storage token.
    pub fn new(storage: impl Into<Vec<u8>>) -> Self {
        Key {
            storage: storage.into(),
            routing: None,
            domain: None,
        }
    }

    /// Overrides the routing token used for ring placement.
    pub fn with_routing_token(mut self, routing: impl Into<Vec<u8>>) -> Self {
        self.routing = Some(routing.into());
        self
    }

    /// Tags the key with a domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Bytes hashed by the consistent-hash ring.
    pub fn routing_token(&self) -> &[u8] {
        self.routing.as_deref().unwrap_or(&self.storage)
    }

    /// Bytes stored under on the server (pre-encoding).
    pub fn storage_token(&self) -> &[u8] {
        &self.storage
    }

    /// Domain tag, if any.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Whether the storage token must travel in base64 with the `b` flag:
    /// anything non-printable-ASCII, containing whitespace, or longer
    /// than the protocol limit.
    pub(crate) fn is_binary(&self) -> bool {
        self.storage.len() > MAX_KEY_LENGTH || !self.storage.iter().copied().all(is_key_char)
    }

    /// The token to put on the wire and whether the `b` flag goes with it.
    pub(crate) fn wire_token(&self) -> (Cow<'_, [u8]>, bool) {
        if self.is_binary() {
            (Cow::Owned(BASE64.encode(&self.storage).into_bytes()), true)
        } else {
            (Cow::Borrowed(&self.storage[..]), false)
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::new(s.into_bytes())
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key::new(b.to_vec())
    }
}

fn is_key_char(chr: u8) -> bool {
    chr > 32 && chr < 127
}

/// A memcached server endpoint. Identity for the hash ring and for pool
/// keying; hashed into the ketama continuum as `"{host}:{port}"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Hostname or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    const DEFAULT_PORT: u16 = 11211;

    /// Creates an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddress {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `host` (default port 11211) or
    /// `tcp://host:port`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let invalid = |msg: &str| {
            Error::Connect(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: {}", msg, s),
            ))
        };

        if s.contains("://") {
            let url = url::Url::parse(s).map_err(|_| invalid("failed to parse server address"))?;
            if url.scheme() != "tcp" {
                return Err(invalid("unsupported scheme in server address"));
            }
            let host = url
                .host_str()
                .ok_or_else(|| invalid("no host in server address"))?;
            return Ok(ServerAddress::new(host, url.port().unwrap_or(Self::DEFAULT_PORT)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| invalid("bad port"))?;
                Ok(ServerAddress::new(host, port))
            }
            None if !s.is_empty() => Ok(ServerAddress::new(s, Self::DEFAULT_PORT)),
            _ => Err(invalid("empty server address")),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ascii_key_goes_raw() {
        let key = Key::from("foo");
        let (token, binary) = key.wire_token();
        assert_eq!(&token[..], b"foo");
        assert!(!binary);
    }

    #[test]
    fn test_key_with_space_is_binary() {
        let key = Key::from("two words");
        let (token, binary) = key.wire_token();
        assert!(binary);
        assert_eq!(&token[..], BASE64.encode(b"two words").as_bytes());
    }

    #[test]
    fn test_unicode_key_is_binary() {
        let key = Key::from("🍺");
        let (token, binary) = key.wire_token();
        assert!(binary);
        assert_eq!(&token[..], b"8J+Nug==");
    }

    #[test]
    fn test_control_bytes_are_binary() {
        assert!(Key::new(b"a\r\nb".to_vec()).is_binary());
        assert!(Key::new(b"\x00".to_vec()).is_binary());
    }

    #[test]
    fn test_overlong_key_is_binary() {
        let key = Key::new(vec![b'x'; MAX_KEY_LENGTH + 1]);
        assert!(key.is_binary());
        let key = Key::new(vec![b'x'; MAX_KEY_LENGTH]);
        assert!(!key.is_binary());
    }

    #[test]
    fn test_routing_token_defaults_to_storage() {
        let key = Key::from("foo");
        assert_eq!(key.routing_token(), b"foo");
        let key = Key::from("foo:1").with_routing_token("foo");
        assert_eq!(key.routing_token(), b"foo");
        assert_eq!(key.storage_token(), b"foo:1");
    }

    #[test]
    fn test_parse_host_port() {
        let addr = ServerAddress::parse("localhost:11211").unwrap();
        assert_eq!(addr, ServerAddress::new("localhost", 11211));
        assert_eq!(addr.to_string(), "localhost:11211");
    }

    #[test]
    fn test_parse_tcp_scheme() {
        let addr = ServerAddress::parse("tcp://cache-1:11212").unwrap();
        assert_eq!(addr, ServerAddress::new("cache-1", 11212));
    }

    #[test]
    fn test_parse_bare_host_uses_default_port() {
        let addr = ServerAddress::parse("cache-1").unwrap();
        assert_eq!(addr.port, 11211);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(ServerAddress::parse("unix:///tmp/memcached.sock").is_err());
        assert!(ServerAddress::parse("").is_err());
    }
}
