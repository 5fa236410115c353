//! Request shapes accepted by the gateway and their normalization into a
//! single [`TunnelRequest`].

use crate::auth::{AuthGate, credential_header};
use crate::error::TunnelError;
use bytes::Bytes;
use http::uri::Authority;
use http::{HeaderMap, Method};

/// Header carrying the client's ALPN candidates for the upstream TLS session.
pub const ALPN_HINT_HEADER: &str = "alpnprotocols";

const SECURE_SCHEME: &str = "tls:";

pub const SECURE_DEFAULT_PORT: u16 = 443;
pub const PLAIN_DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    SingleStreamConnect,
    MultiplexedExtendedConnect,
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelMode::SingleStreamConnect => write!(f, "HTTP/1.1 CONNECT"),
            TunnelMode::MultiplexedExtendedConnect => write!(f, "HTTP/2 CONNECT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHint {
    Plain,
    Secure,
}

impl ProtocolHint {
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolHint::Plain => PLAIN_DEFAULT_PORT,
            ProtocolHint::Secure => SECURE_DEFAULT_PORT,
        }
    }

    /// Maps an explicit `:protocol` value; `tls` and `tls:` are secure, anything else is plain.
    pub fn from_protocol_override(protocol: &str) -> Self {
        let mut scheme = protocol.to_string();
        if !scheme.ends_with(':') {
            scheme.push(':');
        }
        if scheme == SECURE_SCHEME {
            ProtocolHint::Secure
        } else {
            ProtocolHint::Plain
        }
    }
}

/// Canonical form of a tunnel request, whatever shape it arrived in.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub mode: TunnelMode,
    pub auth_header_value: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    pub protocol_hint: ProtocolHint,
    pub alpn_protocols: Vec<String>,
    pub pending_bytes: Bytes,
}

impl TunnelRequest {
    pub fn target(&self) -> String {
        if self.target_host.contains(':') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }
}

/// An HTTP/1.1 `CONNECT host:port` handshake read off a byte stream.
#[derive(Debug, Clone)]
pub struct SingleStreamConnect {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    /// Bytes received after the blank line that ends the request head.
    pub buffered: Bytes,
}

/// A CONNECT request on an HTTP/2 stream, with its pseudo-header metadata.
#[derive(Debug, Clone)]
pub struct ExtendedConnect {
    pub method: Method,
    pub authority: Option<String>,
    pub protocol: Option<String>,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub enum IncomingRequest {
    SingleStream(SingleStreamConnect),
    Multiplexed(ExtendedConnect),
}

pub struct RequestNormalizer<'a> {
    auth: &'a AuthGate,
}

impl<'a> RequestNormalizer<'a> {
    pub fn new(auth: &'a AuthGate) -> Self {
        Self { auth }
    }

    pub fn normalize(&self, request: IncomingRequest) -> Result<TunnelRequest, TunnelError> {
        match request {
            IncomingRequest::SingleStream(request) => self.normalize_single_stream(request),
            IncomingRequest::Multiplexed(request) => self.normalize_multiplexed(request),
        }
    }

    fn normalize_multiplexed(&self, request: ExtendedConnect) -> Result<TunnelRequest, TunnelError> {
        self.auth.validate(&request.headers)?;

        if request.method != Method::CONNECT {
            return Err(TunnelError::MethodNotAllowed {
                method: request.method.to_string(),
            });
        }

        let (alpn_protocols, mut protocol_hint) = match alpn_hint(&request.headers) {
            Some(hint) => (split_alpn_tolerant(&hint), ProtocolHint::Secure),
            None => (Vec::new(), ProtocolHint::Plain),
        };
        if let Some(protocol) = request.protocol.as_deref() {
            protocol_hint = ProtocolHint::from_protocol_override(protocol);
        }

        let authority = request.authority.unwrap_or_default();
        let (target_host, target_port) = parse_authority(&authority, protocol_hint)?;

        Ok(TunnelRequest {
            mode: TunnelMode::MultiplexedExtendedConnect,
            auth_header_value: credential_header(&request.headers),
            target_host,
            target_port,
            protocol_hint,
            alpn_protocols,
            pending_bytes: Bytes::new(),
        })
    }

    fn normalize_single_stream(
        &self,
        request: SingleStreamConnect,
    ) -> Result<TunnelRequest, TunnelError> {
        if request.method != Method::CONNECT.as_str() {
            return Err(TunnelError::MethodNotAllowed {
                method: request.method,
            });
        }

        self.auth.validate(&request.headers)?;

        if request.target.starts_with('/') {
            return Err(TunnelError::LeadingSlashRejected {
                target: request.target,
            });
        }

        let (alpn_protocols, protocol_hint) = match alpn_hint(&request.headers) {
            Some(hint) => (split_alpn_strict(&hint), ProtocolHint::Secure),
            None => (Vec::new(), ProtocolHint::Plain),
        };

        let (target_host, target_port) = parse_authority(&request.target, protocol_hint)?;

        Ok(TunnelRequest {
            mode: TunnelMode::SingleStreamConnect,
            auth_header_value: credential_header(&request.headers),
            target_host,
            target_port,
            protocol_hint,
            alpn_protocols,
            pending_bytes: request.buffered,
        })
    }
}

fn alpn_hint(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ALPN_HINT_HEADER)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

// HTTP/2 path: "h2, http/1.1" and "h2,http/1.1" both give ["h2", "http/1.1"].
fn split_alpn_tolerant(hint: &str) -> Vec<String> {
    hint.split(',')
        .map(|name| name.strip_prefix(' ').unwrap_or(name).to_string())
        .collect()
}

// HTTP/1.1 path: split on commas only, names are kept as written.
fn split_alpn_strict(hint: &str) -> Vec<String> {
    hint.split(',').map(str::to_string).collect()
}

/// Splits `host[:port]`, falling back to the protocol's standard port.
pub fn parse_authority(authority: &str, hint: ProtocolHint) -> Result<(String, u16), TunnelError> {
    let parsed: Authority = authority
        .parse()
        .map_err(|e| TunnelError::InvalidAuthority(format!("{}: {}", authority, e)))?;

    let raw_host = parsed.host();
    let host = raw_host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TunnelError::InvalidAuthority(format!("{}: empty host", authority)));
    }

    // Whatever follows the host (userinfo already stripped) is ":port" or nothing
    let host_and_port = parsed.as_str().rsplit('@').next().unwrap_or("");
    let port = match host_and_port[raw_host.len()..].strip_prefix(':') {
        None | Some("") => hint.default_port(),
        Some(port) => match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                return Err(TunnelError::InvalidAuthority(format!(
                    "{}: invalid port",
                    authority
                )));
            }
        },
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const VALID_AUTH: &str = "Basic dXNlcm5hbWU6cGFzc3dvcmQ=";

    fn gate() -> AuthGate {
        AuthGate::new("username", "password")
    }

    fn authed_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", HeaderValue::from_static(VALID_AUTH));
        headers
    }

    fn multiplexed(authority: &str) -> ExtendedConnect {
        ExtendedConnect {
            method: Method::CONNECT,
            authority: Some(authority.to_string()),
            protocol: None,
            headers: authed_headers(),
        }
    }

    fn single_stream(target: &str) -> SingleStreamConnect {
        SingleStreamConnect {
            method: "CONNECT".to_string(),
            target: target.to_string(),
            headers: authed_headers(),
            buffered: Bytes::new(),
        }
    }

    #[test]
    fn test_multiplexed_alpn_hint_with_spaces() {
        let mut request = multiplexed("example.com");
        request
            .headers
            .insert(ALPN_HINT_HEADER, HeaderValue::from_static("h2, http/1.1"));

        let auth = gate();
        let normalized = RequestNormalizer::new(&auth)
            .normalize(IncomingRequest::Multiplexed(request))
            .unwrap();

        assert_eq!(normalized.alpn_protocols, vec!["h2", "http/1.1"]);
        assert_eq!(normalized.protocol_hint, ProtocolHint::Secure);
        assert_eq!(normalized.target_port, 443);
        assert_eq!(normalized.mode, TunnelMode::MultiplexedExtendedConnect);
        assert!(normalized.pending_bytes.is_empty());
        assert_eq!(normalized.auth_header_value.as_deref(), Some(VALID_AUTH));
    }

    #[test]
    fn test_multiplexed_defaults_to_plain() {
        let auth = gate();
        let normalized = RequestNormalizer::new(&auth)
            .normalize(IncomingRequest::Multiplexed(multiplexed("example.com")))
            .unwrap();

        assert_eq!(normalized.protocol_hint, ProtocolHint::Plain);
        assert!(normalized.alpn_protocols.is_empty());
        assert_eq!(normalized.target_host, "example.com");
        assert_eq!(normalized.target_port, 80);
    }

    #[test]
    fn test_protocol_override_wins_over_alpn_default() {
        let auth = gate();
        let normalizer = RequestNormalizer::new(&auth);

        let mut request = multiplexed("example.com");
        request.headers.insert(ALPN_HINT_HEADER, HeaderValue::from_static("h2"));
        request.protocol = Some("tcp".to_string());
        let normalized = normalizer.normalize(IncomingRequest::Multiplexed(request)).unwrap();
        assert_eq!(normalized.protocol_hint, ProtocolHint::Plain);
        assert_eq!(normalized.target_port, 80);
        assert_eq!(normalized.alpn_protocols, vec!["h2"]);

        let mut request = multiplexed("example.com");
        request.protocol = Some("tls".to_string());
        let normalized = normalizer.normalize(IncomingRequest::Multiplexed(request)).unwrap();
        assert_eq!(normalized.protocol_hint, ProtocolHint::Secure);
        assert_eq!(normalized.target_port, 443);
    }

    #[test]
    fn test_protocol_override_mapping() {
        assert_eq!(ProtocolHint::from_protocol_override("tls:"), ProtocolHint::Secure);
        assert_eq!(ProtocolHint::from_protocol_override("tls"), ProtocolHint::Secure);
        assert_eq!(ProtocolHint::from_protocol_override("tcp"), ProtocolHint::Plain);
        assert_eq!(ProtocolHint::from_protocol_override("websocket"), ProtocolHint::Plain);
        assert_eq!(ProtocolHint::from_protocol_override("TLS"), ProtocolHint::Plain);
    }

    #[test]
    fn test_multiplexed_rejects_other_methods() {
        let mut request = multiplexed("example.com");
        request.method = Method::GET;

        let auth = gate();
        match RequestNormalizer::new(&auth).normalize(IncomingRequest::Multiplexed(request)) {
            Err(TunnelError::MethodNotAllowed { method }) => assert_eq!(method, "GET"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_multiplexed_checks_credentials_before_method() {
        let mut request = multiplexed("example.com");
        request.method = Method::GET;
        request.headers.clear();

        let auth = gate();
        let result = RequestNormalizer::new(&auth).normalize(IncomingRequest::Multiplexed(request));
        assert!(matches!(result, Err(TunnelError::AuthMissing)));
    }

    #[test]
    fn test_single_stream_alpn_split_on_comma_only() {
        let mut request = single_stream("example.com:8443");
        request
            .headers
            .insert(ALPN_HINT_HEADER, HeaderValue::from_static("h2, http/1.1"));

        let auth = gate();
        let normalized = RequestNormalizer::new(&auth)
            .normalize(IncomingRequest::SingleStream(request))
            .unwrap();

        assert_eq!(normalized.alpn_protocols, vec!["h2", " http/1.1"]);
        assert_eq!(normalized.protocol_hint, ProtocolHint::Secure);
        assert_eq!(normalized.target_port, 8443);
    }

    #[test]
    fn test_single_stream_carries_buffered_bytes() {
        let mut request = single_stream("example.com");
        request.buffered = Bytes::from_static(b"\x16\x03\x01early");

        let auth = gate();
        let normalized = RequestNormalizer::new(&auth)
            .normalize(IncomingRequest::SingleStream(request))
            .unwrap();

        assert_eq!(normalized.mode, TunnelMode::SingleStreamConnect);
        assert_eq!(normalized.pending_bytes.as_ref(), b"\x16\x03\x01early");
        assert_eq!(normalized.protocol_hint, ProtocolHint::Plain);
        assert_eq!(normalized.target_port, 80);
    }

    #[test]
    fn test_single_stream_leading_slash() {
        let auth = gate();
        match RequestNormalizer::new(&auth).normalize(IncomingRequest::SingleStream(single_stream("/index.html"))) {
            Err(TunnelError::LeadingSlashRejected { target }) => assert_eq!(target, "/index.html"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_single_stream_checks_credentials_before_target() {
        let mut request = single_stream("/index.html");
        request.headers.clear();

        let auth = gate();
        let result = RequestNormalizer::new(&auth).normalize(IncomingRequest::SingleStream(request));
        assert!(matches!(result, Err(TunnelError::AuthMissing)));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8080", ProtocolHint::Plain).unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            parse_authority("example.com", ProtocolHint::Secure).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:9000", ProtocolHint::Plain).unwrap(),
            ("::1".to_string(), 9000)
        );
        assert!(parse_authority("", ProtocolHint::Plain).is_err());
        assert!(parse_authority("example.com:0", ProtocolHint::Plain).is_err());
        assert!(parse_authority("example.com:70000", ProtocolHint::Plain).is_err());
    }

    #[test]
    fn test_target_formats_ipv6() {
        let auth = gate();
        let normalized = RequestNormalizer::new(&auth)
            .normalize(IncomingRequest::SingleStream(single_stream("[::1]:9000")))
            .unwrap();
        assert_eq!(normalized.target(), "[::1]:9000");
    }
}
