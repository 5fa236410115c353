use crate::error::TunnelError;
use base64::{Engine as _, engine::general_purpose};
use http::HeaderMap;
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use log::warn;
use zeroize::Zeroizing;

const BASIC_SCHEME: &str = "basic";

/// Raw credential header of a request, `proxy-authorization` first.
pub fn credential_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(PROXY_AUTHORIZATION)
        .or_else(|| headers.get(AUTHORIZATION))
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

/// Checks Basic credentials against the single configured `user:pass` pair.
pub struct AuthGate {
    expected: Zeroizing<String>,
}

impl AuthGate {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            expected: Zeroizing::new(format!("{}:{}", username, password)),
        }
    }

    pub fn from_credential_string(credentials: String) -> Self {
        Self {
            expected: Zeroizing::new(credentials),
        }
    }

    pub fn validate(&self, headers: &HeaderMap) -> Result<(), TunnelError> {
        let header = credential_header(headers).ok_or(TunnelError::AuthMissing)?;
        self.validate_value(&header)
    }

    pub fn validate_value(&self, header: &str) -> Result<(), TunnelError> {
        let mut parts = header.split_whitespace();
        let scheme = parts.next().unwrap_or("");
        if !scheme.eq_ignore_ascii_case(BASIC_SCHEME) {
            warn!("Rejected proxy credentials with unsupported scheme: {}", scheme);
            return Err(TunnelError::AuthUnsupportedScheme {
                scheme: scheme.to_string(),
            });
        }

        let plain = decode_credentials(parts.next().unwrap_or(""));
        if plain.as_str() != self.expected.as_str() {
            warn!("Rejected proxy credentials: {}", plain.as_str());
            return Err(TunnelError::AuthInvalidCredentials {
                credentials: plain.to_string(),
            });
        }

        Ok(())
    }
}

// Standard or URL-safe alphabet, padded or not. Undecodable input yields an
// empty string, which never matches a configured credential.
fn decode_credentials(token: &str) -> Zeroizing<String> {
    let bytes = general_purpose::STANDARD
        .decode(token)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(token))
        .or_else(|_| general_purpose::URL_SAFE.decode(token))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(token))
        .unwrap_or_default();
    Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned())
}
