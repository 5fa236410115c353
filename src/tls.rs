use crate::error::TunnelError;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// ALPN ids offered by the client-facing listener, HTTP/2 first.
pub const LISTENER_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Create the listener's TLS configuration from certificate and private key files
pub fn server_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, TunnelError> {
    let mut private_key_file = BufReader::new(
        File::open(private_key_path)
            .map_err(|e| TunnelError::Config(format!("Failed to open private key file: {}", e)))?,
    );

    let certs = load_certificates(Path::new(cert_path))?;
    if certs.is_empty() {
        return Err(TunnelError::Config("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut private_key_file)
        .map_err(|e| TunnelError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| TunnelError::Config("No valid private key found".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| TunnelError::Config(format!("Failed to create TLS config: {}", e)))?;
    config.alpn_protocols = LISTENER_ALPN.iter().map(|id| id.to_vec()).collect();

    Ok(config)
}

/// Client configuration for upstream TLS: bundled web roots plus any extra CA files.
/// ALPN is left empty here and filled in per tunnel.
pub fn client_config(extra_ca_files: &[PathBuf]) -> Result<ClientConfig, TunnelError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for path in extra_ca_files {
        for cert in load_certificates(path)? {
            root_store.add(cert).map_err(|e| {
                TunnelError::Config(format!("Invalid CA certificate in {}: {}", path.display(), e))
            })?;
        }
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

fn load_certificates(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TunnelError> {
    let mut cert_file = BufReader::new(File::open(path).map_err(|e| {
        TunnelError::Config(format!("Failed to open certificate file {}: {}", path.display(), e))
    })?);

    rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Config(format!("Failed to read certificate: {}", e)))
}
