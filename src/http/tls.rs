//! TLS configuration and certificate loading.

use axum_server::tls_rustls::RustlsConfig;

use crate::config::SslOptions;
use crate::error::GatewayError;

/// Load the HTTPS listener's certificate and key (PEM files).
pub async fn load_tls_config(ssl: &SslOptions) -> Result<RustlsConfig, GatewayError> {
    if !ssl.cert.exists() {
        return Err(GatewayError::tls(format!("Certificate file not found: {:?}", ssl.cert)));
    }
    if !ssl.key.exists() {
        return Err(GatewayError::tls(format!("Private key file not found: {:?}", ssl.key)));
    }

    RustlsConfig::from_pem_file(&ssl.cert, &ssl.key)
        .await
        .map_err(|e| GatewayError::tls(format!("Failed to load {:?} / {:?}: {}", ssl.cert, ssl.key, e)))
}
