//! rustls connections for the PostgreSQL pools.
//!
//! Both the configuration store and the spatial store go through
//! [`establish_tls_connection`] unless `no_tls` (or `CITYCAT_NO_TLS=1`) is set.
//! The root store is read from the system once and shared by every pooled
//! connection.

use std::sync::{Arc, LazyLock};

use diesel::ConnectionError;
use diesel_async::AsyncPgConnection;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use super::util::redact_url_password;

static CLIENT_CONFIG: LazyLock<Result<ClientConfig, String>> = LazyLock::new(load_client_config);

fn load_client_config() -> Result<ClientConfig, String> {
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Error loading system certificates: {}", e);
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(ignored, "Skipped unparsable system certificates");
    }
    if added == 0 {
        return Err("no usable system certificates for PostgreSQL TLS".to_string());
    }
    debug!(roots = added, "Loaded PostgreSQL TLS roots");

    // Explicit provider: another dependency may enable a second one.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("TLS protocol setup failed: {}", e))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// `custom_setup` callback for the diesel-async pool manager.
///
/// Errors name the server with its password redacted.
pub fn establish_tls_connection(
    url: &str,
) -> BoxFuture<'_, diesel::ConnectionResult<AsyncPgConnection>> {
    async move {
        let config = CLIENT_CONFIG.as_ref().map_err(|e| {
            ConnectionError::BadConnection(format!(
                "TLS setup for {} failed: {}",
                redact_url_password(url),
                e
            ))
        })?;
        let (client, conn) = tokio_postgres::connect(url, MakeRustlsConnect::new(config.clone()))
            .await
            .map_err(|e| {
                ConnectionError::BadConnection(format!("{}: {}", redact_url_password(url), e))
            })?;

        AsyncPgConnection::try_from_client_and_connection(client, conn).await
    }
    .boxed()
}
