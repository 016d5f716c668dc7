use anyhow::{Context, Result, anyhow};
use rustls::RootCertStore;
use rustls_pemfile::certs;
use std::{fs::File, io::BufReader};
use tracing::{info, warn};

use crate::config::UpstreamConfig;

/// Builds the client config used for https forwarded URLs from the configured CA bundle.
pub fn load_upstream_tls_config(
    upstream: &UpstreamConfig,
) -> Result<Option<rustls::ClientConfig>> {
    let Some(ca_file) = upstream.ca_file.as_deref() else {
        return Ok(None);
    };

    let file = File::open(ca_file)
        .with_context(|| format!("Failed to open CA bundle file: {ca_file}"))?;
    let ca_certs = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA bundle file")?;

    if ca_certs.is_empty() {
        return Err(anyhow!("No certificates found in CA bundle file"));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(ca_certs);
    if ignored > 0 {
        warn!(ca_file, ignored, "Ignored unusable certificates in CA bundle");
    }
    if added == 0 {
        return Err(anyhow!("No usable certificates in CA bundle file"));
    }
    info!(ca_file, trusted = added, "Upstream TLS configured");

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Some(config))
}
