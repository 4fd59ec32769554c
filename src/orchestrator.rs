//! Proxy orchestration and lifecycle management.
//!
//! This module builds the shared stores from configuration, starts the proxy
//! listener and the control socket, and tears both down on Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::cli::Cli;
use crate::config::Config;
use crate::control::{ControlHandler, ControlServer};
use crate::proxy::{PolicyStore, ProxyServerBuilder};
use crate::telemetry::AuditLogger;

/// Create the audit logger, falling back to a null logger without syslog.
pub fn create_audit_logger(disabled: bool) -> Arc<AuditLogger> {
    if disabled {
        return Arc::new(AuditLogger::new_null());
    }
    match AuditLogger::new() {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!("Audit logging disabled: {}", e);
            Arc::new(AuditLogger::new_null())
        }
    }
}

/// Run the proxy until Ctrl-C.
pub fn run_proxy(cli: &Cli, config: &Config) -> Result<()> {
    let audit = create_audit_logger(cli.no_audit);

    let policy = Arc::new(
        PolicyStore::from_config(&config.policy).context("Invalid policy in configuration")?,
    );
    let cache = config
        .cache
        .is_enabled()
        .then(|| Arc::new(CacheStore::new(config.cache.limits())));
    info!(
        "Loaded {} policy rules, cache {}",
        policy.rules().len(),
        if cache.is_some() { "enabled" } else { "disabled" }
    );

    let builder = ProxyServerBuilder::from_settings(&config.proxy)
        .context("Invalid proxy settings")?
        .policy(policy.clone())
        .cache(cache.clone())
        .audit(audit.clone());

    // Setup shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build tokio runtime for proxy
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async move {
        let server = builder
            .bind(shutdown_rx.clone())
            .await
            .context("Failed to start proxy listener")?;
        let listen = server.local_addr()?;

        let socket_path = config.control.socket_path();
        let control = ControlServer::bind(&socket_path).context("Failed to start control socket")?;
        let handler = ControlHandler::new(policy, cache, audit);

        let control_handle = tokio::spawn(control.serve(handler, shutdown_rx.clone()));
        let proxy_handle = tokio::spawn(server.run());

        eprintln!(
            "webproxy listening on {} (control socket {})",
            listen,
            socket_path.display()
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Received Ctrl-C, shutting down");
        let _ = shutdown_tx.send(true);

        match proxy_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Proxy server error: {}", e),
            Err(e) => warn!("Proxy task failed: {}", e),
        }
        match control_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Control socket error: {}", e),
            Err(e) => warn!("Control socket task failed: {}", e),
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_audit_is_null() {
        assert!(create_audit_logger(true).is_null());
    }
}
