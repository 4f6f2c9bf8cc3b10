//! Command handling for vantage.
//!
//! `run` assembles the proxy from configuration and serves until Ctrl-C.
//! The remaining subcommands are short maintenance operations on the
//! notary directory, the fingerprint cache and the local CA.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::ca::LocalCa;
use crate::cli::{CacheCommand, Commands, NotaryCommand};
use crate::config::Config;
use crate::net::TargetConnector;
use crate::proxy::{
    create_target_connector, InterceptionPolicy, LeafCertCache, PipelineContext,
    PipelineSettings, ProxyConfig, ProxyServer, VerdictBoard,
};
use crate::proxy::server::DEFAULT_REFRESH_INTERVAL;
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::trust::{
    BundleFetcher, CertificateCache, CertificateValidator, HttpsBundleFetcher,
    HttpsNotaryTransport, LocalPki, NotaryQuorum, NotaryRegistry,
};

/// Dispatch a parsed subcommand.
pub fn handle_command(command: &Commands, config: &Config, audit: Arc<AuditLogger>) -> Result<()> {
    match command {
        Commands::Run { .. } => run_proxy(config, audit),
        Commands::ImportBundle { path } => import_bundle(config, &audit, path),
        Commands::Notaries(cmd) => manage_notaries(config, cmd),
        Commands::Cache(cmd) => manage_cache(config, cmd),
        Commands::ExportCa { path } => export_ca(config, path.as_deref()),
    }
}

/// Build the target connector from configured timeouts.
fn target_connector(config: &Config) -> TargetConnector {
    TargetConnector::new(
        config.timeouts.direct_connect(),
        config.timeouts.proxied_connect(),
    )
    .with_race_budget(config.timeouts.race_budget())
}

/// Assemble everything the proxy needs from configuration.
///
/// Opens the cache and notary directory, loads or creates the local CA, and
/// wires the validator, policy and verdict board together.
pub fn build_proxy_config(config: &Config, audit: Arc<AuditLogger>) -> Result<ProxyConfig> {
    let listen = config.proxy.listen_addr()?;
    let upstream = config.proxy.upstream_proxy()?;

    let ca_dir = config.trust.ca_dir()?;
    let ca = Arc::new(
        LocalCa::load_or_generate(&ca_dir)
            .with_context(|| format!("Failed to load local CA from {:?}", ca_dir))?,
    );

    let cache_path = config.cache.path()?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let cache = Arc::new(
        CertificateCache::open(&cache_path, config.cache.enabled())
            .with_context(|| format!("Failed to open cache {:?}", cache_path))?,
    );

    let notary_dir = config.notaries.directory()?;
    let registry = Arc::new(
        NotaryRegistry::load(&notary_dir)
            .with_context(|| format!("Failed to load notaries from {:?}", notary_dir))?,
    );
    if registry.snapshot().iter().all(|r| !r.enabled) {
        warn!("No enabled notaries: every intercepted certificate will be distrusted");
    }

    let connector = target_connector(config);
    let transport = Arc::new(HttpsNotaryTransport::new(
        connector.clone(),
        upstream.clone(),
    ));
    let quorum = NotaryQuorum::new(
        registry.clone(),
        transport,
        config.timeouts.notary_query(),
    );
    let validator = CertificateValidator::new(cache, quorum, audit.clone());

    let local_pki = if config.trust.local_pki_anchors.is_empty() {
        None
    } else {
        let pki = LocalPki::from_pem_files(&config.trust.local_pki_anchors)
            .context("Failed to load local PKI anchors")?;
        info!("Loaded {} local trust anchor(s)", pki.anchor_count());
        Some(pki)
    };

    let ctx = Arc::new(PipelineContext {
        connector: connector.clone(),
        validator,
        leaf_certs: LeafCertCache::new(ca),
        target_tls: create_target_connector()?,
        local_pki,
        verdicts: Arc::new(VerdictBoard::default()),
        audit,
        settings: PipelineSettings {
            private_pki_exempt: config.proxy.private_pki_exempt(),
            upstream: upstream.clone(),
            connection_timeout: config.proxy.connection_timeout(),
        },
    });

    let policy = Arc::new(InterceptionPolicy::new(
        &config.proxy.whitelist,
        config.proxy.private_ip_exempt(),
        registry.clone(),
    ));

    let refresh_interval = config.notaries.refresh_interval();
    let fetcher: Option<Arc<dyn BundleFetcher>> = refresh_interval
        .map(|_| Arc::new(HttpsBundleFetcher::new(connector, upstream)) as Arc<dyn BundleFetcher>);

    Ok(ProxyConfig {
        listen,
        ctx,
        policy,
        registry,
        fetcher,
        refresh_interval: refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
    })
}

/// Run the proxy until interrupted.
fn run_proxy(config: &Config, audit: Arc<AuditLogger>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let proxy_config = build_proxy_config(config, audit)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = ProxyServer::bind(proxy_config, shutdown_rx)
            .await
            .context("Failed to bind proxy listener")?;
        eprintln!("vantage listening on {}", server.local_addr()?);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                let _ = shutdown_tx.send(true);
            }
        });

        server.run().await.context("Proxy server failed")
    })
}

/// Import a bundle file into the notary directory.
fn import_bundle(config: &Config, audit: &AuditLogger, path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let registry = NotaryRegistry::load(config.notaries.directory()?)?;
    let record = registry
        .import_bundle(&bytes)
        .with_context(|| format!("Failed to import bundle {:?}", path))?;

    audit.log(AuditEvent::NotaryBundleImport {
        name: record.name.clone(),
        hosts: record.notaries.len(),
    });
    println!(
        "Imported notary '{}' ({} host(s))",
        record.name,
        record.notaries.len()
    );
    Ok(())
}

fn manage_notaries(config: &Config, command: &NotaryCommand) -> Result<()> {
    let registry = NotaryRegistry::load(config.notaries.directory()?)?;
    match command {
        NotaryCommand::List => {
            let mut out = std::io::stdout().lock();
            let records = registry.list();
            if records.is_empty() {
                writeln!(out, "No notaries configured")?;
            }
            for record in records {
                let hosts: Vec<String> = record
                    .notaries
                    .iter()
                    .map(|n| format!("{}:{}", n.host, n.ssl_port))
                    .collect();
                writeln!(
                    out,
                    "{:<24} {:<8} {:<12} {}",
                    record.name,
                    if record.enabled { "enabled" } else { "disabled" },
                    record.region.as_deref().unwrap_or("-"),
                    hosts.join(", ")
                )?;
            }
        }
        NotaryCommand::Enable { name } => {
            registry.set_enabled(name, true)?;
            println!("Enabled notary '{}'", name);
        }
        NotaryCommand::Disable { name } => {
            registry.set_enabled(name, false)?;
            println!("Disabled notary '{}'", name);
        }
        NotaryCommand::Remove { name } => {
            registry.remove(name)?;
            println!("Removed notary '{}'", name);
        }
    }
    Ok(())
}

fn manage_cache(config: &Config, command: &CacheCommand) -> Result<()> {
    let path = config.cache.path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let cache = CertificateCache::open(&path, true)
        .with_context(|| format!("Failed to open cache {:?}", path))?;

    match command {
        CacheCommand::List => {
            let mut out = std::io::stdout().lock();
            for entry in cache.entries()? {
                writeln!(
                    out,
                    "{}:{}  {}  {}",
                    entry.host,
                    entry.port,
                    entry.fingerprint,
                    entry.cached_at.format("%Y-%m-%d %H:%M:%S")
                )?;
            }
        }
        CacheCommand::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} cached fingerprint(s)", removed);
        }
    }
    Ok(())
}

fn export_ca(config: &Config, path: Option<&Path>) -> Result<()> {
    let ca = LocalCa::load_or_generate(&config.trust.ca_dir()?)?;
    match path {
        Some(path) => {
            ca.export(path)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote CA certificate to {:?}", path);
        }
        None => print!("{}", ca.cert_pem()),
    }
    Ok(())
}
