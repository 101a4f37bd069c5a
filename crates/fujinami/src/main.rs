use anyhow::Context;
use clap::Parser;
use dns_resolver::HickoryResolver;
use fujinami::config::{CapabilityName, RelayConfig, StoreConfig};
use fujinami::logging::{DiagnosticFormat, LoggingConfig};
use fujinami::pseudonym::PseudonymStore;
use fujinami::session::RelayContext;
use fujinami::smtp_server::SmtpListener;
use fujinami::spf::{FixedSpf, MailAuthSpf, SpfDisposition, SpfEvaluator};
use fujinami::sqlite_store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(about = "anonymizing SMTP relay daemon")]
struct Opt {
    /// Configuration file to load
    #[arg(long, default_value = "/etc/fujinami/fujinami.toml")]
    config: PathBuf,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

fn open_store(config: &StoreConfig) -> anyhow::Result<PseudonymStore> {
    Ok(match config {
        StoreConfig::Sqlite { path } => PseudonymStore::new(Arc::new(SqliteStore::open(path)?)),
        StoreConfig::Memory => {
            tracing::warn!("using the in-memory store; pseudonyms will not survive a restart");
            PseudonymStore::memory()
        }
    })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let _log_flusher = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: "FUJINAMI_LOG",
        default_filter: "fujinami=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("a default crypto provider was already installed");
    }

    let config = RelayConfig::load(&opts.config)?;

    let tls = fujinami::tls_helpers::make_server_config(
        &config.server_name,
        &config.listener.tls_private_key,
        &config.listener.tls_certificate,
    )?;

    let spf: Arc<dyn SpfEvaluator> = if config.capabilities.contains(&CapabilityName::SpfCheck) {
        Arc::new(MailAuthSpf::from_system_conf(&config.server_name)?)
    } else {
        Arc::new(FixedSpf(SpfDisposition::None))
    };
    let resolver = Arc::new(HickoryResolver::from_system_conf()?);
    let store = open_store(&config.store)?;

    let ctx = Arc::new(RelayContext::new(config, resolver, store.clone(), spf)?);
    let listener = SmtpListener::bind(ctx, tls).await?;

    tokio::select! {
        result = listener.run() => {
            if let Err(err) = result {
                tracing::error!("listener failed: {err:#}");
            }
        }
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            tracing::info!("shutdown requested");
        }
    }

    store.close().await.context("closing store")?;
    tracing::info!("shutdown completed");
    Ok(())
}
