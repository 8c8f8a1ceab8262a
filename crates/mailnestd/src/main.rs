use anyhow::Context;
use clap::Parser;
use mailnestd::{MailNest, ServerConfig};
use tokio::signal::unix::SignalKind;

/// mailnest daemon: an in-memory SMTP/IMAP/POP3 server for testing.
///
/// All state is lost on exit. Exits non-zero when a listener fails
/// to bind or the configuration is malformed.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration properties, `key=value`. Repeatable.
    #[arg(long = "prop", short = 'D', value_name = "KEY=VALUE")]
    props: Vec<String>,

    /// Start the given protocols (comma separated: smtp, imap, pop3,
    /// smtps, imaps, pop3s, or "all") on their standard ports.
    #[arg(long)]
    setup: Option<String>,

    /// Like --setup, but on the test ports (standard + 3000).
    #[arg(long)]
    setup_test: Option<String>,

    /// Comma-separated users, `login:password[@domain]`.
    #[arg(long)]
    users: Option<String>,

    /// Accept any credentials and auto-provision unknown users.
    #[arg(long)]
    auth_disabled: bool,

    /// Enable protocol traces.
    #[arg(long)]
    verbose: bool,
}

fn build_config(opts: &Opt) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::default();
    if let Some(setup) = &opts.setup {
        for part in setup.split(',').filter(|p| !p.is_empty()) {
            config.apply_property(&format!("setup.{part}"), "")?;
        }
    }
    if let Some(setup) = &opts.setup_test {
        for part in setup.split(',').filter(|p| !p.is_empty()) {
            config.apply_property(&format!("setup.test.{part}"), "")?;
        }
    }
    if let Some(users) = &opts.users {
        config.apply_property("users", users)?;
    }
    if opts.auth_disabled {
        config.apply_property("auth.disabled", "true")?;
    }
    if opts.verbose {
        config.verbose = true;
    }
    for prop in &opts.props {
        let (key, value) = prop
            .split_once('=')
            .with_context(|| format!("property {prop:?} is not key=value"))?;
        config.apply_property(key, value)?;
    }
    if config.listeners.is_empty() {
        config.apply_property("setup.all", "")?;
    }
    Ok(config)
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default_filter = if verbose {
        "mailnestd=trace,mailnest_store=trace"
    } else {
        "mailnestd=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(
        std::env::var("MAILNEST_LOG")
            .as_deref()
            .unwrap_or(default_filter),
    )?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    let config = build_config(&opts).context("configuration")?;
    init_logging(config.verbose)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build runtime")?
        .block_on(run(config))
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let server = MailNest::new(config).context("construct server")?;
    server.start().await.context("start listeners")?;
    // This log line is what external tooling waits for.
    tracing::info!("initialization complete");

    let mut sig_term =
        tokio::signal::unix::signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    tokio::select! {
        _ = sig_term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    tracing::info!("shutdown requested, stopping listeners");
    server.stop().await;
    Ok(())
}
