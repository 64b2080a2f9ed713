use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use interpose::reqlog::DEFAULT_CAPTURE_LIMIT;
use interpose::{Error, MitmConfig, MitmProxy, ProxyServer, RequestLog};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// TLS-intercepting HTTP/1.1 forward proxy
#[derive(Parser, Debug)]
#[command(name = "interpose")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Address to accept proxy clients on
  #[arg(short, long, default_value = "0.0.0.0:8080", env = "INTERPOSE_LISTEN")]
  listen: SocketAddr,

  /// Root CA private key (PEM), created if missing
  #[arg(long, default_value = "./key", env = "INTERPOSE_CA_KEY")]
  key: PathBuf,

  /// Root CA certificate (PEM), created if missing
  #[arg(long, default_value = "./cert", env = "INTERPOSE_CA_CERT")]
  cert: PathBuf,

  /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
  #[arg(long, default_value = "info", env = "INTERPOSE_LOG_LEVEL")]
  log_level: String,

  /// Largest request or response body captured by the request log
  #[arg(long, default_value_t = DEFAULT_CAPTURE_LIMIT, env = "INTERPOSE_CAPTURE_LIMIT")]
  capture_limit: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(&cli);

  match run(cli).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}

fn init_logging(cli: &Cli) {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer().with_target(false))
    .init();
}

async fn run(cli: Cli) -> interpose::Result<()> {
  tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting interpose");

  let config = MitmConfig {
    ca_key_path: cli.key,
    ca_cert_path: cli.cert,
    ..MitmConfig::default()
  };
  let cert = config.ca_cert_path.clone();
  let mut proxy = MitmProxy::from_config(config).await?;
  tracing::info!(
    cert = %cert.display(),
    "install this root certificate in your client to trust intercepted connections"
  );

  RequestLog::new(proxy.correlation_store())
    .capture_limit(cli.capture_limit)
    .install(&mut proxy);

  let server = ProxyServer::bind(cli.listen, Arc::new(proxy)).await?;
  let shutdown = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::warn!("cannot listen for ctrl-c: {}", e);
      std::future::pending::<()>().await;
    }
  };
  match server.serve(shutdown).await {
    Err(Error::ServerClosed) | Ok(()) => Ok(()),
    Err(e) => Err(e),
  }
}
