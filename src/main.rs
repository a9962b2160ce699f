//! httpmq - HTTP to MQTT publish bridge
//!
//! Usage:
//!   httpmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -b, --bind <ADDR>            HTTP bind address (default: [::1]:8080)
//!       --broker <URI>           Broker URI (default: tcp://[::1]:1883)
//!       --prefix <PREFIX>        Topic prefix (default: /)
//!       --qos <N>                Publish QoS (0, 1 or 2)
//!       --client-id <ID>         MQTT client identifier
//!       --username <NAME>        MQTT username
//!       --password-file <FILE>   File holding the MQTT password
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Subscriber};
use tracing_subscriber::filter::{filter_fn, FilterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use httpmq::bridge::{BridgeConfig, BridgeHandler, HttpServer, MESSAGE_TARGET};
use httpmq::config::Config;
use httpmq::mqtt::{BrokerClient, ClientOptions};
use httpmq::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// httpmq - publish HTTP request bodies to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "httpmq")]
#[command(version)]
#[command(about = "Publish HTTP PUT/POST bodies to an MQTT broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Broker URI (tcp://, mqtt://, ssl://, tls://, mqtts://)
    #[arg(long)]
    broker: Option<String>,

    /// Prefix joined in front of every request path
    #[arg(long)]
    prefix: Option<String>,

    /// QoS used for every publish (0, 1 or 2)
    #[arg(long)]
    qos: Option<u8>,

    /// MQTT client identifier
    #[arg(long)]
    client_id: Option<String>,

    /// MQTT username
    #[arg(long)]
    username: Option<String>,

    /// File holding the MQTT password ($VAR and ${VAR} are expanded)
    #[arg(long)]
    password_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI flags take precedence over the file and the environment
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.http.bind = bind;
        }
        if let Some(prefix) = &self.prefix {
            config.http.prefix = prefix.clone();
        }
        if let Some(uri) = &self.broker {
            config.broker.uri = uri.clone();
        }
        if let Some(qos) = self.qos {
            config.broker.qos = qos;
        }
        if let Some(client_id) = &self.client_id {
            config.broker.client_id = client_id.clone();
        }
        if let Some(username) = &self.username {
            config.broker.username = Some(username.clone());
        }
        if let Some(password_file) = &self.password_file {
            config.broker.password_file = Some(password_file.clone());
        }
        if let Some(level) = self.log_level {
            config.log.level = level.as_str().to_string();
        }
    }
}

/// Message lines go to stdout, everything else to stderr.
/// `RUST_LOG` wins over the configured level when set.
fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    tracing_subscriber::registry()
        .with(log_layers(env_filter, std::io::stdout, std::io::stderr))
        .try_init()?;
    Ok(())
}

/// The level filter only applies to the stderr layer; message lines are
/// always printed, without colour.
fn log_layers<S, O, E>(env_filter: EnvFilter, out: O, err: E) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    O: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    E: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let messages = fmt::layer()
        .with_writer(out)
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .compact()
        .with_filter(filter_fn(|meta| meta.target() == MESSAGE_TARGET));

    let events = fmt::layer()
        .with_writer(err)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .with_filter(env_filter.and(filter_fn(|meta| meta.target() != MESSAGE_TARGET)));

    messages.and_then(events)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // File (or defaults) plus HTTPMQ__* environment overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    init_logging(&config.log.level)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let password = match config.broker.load_password() {
        Ok(password) => password,
        Err(e) => {
            error!("Cannot read password file: {}", e);
            std::process::exit(1);
        }
    };

    let options = ClientOptions::from_config(&config.broker, password)?;

    info!("Starting httpmq");
    info!("  HTTP address: {}", config.http.bind);
    info!("  Topic prefix: {}", config.http.prefix);
    info!(
        "  Broker: {} (MQTT {}, qos={})",
        options.addr,
        options.protocol_version,
        config.broker.qos()
    );
    if options.client_id.is_empty() {
        info!("  Client ID: <assigned by broker>");
    } else {
        info!("  Client ID: {}", options.client_id);
    }

    let metrics = Arc::new(Metrics::new());
    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);

        let metrics_server = MetricsServer::new(metrics.clone(), config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let client = Arc::new(BrokerClient::new(options).with_metrics(metrics.clone()));
    if let Err(e) = client.connect().await {
        error!("Failed to connect to broker: {}", e);
        std::process::exit(1);
    }

    let handler = BridgeHandler::new(BridgeConfig::from_config(&config), client.clone())
        .with_metrics(metrics);

    let server = match HttpServer::bind(config.http.bind, handler).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind {}: {}", config.http.bind, e);
            std::process::exit(1);
        }
    };

    server.run(shutdown_signal()).await?;

    client.disconnect(config.broker.disconnect_grace).await;
    info!("Stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_message_lines_ignore_log_level() {
        let out = Capture::default();
        let err = Capture::default();
        let (o, e) = (out.clone(), err.clone());
        let subscriber = tracing_subscriber::registry().with(log_layers(
            EnvFilter::new("error"),
            move || o.clone(),
            move || e.clone(),
        ));

        tracing::subscriber::with_default(subscriber, || {
            info!(target: MESSAGE_TARGET, "[MSG] sensors/temp: 21.5");
            info!("below the level");
            error!("at the level");
        });

        let stdout = out.contents();
        assert!(stdout.contains("[MSG] sensors/temp: 21.5"));
        assert!(!stdout.contains('\x1b'));
        assert!(!stdout.contains("at the level"));

        let stderr = err.contents();
        assert!(stderr.contains("at the level"));
        assert!(!stderr.contains("below the level"));
        assert!(!stderr.contains("[MSG]"));
    }
}
