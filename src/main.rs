use clap::Parser;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use dcn::config::{Config, LoggingConfig};
use dcn::network::tls::TlsConfig;
use dcn::{AppError, Client, RelayError};

#[derive(Parser, Debug)]
#[command(name = "dcnd")]
#[command(about = "Gossip relay node: sends stdin lines, prints delivered packets", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "dcnd.toml")]
    config: String,

    /// Accept inbound peers on this address
    #[arg(long)]
    listen: Option<String>,

    /// Peer to dial at startup (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// URL of a JSON host list to poll for new peers
    #[arg(long)]
    host_list: Option<String>,

    /// Do not verify peer certificates
    #[arg(long)]
    insecure: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_default(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);

    if let Err(e) = config.validate() {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    eprintln!("\n🚀 dcnd v{} ({})", env!("CARGO_PKG_VERSION"), config.node.name);
    eprintln!("═══════════════════════════════════════════════════════");

    if let Err(e) = run(config).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen) = &args.listen {
        config.network.listen_address = Some(listen.clone());
    }
    config.network.peers.extend(args.peers.iter().cloned());
    if let Some(url) = &args.host_list {
        config.network.host_list_url = Some(url.clone());
    }
    if args.insecure {
        config.tls.insecure_skip_verify = true;
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let tls = TlsConfig::from_settings(&config.tls).map_err(RelayError::from)?;
    let client = Client::new(config.network.clone(), tls).await?;

    if let Some(addr) = &config.network.listen_address {
        let bound = client.listen(addr).await?;
        tracing::info!("✓ Accepting peers on {}", bound);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = tokio::io::stdout();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("🛑 Shutdown signal received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => match client.send(line.into_bytes()).await {
                    Ok((delivered, id)) => {
                        tracing::info!("📤 Packet {} sent to {} peer(s)", id, delivered);
                    }
                    Err(e) => tracing::warn!("⚠️ Not sent: {}", e),
                },
                Ok(None) => {
                    tracing::debug!("stdin closed, relaying only");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            delivery = client.accept() => match delivery {
                Some(delivery) => {
                    let line = format!(
                        "{} {} {}\n",
                        delivery.hash,
                        delivery.peer,
                        String::from_utf8_lossy(&delivery.payload)
                    );
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
        }
    }

    client.close().await;
    Ok(())
}

fn setup_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries delivered packets, so logs go to stderr or a file
    let (writer, guard, to_file) = if config.output == "file" {
        let path = Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| "dcnd.log".into());
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
        (BoxMakeWriter::new(non_blocking), Some(guard), true)
    } else {
        (BoxMakeWriter::new(std::io::stderr), None, false)
    };

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd && !to_file => {
            // journald adds its own timestamp and hostname
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(!to_file)
                .with_target(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }

    guard
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
