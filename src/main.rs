use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_replay::config::Config;
use lora_replay::decode::progress::ProgressTracker;
use lora_replay::decode::DecodeOrchestrator;
use lora_replay::decoder::sandbox::CommandSandbox;
use lora_replay::decoder::DecoderRegistry;
use lora_replay::error::DecodeError;
use lora_replay::export::{self, ExportFormat};
use lora_replay::generator::{self, GeneratorParams};
use lora_replay::lorawan::keys::KeyStore;
use lora_replay::replay::{JobStatus, ReplayJobManager, ReplayLogLine, ReplayParams};
use lora_replay::scan::{scan_log, ScanIndex, ScanResult};
use lora_replay::store::{new_token, InMemoryTokenStore, TokenStore};
use lora_replay::udp;

/// How often the CLI polls a running replay
const POLL_INTERVAL: Duration = Duration::from_millis(600);

#[derive(Parser)]
#[command(name = "lora-replay")]
#[command(about = "Decrypt, decode and replay captured LoRaWAN uplink logs")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a JSON Lines uplink log and summarise it
    Scan { log: PathBuf },

    /// Decrypt and decode every uplink in a log
    Decode {
        log: PathBuf,
        /// Credentials file (defaults to [decode].credentials)
        #[arg(long)]
        keys: Option<PathBuf>,
        /// Decoder id: raw, builtin:<file>.js or file:<file>.js
        #[arg(long, default_value = "raw")]
        decoder: String,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        /// Export destination (defaults to decoded_payloads.<format>)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replay a log to a network server over Semtech UDP
    Replay {
        log: PathBuf,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Rewrite time/tmst/radio fields before sending
        #[arg(long)]
        override_rxpk: bool,
    },

    /// Write a synthetic ABP uplink log
    Generate(GenerateArgs),

    /// List available payload decoders
    Decoders,

    /// Run a local PUSH_DATA sink that ACKs and logs replayed frames
    Sink {
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, default_value = "generated_log.jsonl")]
    out: PathBuf,
    #[arg(long)]
    gateway_eui: Option<String>,
    #[arg(long)]
    dev_addr: Option<String>,
    #[arg(long)]
    nwk_s_key: Option<String>,
    #[arg(long)]
    app_s_key: Option<String>,
    #[arg(long)]
    payload_hex: Option<String>,
    #[arg(long)]
    fcnt_start: Option<u32>,
    #[arg(long)]
    frames: Option<u32>,
    /// EU868 frequency in MHz
    #[arg(long)]
    freq: Option<String>,
    #[arg(long)]
    datarate: Option<String>,
    #[arg(long)]
    coding_rate: Option<String>,
    #[arg(long)]
    f_port: Option<u8>,
    /// YYYY-MM-DDTHH:MM (UTC)
    #[arg(long)]
    start_time: Option<String>,
    #[arg(long)]
    interval_secs: Option<u32>,
}

impl GenerateArgs {
    fn params(&self) -> GeneratorParams {
        let defaults = GeneratorParams::default();
        GeneratorParams {
            gateway_eui: self.gateway_eui.clone().unwrap_or(defaults.gateway_eui),
            dev_addr: self.dev_addr.clone().unwrap_or(defaults.dev_addr),
            nwk_s_key: self.nwk_s_key.clone().unwrap_or(defaults.nwk_s_key),
            app_s_key: self.app_s_key.clone().unwrap_or(defaults.app_s_key),
            payload_hex: self.payload_hex.clone().unwrap_or(defaults.payload_hex),
            fcnt_start: self.fcnt_start.unwrap_or(defaults.fcnt_start),
            frames: self.frames.unwrap_or(defaults.frames),
            freq: self.freq.clone().unwrap_or(defaults.freq),
            datarate: self.datarate.clone().unwrap_or(defaults.datarate),
            coding_rate: self.coding_rate.clone().unwrap_or(defaults.coding_rate),
            f_port: self.f_port.unwrap_or(defaults.f_port),
            start_time: self.start_time.clone().unwrap_or(defaults.start_time),
            interval_secs: self.interval_secs.unwrap_or(defaults.interval_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-replay v{}", env!("CARGO_PKG_VERSION"));

    let scans: Arc<ScanIndex> = Arc::new(InMemoryTokenStore::new(config.cache.ttl()));

    match cli.command {
        Command::Scan { log } => {
            let (_, scan) = scan_file(&scans, &log).await?;
            print_lines(&scan.summary_lines());
        }
        Command::Decode {
            log,
            keys,
            decoder,
            format,
            out,
        } => {
            let keys_path = keys.unwrap_or_else(|| config.decode.credentials.clone());
            let out = out.unwrap_or_else(|| PathBuf::from(format.file_name()));
            run_decode(&config, &scans, &log, &keys_path, &decoder, format, &out).await?;
        }
        Command::Replay {
            log,
            host,
            port,
            delay_ms,
            override_rxpk,
        } => {
            let mut params = config.replay.params();
            if let Some(host) = host {
                params.host = host;
            }
            if let Some(port) = port {
                params.port = port;
            }
            if let Some(delay_ms) = delay_ms {
                params.delay_ms = delay_ms;
            }
            params.override_rxpk |= override_rxpk;
            run_replay(&config, &scans, &log, params).await?;
        }
        Command::Generate(args) => {
            let file = File::create(&args.out)
                .with_context(|| format!("Failed to create {:?}", args.out))?;
            let count = generator::write_log(&args.params(), BufWriter::new(file))?;
            println!("Wrote {} uplinks to {}", count, args.out.display());
        }
        Command::Decoders => {
            for decoder in registry(&config).list() {
                println!("{}\t{}", decoder.id, decoder.label);
            }
        }
        Command::Sink { bind } => {
            let bind = bind.unwrap_or_else(|| config.sink.bind.clone());
            info!("Press Ctrl+C to stop.");
            tokio::select! {
                result = udp::run_sink(&bind) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
            }
        }
    }

    Ok(())
}

fn registry(config: &Config) -> DecoderRegistry {
    let sandbox = CommandSandbox::node(config.decode.node_binary.clone(), config.decode.timeout());
    DecoderRegistry::new(
        config.decode.builtin_dir.clone(),
        config.decode.upload_dir(),
        Arc::new(sandbox),
    )
}

/// Scan a log file and park the result in the scan index
async fn scan_file(scans: &Arc<ScanIndex>, path: &Path) -> anyhow::Result<(String, Arc<ScanResult>)> {
    let file = File::open(path).with_context(|| format!("Failed to open log {:?}", path))?;
    let scan = match scan_log(BufReader::new(file)) {
        Ok(scan) => Arc::new(scan),
        Err(lora_replay::error::ScanError::NoValidRecords { errors }) => {
            let summary = ScanResult {
                errors,
                ..Default::default()
            };
            print_lines(&summary.summary_lines());
            anyhow::bail!("No valid uplinks found in {:?}", path);
        }
        Err(e) => return Err(e.into()),
    };
    let token = scans.insert(scan.clone()).await;
    Ok((token, scan))
}

async fn run_decode(
    config: &Config,
    scans: &Arc<ScanIndex>,
    log: &Path,
    keys_path: &Path,
    decoder_id: &str,
    format: ExportFormat,
    out: &Path,
) -> anyhow::Result<()> {
    let (token, _) = scan_file(scans, log).await?;
    let scan = scans
        .get(&token)
        .await
        .context("Scan result expired before decoding")?;

    let keys = if keys_path.exists() {
        KeyStore::load(keys_path)?
    } else {
        warn!("Credentials file {:?} not found", keys_path);
        KeyStore::new()
    };
    let decoder = registry(config).load(decoder_id)?;

    let ttl = config.cache.ttl();
    let tracker = ProgressTracker::new(Arc::new(InMemoryTokenStore::new(ttl)));
    let orchestrator = DecodeOrchestrator::new(Arc::new(InMemoryTokenStore::new(ttl)));

    let progress_id = new_token();
    let handle = tracker.start("cli", &progress_id, scan.records.len()).await;
    let reporter = {
        let tracker = tracker.clone();
        let progress_id = progress_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                match tracker.get("cli", &progress_id).await {
                    Some(progress) if !progress.done => {
                        info!("Decoding {}/{}", progress.completed, progress.total)
                    }
                    _ => break,
                }
            }
        })
    };

    let result = orchestrator
        .decode(&scan, &keys, &decoder, Some(handle))
        .await;
    reporter.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(DecodeError::MissingKeys(missing)) => {
            println!("Missing session keys for: {}", missing.join(", "));
            anyhow::bail!("Add keys for every DevAddr in {:?} and retry", keys_path);
        }
        Err(e) => return Err(e.into()),
    };

    println!("Decoded={}, errors={}", outcome.decoded, outcome.errors);
    let rows = orchestrator
        .rows(&outcome.export_token)
        .await
        .context("Decode export expired")?;
    let file = File::create(out).with_context(|| format!("Failed to create {:?}", out))?;
    export::write_rows(&rows, format, BufWriter::new(file))?;
    println!("Wrote {} rows to {}", rows.len(), out.display());
    Ok(())
}

async fn run_replay(
    config: &Config,
    scans: &Arc<ScanIndex>,
    log: &Path,
    params: ReplayParams,
) -> anyhow::Result<()> {
    let (token, _) = scan_file(scans, log).await?;
    let scan = scans
        .get(&token)
        .await
        .context("Scan result expired before replay")?;

    let manager = ReplayJobManager::new(Arc::new(InMemoryTokenStore::new(config.cache.ttl())));
    let job = manager
        .start(Arc::new(scan.records.clone()), params)
        .await?;
    info!("Replay started, press Ctrl+C to stop");

    let mut since = 0;
    let mut stop_requested = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                manager.stop(&job).await?;
            }
        }

        let Some(status) = manager.status(&job, since).await else {
            println!("Replay job expired");
            break;
        };
        for line in &status.lines {
            println!("{}", format_line(line));
        }
        since = status.count;

        if status.status != JobStatus::Running {
            println!(
                "Replay {}: sent {}, errors {}, {}/{} records processed",
                status.status, status.sent, status.errors, status.current_index, status.total
            );
            break;
        }
    }
    Ok(())
}

fn format_line(line: &ReplayLogLine) -> String {
    let index = line
        .index
        .map(|i| format!("#{}", i))
        .unwrap_or_else(|| "--".to_string());
    let fcnt = line
        .fcnt
        .map(|f| format!(" fcnt={}", f))
        .unwrap_or_default();
    let freq = line
        .freq
        .map(|f| format!(" freq={}", f))
        .unwrap_or_default();
    format!(
        "{} {:?} {}{}{} {}",
        index, line.status, line.gateway, fcnt, freq, line.message
    )
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}
