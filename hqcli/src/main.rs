mod config;
mod tui;

use clap::Parser;
use config::{config_path, get_default_config_toml, load_config};
use libhandle_storm::{
    profile_url, HandleQueue, LogSink, ProbeOutcome, ProbeResult, ProberStatus, Proxy,
    ProxySource, StaticSource, Supervisor,
};
use rand::Rng;
use serde::Serialize;
use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::EnvFilter;

const HANDLE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "hq")]
#[command(about = "Handle Query - probe handle availability through a rotating proxy pool", long_about = None)]
struct Args {
    /// Handles to check (a leading @ is ignored)
    handles: Vec<String>,

    /// Output results as NDJSON stream (one JSON object per line)
    #[arg(long, short = 'j')]
    ndjson: bool,

    /// Read handles from stdin, one per line
    #[arg(long)]
    stdin: bool,

    /// Keep feeding random handles once the given ones run out
    #[arg(long)]
    generate: bool,

    /// Comma-separated handle lengths used by --generate
    #[arg(long, value_delimiter = ',', default_value = "4,5,6")]
    lengths: Vec<usize>,

    /// Seed the pool with a proxy (host:port, host:port:user:pass or a URL); repeatable
    #[arg(long = "proxy", value_name = "PROXY")]
    proxies: Vec<String>,

    /// Number of concurrent probes
    #[arg(long)]
    concurrency: Option<usize>,

    /// Read configuration from this file instead of the default path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the default config to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
enum AvailabilityStatus {
    Available,
    Taken,
    Error,
}

#[derive(Debug, Clone, Serialize)]
struct HandleCheckResult {
    handle: String,
    url: String,
    available: Option<bool>,
    status: AvailabilityStatus,
    proxy: String,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl HandleCheckResult {
    fn new(result: &ProbeResult, lookup_base: &str) -> Self {
        let (available, status, error) = match &result.outcome {
            ProbeOutcome::Available => (Some(true), AvailabilityStatus::Available, None),
            ProbeOutcome::Taken => (Some(false), AvailabilityStatus::Taken, None),
            ProbeOutcome::Inconclusive { reason } => {
                (None, AvailabilityStatus::Error, Some(reason.clone()))
            }
        };

        Self {
            handle: result.handle.clone(),
            url: profile_url(lookup_base, &result.handle),
            available,
            status,
            proxy: result.proxy.to_string(),
            duration_ms: result.duration.as_millis() as u64,
            error,
        }
    }
}

/// Trims, drops a leading `@` and lowercases. Returns `None` for anything
/// that cannot be a handle.
fn normalize_handle(raw: &str) -> Option<String> {
    let handle = raw.trim().trim_start_matches('@').to_lowercase();
    let valid = (2..=24).contains(&handle.len())
        && handle
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');
    valid.then_some(handle)
}

fn random_handle<R: Rng>(rng: &mut R, lengths: &[usize]) -> String {
    let len = if lengths.is_empty() {
        5
    } else {
        lengths[rng.gen_range(0..lengths.len())]
    };
    (0..len)
        .map(|_| HANDLE_ALPHABET[rng.gen_range(0..HANDLE_ALPHABET.len())] as char)
        .collect()
}

struct Feed {
    handles: Vec<String>,
    stdin: bool,
    generate: bool,
    lengths: Vec<usize>,
}

/// Pushes handles into the queue in order: arguments, stdin, then the
/// generator. Dropping the sender at the end closes the queue.
fn spawn_feeder(feed: Feed, tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        for handle in feed.handles {
            if tx.send(handle).await.is_err() {
                return;
            }
        }

        if feed.stdin {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match normalize_handle(&line) {
                        Some(handle) => {
                            if tx.send(handle).await.is_err() {
                                return;
                            }
                        }
                        None if line.trim().is_empty() => {}
                        None => tracing::warn!(input = %line.trim(), "Skipping invalid handle"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        }

        if feed.generate {
            loop {
                let handle = random_handle(&mut rand::thread_rng(), &feed.lengths);
                if tx.send(handle).await.is_err() {
                    return;
                }
            }
        }
    });
}

fn init_logging(to_file: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hq=info,libhandle_storm=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if !to_file {
        builder.with_writer(io::stderr).init();
        return;
    }

    // The TUI owns the terminal, so logs go to a file.
    let file = dirs::cache_dir()
        .map(|dir| dir.join("hq"))
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            std::fs::File::create(dir.join("hq.log")).ok()
        });
    match file {
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        None => builder.with_writer(io::sink).init(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", get_default_config_toml());
        return Ok(());
    }

    if args.write_default_config {
        if let Some(path) = config_path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, get_default_config_toml())?;
            println!("Default config written to: {}", path.display());
        } else {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
        return Ok(());
    }

    init_logging(!args.ndjson);

    let mut storm = load_config(args.config.as_deref())?.into_storm_config();
    if let Some(concurrency) = args.concurrency {
        storm.probe.max_concurrent_probes = concurrency.max(1);
    }
    let lookup_base = storm.probe.lookup_base.clone();

    let mut seeds = Vec::new();
    for raw in &args.proxies {
        match raw.parse::<Proxy>() {
            Ok(proxy) => seeds.push(proxy),
            Err(e) => {
                eprintln!("Error: invalid proxy '{}': {}", raw, e);
                std::process::exit(1);
            }
        }
    }
    let extra_sources: Vec<Arc<dyn ProxySource>> = if seeds.is_empty() {
        Vec::new()
    } else {
        vec![Arc::new(StaticSource::new("command line", seeds))]
    };

    let mut handles = Vec::new();
    for raw in &args.handles {
        match normalize_handle(raw) {
            Some(handle) => handles.push(handle),
            None => eprintln!("Warning: skipping invalid handle '{}'", raw),
        }
    }

    if args.ndjson && handles.is_empty() && !args.stdin && !args.generate {
        eprintln!("Error: Handles, --stdin or --generate required in NDJSON mode");
        std::process::exit(1);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (handles_tx, queue) = HandleQueue::channel(QUEUE_CAPACITY);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor::from_config(
            storm,
            extra_sources,
            Arc::new(LogSink),
            Arc::new(queue),
            results_tx,
        )?;

        let feed = Feed {
            handles,
            stdin: args.stdin,
            generate: args.generate,
            lengths: args.lengths,
        };

        if args.ndjson {
            spawn_feeder(feed, handles_tx);
            run_ndjson(supervisor, results_rx, lookup_base).await
        } else {
            // The TUI keeps a sender for manually entered handles.
            spawn_feeder(feed, handles_tx.clone());
            tui::run_tui(supervisor, handles_tx, results_rx, lookup_base).await
        }
    })
}

fn print_result(result: &ProbeResult, lookup_base: &str) -> io::Result<()> {
    if let Ok(json) = serde_json::to_string(&HandleCheckResult::new(result, lookup_base)) {
        println!("{}", json);
        io::stdout().flush()?;
    }
    Ok(())
}

async fn run_ndjson(
    supervisor: Supervisor,
    mut results: mpsc::UnboundedReceiver<ProbeResult>,
    lookup_base: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut status = supervisor.subscribe_status();
    supervisor.launch();

    tokio::select! {
        _ = supervisor.ready() => {}
        _ = tokio::signal::ctrl_c() => {
            supervisor.shutdown().await;
            return Ok(());
        }
    }

    let health = supervisor.health();
    tracing::info!(proxies = health.total, "Pool ready, starting prober");
    supervisor.start();

    loop {
        tokio::select! {
            Some(result) = results.recv() => print_result(&result, &lookup_base)?,
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() == ProberStatus::Stopped {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    supervisor.shutdown().await;
    while let Ok(result) = results.try_recv() {
        print_result(&result, &lookup_base)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;

    #[test]
    fn normalizes_handles() {
        assert_eq!(normalize_handle("  @Nova_01 "), Some("nova_01".to_string()));
        assert_eq!(normalize_handle("a.b"), Some("a.b".to_string()));
        assert_eq!(normalize_handle("x"), None);
        assert_eq!(normalize_handle("has space"), None);
        assert_eq!(normalize_handle(""), None);
    }

    #[test]
    fn generated_handles_use_requested_lengths() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let handle = random_handle(&mut rng, &[4, 6]);
            assert!(handle.len() == 4 || handle.len() == 6);
            assert!(handle.bytes().all(|b| HANDLE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn ndjson_record_for_inconclusive_result() {
        let result = ProbeResult {
            handle: "nova".to_string(),
            outcome: ProbeOutcome::Inconclusive {
                reason: "Timeout".to_string(),
            },
            proxy: Proxy::new("10.0.0.1", 8080).with_credentials("u", "secret"),
            duration: Duration::from_millis(1500),
        };

        let json = serde_json::to_value(HandleCheckResult::new(&result, "https://example.com/"))
            .unwrap();
        assert_eq!(json["url"], "https://example.com/@nova");
        assert_eq!(json["status"], "error");
        assert_eq!(json["available"], serde_json::Value::Null);
        assert_eq!(json["error"], "Timeout");
        assert_eq!(json["duration_ms"], 1500);
        assert!(!json["proxy"].as_str().unwrap().contains("secret"));
    }
}
