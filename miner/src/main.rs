mod cpu;
mod summary;

use clap::Parser;
use colored::*;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use cpu::CpuBackend;
use quarry_core::{DeviceParams, Engine, EngineConfig, PoolConfig, Strategy};

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    about = "Quarry - multi-pool mining coordinator",
    long_about = None
)]
struct Cli {
    /// Config file path (default: ~/.quarry/quarry.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pool URL, repeat for failover pools (http://host:port, stratum+tcp://host:port)
    #[arg(short = 'o', long = "url")]
    urls: Vec<String>,

    /// Pool username (default: hostname)
    #[arg(short, long)]
    user: Option<String>,

    /// Pool password
    #[arg(short, long, default_value = "x")]
    pass: String,

    /// Pool strategy (failover, round-robin, rotate, balance, quota)
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<Strategy>,

    /// Number of CPU threads (0 = auto-detect)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Hash synthetic work without any pool
    #[arg(long)]
    benchmark: bool,

    /// Only ever take work from the current pool
    #[arg(long)]
    fail_only: bool,

    /// Staged work queue depth
    #[arg(long)]
    queue: Option<usize>,

    /// Exit after this many accepted shares
    #[arg(long)]
    share_limit: Option<u64>,

    /// Write the effective configuration on exit
    #[arg(long)]
    save_config: bool,

    /// Seconds between status panels
    #[arg(long, default_value_t = 30)]
    summary_interval: u64,

    /// Print the final status as JSON on exit
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_strategy(s: &str) -> Result<Strategy, String> {
    s.parse::<Strategy>().map_err(|e| e.to_string())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".quarry").join("quarry.toml"))
}

fn default_user() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "quarry".to_string())
}

/// File settings first, command line on top.
fn build_config(cli: &Cli, path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(p) if p.exists() => {
            info!("Loading config from {}", p.display());
            EngineConfig::from_file(p)?
        }
        Some(p) if cli.config.is_some() => {
            anyhow::bail!("config file {} not found", p.display());
        }
        _ => EngineConfig::default(),
    };

    if !cli.urls.is_empty() {
        let user = cli.user.clone().unwrap_or_else(default_user);
        config.pools = cli
            .urls
            .iter()
            .map(|url| PoolConfig::new(url).with_credentials(&user, &cli.pass))
            .collect();
    }
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }
    if config.worker_threads == 0 {
        config.worker_threads = num_cpus::get();
    }
    if let Some(depth) = cli.queue {
        config.queue_depth = depth;
    }
    if cli.share_limit.is_some() {
        config.share_limit = cli.share_limit;
    }
    config.benchmark |= cli.benchmark;
    config.fail_only |= cli.fail_only;

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else if cli.quiet {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    if cli.no_color {
        colored::control::set_override(false);
    }

    let config_path = cli.config.clone().or_else(default_config_path);
    let config = build_config(&cli, config_path.as_ref())?;
    let threads = config.worker_threads;

    summary::print_banner(&config, threads);

    let engine = Arc::new(Engine::new(config)?);
    for i in 0..threads {
        engine.add_worker_with(Arc::new(CpuBackend::new(i)), DeviceParams { index: i, ..Default::default() })?;
    }

    engine.start().await?;
    println!(
        "{} {}",
        " * ".bright_green().bold(),
        format!("mining with {} thread(s), press Ctrl+C to stop", threads).bright_white()
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.summary_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!();
                warn!("Interrupted, shutting down");
                break;
            }
            _ = engine.wait() => {
                info!("Engine stopped");
                break;
            }
            _ = ticker.tick() => {
                summary::print_summary(
                    &engine.stats_snapshot(),
                    &engine.pool_snapshots(),
                    &engine.worker_snapshots(),
                    &engine.current_block(),
                );
            }
        }
    }

    engine.shutdown().await;
    if cli.json {
        let report = serde_json::json!({
            "stats": engine.stats_snapshot(),
            "pools": engine.pool_snapshots(),
            "workers": engine.worker_snapshots(),
            "block": engine.current_block(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        summary::print_summary(
            &engine.stats_snapshot(),
            &engine.pool_snapshots(),
            &engine.worker_snapshots(),
            &engine.current_block(),
        );
    }

    if cli.save_config {
        if let Some(path) = config_path {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            engine.save_config(&path)?;
            info!("Saved configuration to {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["quarry"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_command_line_pools() {
        let cli = cli(&["-o", "http://a:8332", "-o", "stratum+tcp://b:3333", "-u", "me", "-t", "2"]);
        let config = build_config(&cli, None).unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[1].user, "me");
        assert_eq!(config.pools[1].pass, "x");
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn test_strategy_flag() {
        let cli = cli(&["-o", "http://a:8332", "--strategy", "rr"]);
        let config = build_config(&cli, None).unwrap();
        assert_eq!(config.strategy, Strategy::RoundRobin);
        assert!(parse_strategy("nonsense").is_err());
    }

    #[test]
    fn test_no_pools_rejected_unless_benchmark() {
        assert!(build_config(&cli(&[]), None).is_err());
        let config = build_config(&cli(&["--benchmark", "-t", "1"]), None).unwrap();
        assert!(config.benchmark);
    }
}
