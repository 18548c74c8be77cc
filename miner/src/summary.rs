//! Terminal output: startup banner and periodic status panel.

use chrono::Local;
use colored::*;

use quarry_core::{format_hashrate, CurrentBlock, EngineConfig, PoolSnapshot, PoolStatus, StatsSnapshot, WorkerSnapshot};

fn fmt_uptime(secs: u64) -> String {
    let d = secs / 86400;
    let h = (secs % 86400) / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if d > 0 {
        format!("{}d {:02}:{:02}:{:02}", d, h, m, s)
    } else {
        format!("{:02}:{:02}:{:02}", h, m, s)
    }
}

pub fn fmt_difficulty(d: f64) -> String {
    if d >= 1e12 {
        format!("{:.2}T", d / 1e12)
    } else if d >= 1e9 {
        format!("{:.2}G", d / 1e9)
    } else if d >= 1e6 {
        format!("{:.2}M", d / 1e6)
    } else if d >= 1e3 {
        format!("{:.2}K", d / 1e3)
    } else {
        format!("{:.3}", d)
    }
}

fn status_label(pool: &PoolSnapshot) -> ColoredString {
    match (pool.status, pool.idle) {
        (PoolStatus::Disabled, _) => "disabled".bright_black(),
        (PoolStatus::Rejecting, _) => "rejecting".bright_red(),
        (PoolStatus::Enabled, true) => "dead".red(),
        (PoolStatus::Enabled, false) if pool.lagging => "lagging".yellow(),
        (PoolStatus::Enabled, false) => "alive".bright_green(),
    }
}

pub fn print_banner(config: &EngineConfig, threads: usize) {
    println!();
    println!("{} {}", " * ".bright_green().bold(), "ABOUT".bright_white().bold());
    println!(
        "{}  {} {}",
        "   ".bright_black(),
        "Quarry".bright_cyan().bold(),
        env!("CARGO_PKG_VERSION").white()
    );
    println!();
    println!("{} {}", " * ".bright_green().bold(), "CONFIG".bright_white().bold());
    println!("{}  {:<12} {}", "   ".bright_black(), "strategy".bright_black(), config.strategy.to_string().bright_cyan());
    println!(
        "{}  {:<12} {}",
        "   ".bright_black(),
        "threads".bright_black(),
        threads.to_string().bright_magenta().bold()
    );
    if config.benchmark {
        println!("{}  {:<12} {}", "   ".bright_black(), "mode".bright_black(), "benchmark".bright_yellow());
    }
    for (i, pool) in config.pools.iter().enumerate() {
        println!(
            "{}  {:<12} {} {}",
            "   ".bright_black(),
            format!("pool #{}", i).bright_black(),
            pool.url.bright_white(),
            format!("({})", pool.user).bright_black()
        );
    }
    println!();
}

pub fn print_summary(
    stats: &StatsSnapshot,
    pools: &[PoolSnapshot],
    workers: &[WorkerSnapshot],
    block: &CurrentBlock,
) {
    let now = Local::now().format("%H:%M:%S");
    let bar = "─".repeat(64);
    let global = &stats.global;

    println!("{}", format!("┌{}┐", bar).bright_black());
    println!(
        "{}  {}   {}  uptime {}",
        "│".bright_black(),
        "SPEED".bright_white().bold(),
        format_hashrate(global.hashrate).bright_cyan().bold(),
        fmt_uptime(stats.uptime_secs).bright_white(),
    );
    println!(
        "{}  {}  A: {}  R: {}  S: {}  HW: {}  U: {}/m",
        "│".bright_black(),
        "SHARES".bright_white().bold(),
        global.shares.accepted.to_string().bright_green().bold(),
        global.shares.rejected.to_string().bright_red(),
        global.shares.stale.to_string().yellow(),
        global.hw_errors.to_string().bright_magenta(),
        format!("{:.2}", stats.utility).bright_white(),
    );
    println!(
        "{}  {}   net: {}  best: {}  blocks: {}",
        "│".bright_black(),
        "BLOCK".bright_white().bold(),
        fmt_difficulty(block.network_difficulty).bright_yellow(),
        fmt_difficulty(global.best_share).bright_white(),
        global.found_blocks.to_string().bright_cyan().bold(),
    );
    for pool in pools {
        let counters = stats.pools.get(&pool.id).cloned().unwrap_or_default();
        println!(
            "{}  {} {} {} A:{} R:{} diff {}",
            "│".bright_black(),
            if pool.current { "▶".bright_green() } else { " ".normal() },
            format!("#{} {}", pool.id, pool.url).white(),
            status_label(pool),
            counters.shares.accepted,
            counters.shares.rejected,
            fmt_difficulty(pool.share_difficulty),
        );
    }
    for worker in workers {
        let counters = stats.workers.get(&worker.id).cloned().unwrap_or_default();
        println!(
            "{}    {} {} {:?} HW:{}",
            "│".bright_black(),
            worker.name.bright_magenta(),
            format_hashrate(counters.hashrate).bright_cyan(),
            worker.health,
            counters.hw_errors,
        );
    }
    println!(
        "{}  [{}]",
        "│".bright_black(),
        now.to_string().bright_black(),
    );
    println!("{}", format!("└{}┘", bar).bright_black());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_uptime() {
        assert_eq!(fmt_uptime(59), "00:00:59");
        assert_eq!(fmt_uptime(3_661), "01:01:01");
        assert_eq!(fmt_uptime(90_061), "1d 01:01:01");
    }

    #[test]
    fn test_fmt_difficulty() {
        assert_eq!(fmt_difficulty(0.5), "0.500");
        assert_eq!(fmt_difficulty(65_536.0), "65.54K");
        assert_eq!(fmt_difficulty(3.2e12), "3.20T");
    }
}
