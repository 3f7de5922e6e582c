mod config;
mod link;
mod scenario;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use crate::config::SimConfig;
use crate::scenario::{Divergence, Simulation};

#[derive(Parser)]
#[command(
    name = "netrep-sim",
    version,
    about = "Deterministic server/client replication simulation"
)]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of connected clients, each with its own pawn.
    #[arg(long)]
    clients: Option<u32>,
    /// Number of server-driven entities.
    #[arg(long)]
    npcs: Option<u32>,
    /// Ticks with input, movement and link impairment.
    #[arg(long)]
    ticks: Option<u32>,
    /// Quiet ticks on a perfect link before comparing state.
    #[arg(long)]
    settle_ticks: Option<u32>,
    /// RNG seed for deterministic results.
    #[arg(long)]
    seed: Option<u64>,
    /// Packet loss percentage in both directions.
    #[arg(long)]
    loss: Option<u32>,
    /// Packet duplication percentage in both directions.
    #[arg(long)]
    duplicate: Option<u32>,
    /// Maximum extra delivery delay in ticks.
    #[arg(long)]
    max_delay: Option<u32>,
    /// Replication window radius around each pawn.
    #[arg(long)]
    view_radius: Option<f32>,
    /// Connection MTU in bytes.
    #[arg(long)]
    mtu: Option<usize>,
    /// Write summary.json here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Fail if any client disagrees with the server after settling.
    #[arg(long)]
    fail_on_divergence: bool,
    /// Fail if average server-to-client bytes per tick exceeds this value.
    #[arg(long)]
    max_avg_bytes_per_tick: Option<u64>,
}

impl Cli {
    fn resolve(&self) -> Result<SimConfig> {
        let mut config = match &self.config {
            Some(path) => SimConfig::load(path)?,
            None => SimConfig::default(),
        };
        if let Some(clients) = self.clients {
            config.clients = clients;
        }
        if let Some(npcs) = self.npcs {
            config.npcs = npcs;
        }
        if let Some(ticks) = self.ticks {
            config.ticks = ticks;
        }
        if let Some(settle_ticks) = self.settle_ticks {
            config.settle_ticks = settle_ticks;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(loss) = self.loss {
            config.link.loss_percent = loss;
        }
        if let Some(duplicate) = self.duplicate {
            config.link.duplicate_percent = duplicate;
        }
        if let Some(max_delay) = self.max_delay {
            config.link.max_delay_ticks = max_delay;
        }
        if let Some(view_radius) = self.view_radius {
            config.view_radius = view_radius;
        }
        if let Some(mtu) = self.mtu {
            config.replication.connection_mtu = mtu;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = cli.resolve()?;

    let mut sim = Simulation::new(config.clone())?;
    sim.run()?;

    let summary = Summary::new(&config, &sim);
    log::info!(
        "{} ticks, {} packets, {} divergent",
        summary.ticks_run,
        summary.packets_down + summary.packets_up,
        summary.divergence.total()
    );
    write_summary(cli.out.as_deref(), &summary)?;
    summary.assert_budgets(cli.fail_on_divergence, cli.max_avg_bytes_per_tick)?;
    Ok(())
}

fn write_summary(out: Option<&Path>, summary: &Summary) -> Result<()> {
    let contents = serde_json::to_string_pretty(summary).context("serialize summary")?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create output dir {}", parent.display()))?;
            }
            fs::write(path, contents).with_context(|| format!("write {}", path.display()))
        }
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    config: SimConfig,
    ticks_run: u64,
    packets_down: u64,
    packets_up: u64,
    bytes_down: u64,
    bytes_up: u64,
    packets_lost: u64,
    packets_duplicated: u64,
    avg_bytes_down_per_tick: u64,
    p95_packet_bytes: u64,
    max_packet_bytes: u64,
    updates: u64,
    deletes: u64,
    resets: u64,
    npcs_spawned: u64,
    npcs_despawned: u64,
    inputs: u64,
    mispredictions: u64,
    max_input_history: usize,
    divergence: Divergence,
}

impl Summary {
    fn new(config: &SimConfig, sim: &Simulation) -> Self {
        let (down, up) = sim.link_stats();
        let stats = sim.stats();
        let ticks_run = sim.ticks_run();
        let mut sizes = sim.packet_sizes();
        sizes.sort_unstable();
        Self {
            config: config.clone(),
            ticks_run,
            packets_down: down.sent,
            packets_up: up.sent,
            bytes_down: down.bytes,
            bytes_up: up.bytes,
            packets_lost: down.lost + up.lost,
            packets_duplicated: down.duplicated + up.duplicated,
            avg_bytes_down_per_tick: if ticks_run > 0 { down.bytes / ticks_run } else { 0 },
            p95_packet_bytes: percentile(&sizes, 0.95),
            max_packet_bytes: sizes.last().copied().unwrap_or(0),
            updates: stats.updates,
            deletes: stats.deletes,
            resets: stats.resets,
            npcs_spawned: stats.npcs_spawned,
            npcs_despawned: stats.npcs_despawned,
            inputs: stats.inputs,
            mispredictions: stats.mispredictions,
            max_input_history: stats.max_input_history,
            divergence: sim.divergence(),
        }
    }

    fn assert_budgets(&self, fail_on_divergence: bool, max_avg: Option<u64>) -> Result<()> {
        if fail_on_divergence && self.divergence.total() > 0 {
            anyhow::bail!(
                "{} divergent entities after settling ({} missing, {} extra, {} mismatched, {} pending inputs)",
                self.divergence.total(),
                self.divergence.missing,
                self.divergence.extra,
                self.divergence.mismatched,
                self.divergence.pending_inputs
            );
        }
        if let Some(max_avg) = max_avg {
            if self.avg_bytes_down_per_tick > max_avg {
                anyhow::bail!(
                    "avg bytes per tick {} exceeds budget {}",
                    self.avg_bytes_down_per_tick,
                    max_avg
                );
            }
        }
        Ok(())
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[u64], fraction: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64) * fraction).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_nearest_rank() {
        let values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&values, 0.95), 95);
        assert_eq!(percentile(&[7], 0.95), 7);
        assert_eq!(percentile(&[], 0.95), 0);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["netrep-sim", "--clients", "3", "--loss", "12", "--mtu", "900"]);
        let config = cli.resolve().unwrap();
        assert_eq!(config.clients, 3);
        assert_eq!(config.link.loss_percent, 12);
        assert_eq!(config.replication.connection_mtu, 900);
        assert_eq!(config.npcs, SimConfig::default().npcs);
    }

    #[test]
    fn invalid_flags_are_rejected() {
        let cli = Cli::parse_from(["netrep-sim", "--loss", "150"]);
        assert!(cli.resolve().is_err());
    }

    #[test]
    fn divergence_budget_fails_run() {
        let config = SimConfig {
            clients: 1,
            npcs: 2,
            ticks: 10,
            ..SimConfig::default()
        };
        let sim = Simulation::new(config.clone()).unwrap();
        let mut summary = Summary::new(&config, &sim);
        summary.divergence.missing = 1;
        assert!(summary.assert_budgets(true, None).is_err());
        assert!(summary.assert_budgets(false, None).is_ok());
    }
}
