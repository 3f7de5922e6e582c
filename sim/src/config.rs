use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use replication::ReplicationConfig;
use serde::{Deserialize, Serialize};

/// Link impairments applied in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub loss_percent: u32,
    pub duplicate_percent: u32,
    /// Packets arrive between zero and this many ticks late.
    pub max_delay_ticks: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss_percent: 5,
            duplicate_percent: 2,
            max_delay_ticks: 3,
        }
    }
}

impl LinkConfig {
    /// A link that delivers everything on the next tick.
    #[must_use]
    pub const fn perfect() -> Self {
        Self {
            loss_percent: 0,
            duplicate_percent: 0,
            max_delay_ticks: 0,
        }
    }
}

/// Everything a run needs. Loaded from JSON, then overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub clients: u32,
    pub npcs: u32,
    /// Ticks with input, movement and link chaos.
    pub ticks: u32,
    /// Quiet ticks on a perfect link before state is compared.
    pub settle_ticks: u32,
    pub seed: u64,
    pub tick_ms: u64,
    /// Entities roam within `[-arena_half_extent, arena_half_extent]` on both axes.
    pub arena_half_extent: i64,
    pub view_radius: f32,
    pub max_entity_replicator_send_count: u32,
    pub window_update_interval_ticks: u32,
    /// Chance per tick that one NPC despawns and a new one spawns.
    pub npc_churn_percent: u32,
    pub link: LinkConfig,
    pub replication: ReplicationConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            npcs: 64,
            ticks: 600,
            settle_ticks: 300,
            seed: 1,
            tick_ms: 16,
            arena_half_extent: 500,
            view_radius: 250.0,
            max_entity_replicator_send_count: 32,
            window_update_interval_ticks: 4,
            npc_churn_percent: 5,
            link: LinkConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            anyhow::bail!("tick_ms must be positive");
        }
        if self.link.loss_percent > 100 || self.link.duplicate_percent > 100 {
            anyhow::bail!("link percentages must be at most 100");
        }
        if self.npc_churn_percent > 100 {
            anyhow::bail!("npc_churn_percent must be at most 100");
        }
        if self.arena_half_extent <= 0 {
            anyhow::bail!("arena_half_extent must be positive");
        }
        if self.view_radius.is_nan() || self.view_radius <= 0.0 {
            anyhow::bail!("view_radius must be positive");
        }
        let settle_ms = u64::from(self.settle_ticks) * self.tick_ms;
        let drain_ms = self.replication.entity_pending_removal_ms
            + self.replication.subscriber_removal_grace_ms;
        if settle_ms <= drain_ms {
            anyhow::bail!(
                "settle phase of {settle_ms}ms does not outlast removal and grace ({drain_ms}ms)"
            );
        }
        Ok(())
    }

    /// Entity capacity of the server's spatial index.
    #[must_use]
    pub fn max_entities(&self) -> usize {
        (self.clients as usize + self.npcs as usize).max(1)
    }
}
