//! Consensus configuration.

use crate::{ConsensusError, Result};
use plexus_core::constants;
use serde::{Deserialize, Serialize};

/// PBFT tuning parameters. Defaults are the dev-profile values; production
/// chains override them from their chain configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftConfig {
    /// Base lambda in milliseconds. Step deadlines are multiples of this.
    pub lambda_ms_min: u64,
    /// Maximum PBFT committee size; the sortition threshold is the smaller
    /// of this and the total eligible stake.
    pub committee_size: u64,
    /// How far down the ghost path an anchor proposal may reach.
    pub dag_blocks_size: u64,
    /// How many DAG levels to step back from the ghost tip when proposing,
    /// leaving room for slower peers to sync.
    pub ghost_path_move_back: u64,
    /// Steps per round after which peer syncs are requested.
    pub max_steps: u64,
    /// Accepting window: periods ahead of the tip.
    pub accepting_periods: u64,
    /// Accepting window: rounds ahead of the current round.
    pub accepting_rounds: u64,
    /// Accepting window: steps ahead of the current step.
    pub accepting_steps: u64,
    /// Periods a cert vote may trail the tip as a potential reward vote.
    pub reward_votes_window: u64,
    /// Maximum synced blocks finalized per burst.
    pub sync_level_size: u64,
    /// Wait multiplier (units of 2 * lambda) before giving up a soft voted
    /// value.
    pub max_wait_for_soft_voted_block_steps: u64,
    /// Wait multiplier (units of 2 * lambda) before giving up a next voted
    /// value.
    pub max_wait_for_next_voted_block_steps: u64,
    /// First period at which pillar (checkpoint) voting is active.
    pub pillar_activation_period: u64,
    /// Periods between pillar blocks.
    pub pillar_interval: u64,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            lambda_ms_min: 2000,
            committee_size: constants::DEFAULT_COMMITTEE_SIZE,
            dag_blocks_size: 100,
            ghost_path_move_back: 1,
            max_steps: constants::MAX_STEPS,
            accepting_periods: constants::DEFAULT_ACCEPTING_PERIODS,
            accepting_rounds: constants::DEFAULT_ACCEPTING_ROUNDS,
            accepting_steps: constants::DEFAULT_ACCEPTING_STEPS,
            reward_votes_window: constants::REWARD_VOTES_WINDOW,
            sync_level_size: 10,
            max_wait_for_soft_voted_block_steps: constants::MAX_WAIT_FOR_SOFT_VOTED_BLOCK_STEPS,
            max_wait_for_next_voted_block_steps: constants::MAX_WAIT_FOR_NEXT_VOTED_BLOCK_STEPS,
            pillar_activation_period: 10,
            pillar_interval: 10,
        }
    }
}

impl PbftConfig {
    /// Wall-clock budget for a soft voted value before the give-up policy
    /// may fire.
    pub fn max_wait_for_soft_voted_block_ms(&self) -> u64 {
        self.max_wait_for_soft_voted_block_steps * 2 * self.lambda_ms_min
    }

    /// Wall-clock budget for a next voted value before the give-up policy
    /// may fire.
    pub fn max_wait_for_next_voted_block_ms(&self) -> u64 {
        self.max_wait_for_next_voted_block_steps * 2 * self.lambda_ms_min
    }

    /// Parse from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| ConsensusError::InvalidBlockPayload(format!("config parse: {e}")))
    }
}

/// Chain-level configuration the consensus core needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub pbft: PbftConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { chain_id: 841, pbft: PbftConfig::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PbftConfig::default();
        assert_eq!(config.lambda_ms_min, 2000);
        assert_eq!(config.max_wait_for_soft_voted_block_ms(), 20 * 2 * 2000);
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = PbftConfig::from_toml_str(
            r#"
            lambda_ms_min = 100
            committee_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.lambda_ms_min, 100);
        assert_eq!(config.committee_size, 3);
        // Unlisted fields keep defaults
        assert_eq!(config.sync_level_size, 10);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(PbftConfig::from_toml_str("lambda_ms_min = \"fast\"").is_err());
    }
}
