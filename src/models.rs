//! Core record types for the contest engine.
//!
//! Money amounts are integer minor units; timestamps are unix seconds (UTC).
//! Nothing in here touches the stores directly.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Lifecycle phase of a cycle.
///
/// Transitions are strictly monotonic:
/// `Waiting → Opening → Live → Ending → Ended`, with `Cancelled` replacing
/// `Ended` when a cycle closes entry under-subscribed. No phase is ever
/// revisited; every phase write in the store carries a guard on the
/// expected current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    Opening,
    Live,
    Ending,
    Ended,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::Opening => "opening",
            Phase::Live => "live",
            Phase::Ending => "ending",
            Phase::Ended => "ended",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "waiting" => Phase::Waiting,
            "opening" => Phase::Opening,
            "live" => Phase::Live,
            "ending" => Phase::Ending,
            "ended" => Phase::Ended,
            "cancelled" => Phase::Cancelled,
            other => bail!("unknown cycle phase: {other}"),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ended | Phase::Cancelled)
    }
}

/// Static configuration defining a class of cycles. Read-only to the engine;
/// edited only through external administration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Entry fee in minor units; 0 means free entry (and no refunds).
    pub entry_fee: i64,
    /// Delay before entry opens. Also the recurrence cooldown.
    pub waiting_secs: i64,
    /// Length of the entry (`opening`) window.
    pub entry_secs: i64,
    /// Maximum live duration; the hard stop even if the countdown keeps
    /// getting reset.
    pub live_secs: i64,
    /// Value the live countdown is set to at `opening → live` and reset to
    /// on every qualifying comment.
    pub comment_timer_secs: i64,
    pub winner_count: usize,
    /// Integer percentages, one per winner position, summing to 100.
    pub prize_distribution: Vec<i64>,
    pub platform_cut_pct: i64,
    pub min_participants: i64,
    /// Extra prize money added to the pool at settlement.
    #[serde(default)]
    pub sponsored_amount: i64,
    /// Recreate indefinitely once the previous cycle finishes.
    #[serde(default)]
    pub recurring: bool,
}

impl Template {
    /// A malformed template is fatal for its cycle's processing but must
    /// never abort the tick for other cycles, so validation is an explicit
    /// step the engines run before trusting the numbers.
    pub fn validate(&self) -> Result<()> {
        if self.winner_count == 0 {
            bail!("template {}: winner_count must be at least 1", self.name);
        }
        if self.prize_distribution.len() != self.winner_count {
            bail!(
                "template {}: prize_distribution has {} entries, expected {}",
                self.name,
                self.prize_distribution.len(),
                self.winner_count
            );
        }
        let sum: i64 = self.prize_distribution.iter().sum();
        if sum != 100 {
            bail!(
                "template {}: prize_distribution sums to {sum}, expected 100",
                self.name
            );
        }
        if !(0..=100).contains(&self.platform_cut_pct) {
            bail!(
                "template {}: platform_cut_pct {} out of range",
                self.name,
                self.platform_cut_pct
            );
        }
        if self.entry_fee < 0 || self.sponsored_amount < 0 {
            bail!("template {}: negative money amounts", self.name);
        }
        if self.entry_secs <= 0 || self.live_secs <= 0 || self.comment_timer_secs <= 0 {
            bail!("template {}: durations must be positive", self.name);
        }
        Ok(())
    }
}

/// One running instance of a timed contest.
///
/// The four boundary timestamps are computed once at creation from the
/// template's duration fields and never written again. `settled_at` doubles
/// as the settlement idempotency marker: set at most once, by at most one
/// successful conditional write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: String,
    pub template_id: i64,
    pub phase: Phase,
    pub created_at: i64,
    pub entry_open_at: i64,
    pub entry_close_at: i64,
    pub live_start_at: i64,
    pub live_end_at: i64,
    pub participant_count: i64,
    /// Entry fees collected, pre platform-cut.
    pub pool_value: i64,
    /// Seconds remaining in the live comment-timer.
    pub countdown: i64,
    pub settled_at: Option<i64>,
    /// JSON audit snapshot written by settlement.
    pub settlement_snapshot: Option<String>,
}

/// Join record linking a user to a cycle. Spectators pay no entry fee and
/// never qualify for winnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub cycle_id: String,
    pub user_id: String,
    pub is_spectator: bool,
    pub joined_at: i64,
}

/// Append-only qualifying action. The most recent comment per distinct user
/// is the ranking signal at settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub cycle_id: String,
    pub user_id: String,
    pub body: String,
    pub created_at: i64,
}

/// Derived record written exactly once per settled cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Winner {
    pub cycle_id: String,
    pub user_id: String,
    /// 1-based rank; 1 = most recent qualifying commenter.
    pub position: usize,
    pub prize: i64,
}

/// Engine runtime configuration, loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    /// Grace period after `live_end_at` before a non-terminal cycle is
    /// reported as stuck.
    pub stuck_grace_secs: i64,
    pub stuck_check_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            stuck_grace_secs: 300,
            stuck_check_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tick_interval_ms: env_parse("TICK_INTERVAL_MS", defaults.tick_interval_ms),
            stuck_grace_secs: env_parse("STUCK_GRACE_SECS", defaults.stuck_grace_secs),
            stuck_check_secs: env_parse("STUCK_CHECK_SECS", defaults.stuck_check_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_template() -> Template {
        Template {
            id: 1,
            name: "nightly".to_string(),
            entry_fee: 700,
            waiting_secs: 60,
            entry_secs: 600,
            live_secs: 900,
            comment_timer_secs: 30,
            winner_count: 3,
            prize_distribution: vec![50, 30, 20],
            platform_cut_pct: 10,
            min_participants: 10,
            sponsored_amount: 0,
            recurring: true,
        }
    }

    #[test]
    fn phase_round_trips_through_text() {
        for phase in [
            Phase::Waiting,
            Phase::Opening,
            Phase::Live,
            Phase::Ending,
            Phase::Ended,
            Phase::Cancelled,
        ] {
            assert_eq!(Phase::parse(phase.as_str()).unwrap(), phase);
        }
        assert!(Phase::parse("paused").is_err());
    }

    #[test]
    fn only_ended_and_cancelled_are_terminal() {
        assert!(Phase::Ended.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(!Phase::Waiting.is_terminal());
        assert!(!Phase::Ending.is_terminal());
    }

    #[test]
    fn template_validation_catches_bad_distributions() {
        assert!(base_template().validate().is_ok());

        let mut short = base_template();
        short.prize_distribution = vec![60, 40];
        assert!(short.validate().is_err());

        let mut off_by_one = base_template();
        off_by_one.prize_distribution = vec![50, 30, 21];
        assert!(off_by_one.validate().is_err());

        let mut bad_cut = base_template();
        bad_cut.platform_cut_pct = 101;
        assert!(bad_cut.validate().is_err());
    }
}
