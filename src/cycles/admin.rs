//! Administrative overrides.
//!
//! Force-create and force-settle bypass the clock, never the guards: a
//! forced settlement goes through the same idempotency claim as the tick's,
//! so forcing an already-settled cycle does nothing.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::info;

use crate::cycles::settlement::{SettlementEngine, SettlementOutcome};
use crate::cycles::store::CycleStore;
use crate::models::{Cycle, Phase};
use crate::wallet::AccountStore;

pub struct AdminOps {
    cycles: Arc<CycleStore>,
    settlement: SettlementEngine,
}

impl AdminOps {
    pub fn new(cycles: Arc<CycleStore>, accounts: Arc<AccountStore>) -> Self {
        Self {
            settlement: SettlementEngine::new(cycles.clone(), accounts),
            cycles,
        }
    }

    /// Manual equivalent of the recurrence scheduler's creation path.
    pub async fn force_create_cycle(&self, template_id: i64, now: i64) -> Result<Cycle> {
        let template = self.cycles.get_template(template_id).await?;
        template.validate()?;
        let cycle = self.cycles.create_cycle(&template, now).await?;
        info!(
            cycle_id = %cycle.id,
            template = %template.name,
            "cycle force-created"
        );
        Ok(cycle)
    }

    /// Drive a live or ending cycle through settlement immediately. The
    /// settlement engine's claim still decides whether any payout happens.
    pub async fn force_settle(&self, cycle_id: &str, now: i64) -> Result<SettlementOutcome> {
        let cycle = self.cycles.get_cycle(cycle_id).await?;
        match cycle.phase {
            Phase::Live => {
                self.cycles
                    .transition_phase(cycle_id, Phase::Live, Phase::Ending)
                    .await?;
            }
            Phase::Ending => {}
            Phase::Waiting | Phase::Opening => {
                bail!("cycle {cycle_id} has not gone live; cannot force-settle")
            }
            Phase::Ended | Phase::Cancelled => {
                bail!("cycle {cycle_id} is already terminal")
            }
        }

        let outcome = self.settlement.settle(cycle_id, now).await?;
        self.cycles
            .transition_phase(cycle_id, Phase::Ending, Phase::Ended)
            .await?;
        info!(cycle_id, "cycle force-settled");
        Ok(outcome)
    }
}
