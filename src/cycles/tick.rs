//! Tick processor: the periodically-invoked cycle state machine.
//!
//! Each invocation is a pure function of (store state, `now`). The external
//! timer gives no exactly-once or non-overlapping guarantee, so every
//! transition below is a conditional store write and re-running a tick
//! against an already-advanced cycle is a no-op. The processor keeps no
//! state between invocations.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cycles::recurrence::RecurrenceScheduler;
use crate::cycles::refund::RefundEngine;
use crate::cycles::settlement::SettlementEngine;
use crate::cycles::store::CycleStore;
use crate::models::{Cycle, Phase};
use crate::wallet::AccountStore;

/// Per-invocation counters, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub processed: usize,
    pub failed: usize,
}

pub struct TickProcessor {
    cycles: Arc<CycleStore>,
    settlement: SettlementEngine,
    refunds: RefundEngine,
    recurrence: RecurrenceScheduler,
}

impl TickProcessor {
    pub fn new(cycles: Arc<CycleStore>, accounts: Arc<AccountStore>) -> Self {
        Self {
            settlement: SettlementEngine::new(cycles.clone(), accounts.clone()),
            refunds: RefundEngine::new(cycles.clone(), accounts),
            recurrence: RecurrenceScheduler::new(cycles.clone()),
            cycles,
        }
    }

    /// Advance every non-terminal cycle by at most one transition, then run
    /// the recurrence pass. One cycle's failure never aborts the others.
    pub async fn run_tick(&self, now: i64) -> TickSummary {
        let mut summary = TickSummary::default();

        let active = match self.cycles.active_cycles().await {
            Ok(cycles) => cycles,
            Err(e) => {
                error!(error = %e, "tick aborted: active cycle fetch failed");
                return summary;
            }
        };

        for cycle in &active {
            summary.processed += 1;
            if let Err(e) = self.advance(cycle, now).await {
                summary.failed += 1;
                warn!(
                    cycle_id = %cycle.id,
                    phase = cycle.phase.as_str(),
                    error = %e,
                    "cycle transition failed; will retry next tick"
                );
            }
        }

        if let Err(e) = self.recurrence.run(now).await {
            warn!(error = %e, "recurrence pass failed");
        }

        summary
    }

    /// One transition for one cycle, per the lifecycle table. The `cycle`
    /// argument is a snapshot; every write re-checks the phase in the
    /// store, so acting on a stale snapshot is harmless.
    async fn advance(&self, cycle: &Cycle, now: i64) -> Result<()> {
        match cycle.phase {
            Phase::Waiting => {
                if now >= cycle.entry_open_at
                    && self
                        .cycles
                        .transition_phase(&cycle.id, Phase::Waiting, Phase::Opening)
                        .await?
                {
                    info!(cycle_id = %cycle.id, "entry open");
                }
            }
            Phase::Opening => {
                if now >= cycle.live_start_at {
                    let template = self
                        .cycles
                        .get_template(cycle.template_id)
                        .await
                        .context("opening transition: template lookup")?;
                    template.validate().context("opening transition: template config")?;

                    if cycle.participant_count < template.min_participants {
                        if self
                            .cycles
                            .transition_phase(&cycle.id, Phase::Opening, Phase::Cancelled)
                            .await?
                        {
                            info!(
                                cycle_id = %cycle.id,
                                participants = cycle.participant_count,
                                required = template.min_participants,
                                "cycle cancelled: under-subscribed"
                            );
                            self.refunds.refund_cycle(cycle, &template, now).await?;
                        }
                    } else if self
                        .cycles
                        .begin_live(&cycle.id, template.comment_timer_secs)
                        .await?
                    {
                        info!(
                            cycle_id = %cycle.id,
                            participants = cycle.participant_count,
                            pool = cycle.pool_value,
                            countdown = template.comment_timer_secs,
                            "cycle live"
                        );
                    }
                }
            }
            Phase::Live => {
                self.cycles.decrement_countdown(&cycle.id).await?;
                if self.cycles.finish_live_if_due(&cycle.id, now).await? {
                    info!(cycle_id = %cycle.id, "live window finished");
                }
            }
            Phase::Ending => {
                // Settle (or observe that another invocation already
                // claimed it), then close. AlreadyClaimed still closes the
                // phase so a crash between claim and close cannot wedge the
                // cycle.
                self.settlement.settle(&cycle.id, now).await?;
                if self
                    .cycles
                    .transition_phase(&cycle.id, Phase::Ending, Phase::Ended)
                    .await?
                {
                    info!(cycle_id = %cycle.id, "cycle ended");
                }
            }
            // active_cycles never returns these; nothing to do regardless.
            Phase::Ended | Phase::Cancelled => {}
        }
        Ok(())
    }
}
