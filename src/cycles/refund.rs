//! Refund engine for under-subscribed (cancelled) cycles.
//!
//! Double-refund safety is structural: the only call site is the single
//! `opening → cancelled` transition in the tick processor, and that
//! transition is a guarded write that fires at most once per cycle.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use crate::cycles::store::CycleStore;
use crate::models::{Cycle, Template};
use crate::wallet::{AccountStore, LedgerKind};

pub struct RefundEngine {
    cycles: Arc<CycleStore>,
    accounts: Arc<AccountStore>,
}

impl RefundEngine {
    pub fn new(cycles: Arc<CycleStore>, accounts: Arc<AccountStore>) -> Self {
        Self { cycles, accounts }
    }

    /// Credit back exactly the entry fee to every non-spectator entrant.
    /// Returns the number of refunds issued.
    pub async fn refund_cycle(
        &self,
        cycle: &Cycle,
        template: &Template,
        now: i64,
    ) -> Result<usize> {
        if template.entry_fee == 0 {
            return Ok(0);
        }

        let participants = self.cycles.participants(&cycle.id).await?;
        let mut refunded = 0usize;
        for participant in participants.iter().filter(|p| !p.is_spectator) {
            match self
                .accounts
                .credit(
                    &participant.user_id,
                    template.entry_fee,
                    Some(&cycle.id),
                    LedgerKind::Refund,
                    now,
                )
                .await
            {
                Ok(()) => refunded += 1,
                Err(e) => {
                    error!(
                        cycle_id = %cycle.id,
                        user_id = %participant.user_id,
                        amount = template.entry_fee,
                        error = %e,
                        "refund failed; manual reconciliation required"
                    );
                }
            }
        }

        info!(
            cycle_id = %cycle.id,
            refunded,
            amount_each = template.entry_fee,
            "entry fees refunded for cancelled cycle"
        );
        Ok(refunded)
    }
}
