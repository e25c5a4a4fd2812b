//! Recurrence scheduler: keeps recurring templates supplied with cycles.
//!
//! Runs at the end of every tick. Duplicate-creation safety comes from the
//! "no active cycle for this template" precondition checked immediately
//! before creation; a template with a live cycle is always skipped.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cycles::store::CycleStore;
use crate::models::Template;

pub struct RecurrenceScheduler {
    cycles: Arc<CycleStore>,
}

impl RecurrenceScheduler {
    pub fn new(cycles: Arc<CycleStore>) -> Self {
        Self { cycles }
    }

    /// One pass over all recurring templates. A failure on one template is
    /// logged and never blocks the others.
    pub async fn run(&self, now: i64) -> Result<()> {
        for template in self.cycles.list_recurring_templates().await? {
            if let Err(e) = self.maybe_spawn(&template, now).await {
                warn!(
                    template = %template.name,
                    error = %e,
                    "recurrence check failed; will retry next tick"
                );
            }
        }
        Ok(())
    }

    async fn maybe_spawn(&self, template: &Template, now: i64) -> Result<()> {
        if self
            .cycles
            .has_active_cycle_for_template(template.id)
            .await?
        {
            return Ok(());
        }

        // Cooldown since the previous cycle's end; a template with no
        // history starts immediately.
        if let Some(last_end) = self.cycles.latest_terminal_end(template.id).await? {
            if now < last_end + template.waiting_secs {
                return Ok(());
            }
        }

        template.validate()?;
        let cycle = self.cycles.create_cycle(template, now).await?;
        info!(
            cycle_id = %cycle.id,
            template = %template.name,
            entry_open_at = cycle.entry_open_at,
            live_start_at = cycle.live_start_at,
            "recurring cycle created"
        );
        Ok(())
    }
}
