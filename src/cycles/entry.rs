//! Entry and comment submission paths.
//!
//! These are the request-side collaborators of the tick processor. They
//! apply the same conditional-write discipline: the participant row's
//! unique key is the join idempotency guard, the fee debit is conditional
//! on the balance, the counter bump is conditional on the entry window
//! still being open, and the countdown reset is conditional on it actually
//! increasing the timer.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cycles::store::CycleStore;
use crate::models::Phase;
use crate::wallet::{AccountStore, LedgerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    /// The cycle is not accepting entries (wrong phase, or it advanced
    /// mid-request).
    EntryClosed,
    InsufficientBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentOutcome {
    Posted,
    NotLive,
    NotEnrolled,
}

pub struct EntryPath {
    cycles: Arc<CycleStore>,
    accounts: Arc<AccountStore>,
}

impl EntryPath {
    pub fn new(cycles: Arc<CycleStore>, accounts: Arc<AccountStore>) -> Self {
        Self { cycles, accounts }
    }

    /// Enroll a user in a cycle. Non-spectators pay the entry fee and count
    /// toward `participant_count`/`pool_value`; spectators pay nothing and
    /// touch no counters. Duplicate joins are no-ops.
    pub async fn join_cycle(
        &self,
        cycle_id: &str,
        user_id: &str,
        spectator: bool,
        now: i64,
    ) -> Result<JoinOutcome> {
        let cycle = self.cycles.get_cycle(cycle_id).await?;
        if cycle.phase != Phase::Opening {
            return Ok(JoinOutcome::EntryClosed);
        }
        let template = self
            .cycles
            .get_template(cycle.template_id)
            .await
            .context("join: template lookup")?;

        // The unique (cycle, user) key is the idempotency guard; insert
        // first so two racing joins cannot both charge the fee.
        if !self
            .cycles
            .insert_participant(cycle_id, user_id, spectator, now)
            .await?
        {
            return Ok(JoinOutcome::AlreadyJoined);
        }

        if spectator {
            debug!(cycle_id, user_id, "spectator joined");
            return Ok(JoinOutcome::Joined);
        }

        if template.entry_fee > 0 {
            let debited = self
                .accounts
                .try_debit(
                    user_id,
                    template.entry_fee,
                    Some(cycle_id),
                    LedgerKind::EntryFee,
                    now,
                )
                .await?;
            if !debited {
                self.cycles.remove_participant(cycle_id, user_id).await?;
                return Ok(JoinOutcome::InsufficientBalance);
            }
        }

        // Counter bump is guarded on the entry window; if the tick closed
        // entry between our phase read and here, unwind the join.
        if !self.cycles.record_entry(cycle_id, template.entry_fee).await? {
            if template.entry_fee > 0 {
                self.accounts
                    .credit(
                        user_id,
                        template.entry_fee,
                        Some(cycle_id),
                        LedgerKind::Refund,
                        now,
                    )
                    .await?;
            }
            self.cycles.remove_participant(cycle_id, user_id).await?;
            return Ok(JoinOutcome::EntryClosed);
        }

        info!(
            cycle_id,
            user_id,
            fee = template.entry_fee,
            "participant joined"
        );
        Ok(JoinOutcome::Joined)
    }

    /// Append a qualifying comment and reset the live countdown. Losing the
    /// reset race (cycle left `live`, or a fresher reset is in place) is
    /// fine; the append itself is never conditional.
    pub async fn post_comment(
        &self,
        cycle_id: &str,
        user_id: &str,
        body: &str,
        now: i64,
    ) -> Result<CommentOutcome> {
        let cycle = self.cycles.get_cycle(cycle_id).await?;
        if cycle.phase != Phase::Live {
            return Ok(CommentOutcome::NotLive);
        }
        if !self.cycles.is_participant(cycle_id, user_id).await? {
            return Ok(CommentOutcome::NotEnrolled);
        }
        let template = self.cycles.get_template(cycle.template_id).await?;

        self.cycles
            .append_comment(cycle_id, user_id, body, now)
            .await?;
        let reset = self
            .cycles
            .reset_countdown(cycle_id, template.comment_timer_secs)
            .await?;
        debug!(cycle_id, user_id, countdown_reset = reset, "comment posted");
        Ok(CommentOutcome::Posted)
    }
}
