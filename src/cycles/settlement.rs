//! Settlement engine: winner selection, prize math, disbursement.
//!
//! Settlement runs at most once per cycle. The first store write is the
//! idempotency claim on `settled_at`; everything with side effects happens
//! strictly after that claim succeeds. Losing the claim is success with no
//! side effects, never an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cycles::store::CycleStore;
use crate::models::{Template, Winner};
use crate::wallet::{AccountStore, LedgerKind};

/// Rank points by finishing position; positions beyond the named tiers get
/// the floor value.
const POSITION_RANK_POINTS: [i64; 5] = [100, 60, 40, 25, 15];
const POSITION_RANK_FLOOR: i64 = 10;
/// Flat rank credit for every non-spectator entrant, winner or not.
const PARTICIPATION_RANK_POINTS: i64 = 5;

pub fn rank_points_for_position(position: usize) -> i64 {
    debug_assert!(position >= 1);
    POSITION_RANK_POINTS
        .get(position - 1)
        .copied()
        .unwrap_or(POSITION_RANK_FLOOR)
}

/// Audit record persisted on the cycle row after settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSnapshot {
    pub total_pool: i64,
    pub platform_cut: i64,
    pub distributable: i64,
    pub winners: Vec<SnapshotWinner>,
    /// Disbursements that failed and need manual reconciliation. Never
    /// retried automatically.
    pub failed_disbursements: Vec<FailedDisbursement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWinner {
    pub user_id: String,
    pub position: usize,
    pub prize: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDisbursement {
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug)]
pub enum SettlementOutcome {
    /// This execution performed the settlement.
    Settled(SettlementSnapshot),
    /// Another execution already claimed the cycle; nothing was done.
    AlreadyClaimed,
}

/// Integer prize split. Floor division at the cut and at each position;
/// the rounding dust is retained by the platform on purpose, and the
/// snapshot records enough to recompute it.
pub fn compute_prizes(
    total_pool: i64,
    platform_cut_pct: i64,
    distribution: &[i64],
) -> (i64, i64, Vec<i64>) {
    let platform_cut = total_pool * platform_cut_pct / 100;
    let distributable = total_pool - platform_cut;
    let prizes = distribution
        .iter()
        .map(|pct| distributable * pct / 100)
        .collect();
    (platform_cut, distributable, prizes)
}

pub struct SettlementEngine {
    cycles: Arc<CycleStore>,
    accounts: Arc<AccountStore>,
}

impl SettlementEngine {
    pub fn new(cycles: Arc<CycleStore>, accounts: Arc<AccountStore>) -> Self {
        Self { cycles, accounts }
    }

    /// Settle one cycle: claim, rank, pay, snapshot. Safe to call
    /// concurrently and repeatedly for the same cycle.
    pub async fn settle(&self, cycle_id: &str, now: i64) -> Result<SettlementOutcome> {
        let cycle = self.cycles.get_cycle(cycle_id).await?;
        let template = self
            .cycles
            .get_template(cycle.template_id)
            .await
            .context("settlement: template lookup")?;
        template.validate().context("settlement: template config")?;

        if !self.cycles.claim_settlement(cycle_id, now).await? {
            debug!(cycle_id, "settlement already claimed; skipping");
            return Ok(SettlementOutcome::AlreadyClaimed);
        }

        let ranked = self.select_winners(cycle_id, &template).await?;

        let total_pool = cycle.pool_value + template.sponsored_amount;
        let (platform_cut, distributable, prizes) = compute_prizes(
            total_pool,
            template.platform_cut_pct,
            &template.prize_distribution,
        );

        let mut snapshot = SettlementSnapshot {
            total_pool,
            platform_cut,
            distributable,
            winners: Vec::with_capacity(ranked.len()),
            failed_disbursements: Vec::new(),
        };

        for (index, user_id) in ranked.iter().enumerate() {
            let position = index + 1;
            let prize = prizes[index];
            match self
                .disburse_winner(cycle_id, user_id, position, prize, now)
                .await
            {
                Ok(()) => snapshot.winners.push(SnapshotWinner {
                    user_id: user_id.clone(),
                    position,
                    prize,
                }),
                Err(e) => {
                    // Partial failure never blocks closing the cycle; it is
                    // recorded for manual reconciliation.
                    error!(
                        cycle_id,
                        user_id = %user_id,
                        position,
                        prize,
                        error = %e,
                        "winner disbursement failed; manual reconciliation required"
                    );
                    snapshot.failed_disbursements.push(FailedDisbursement {
                        user_id: user_id.clone(),
                        amount: prize,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.credit_participation(cycle_id, now).await;

        let snapshot_json =
            serde_json::to_string(&snapshot).context("serialize settlement snapshot")?;
        self.cycles
            .store_settlement_snapshot(cycle_id, &snapshot_json)
            .await?;

        info!(
            cycle_id,
            total_pool,
            platform_cut,
            distributable,
            winners = snapshot.winners.len(),
            failed = snapshot.failed_disbursements.len(),
            "cycle settled"
        );
        Ok(SettlementOutcome::Settled(snapshot))
    }

    /// Walk the comment log newest-first keeping the first record per
    /// distinct user, in encounter order, until `winner_count` qualifying
    /// users are found. Spectators, non-participants, and synthetic
    /// accounts never qualify. Deterministic for a fixed log.
    async fn select_winners(&self, cycle_id: &str, template: &Template) -> Result<Vec<String>> {
        let comments = self.cycles.comments_newest_first(cycle_id).await?;
        let eligibility: HashMap<String, bool> = self
            .cycles
            .participants(cycle_id)
            .await?
            .into_iter()
            .map(|p| (p.user_id, !p.is_spectator))
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut ranked: Vec<String> = Vec::with_capacity(template.winner_count);
        for comment in comments {
            if !seen.insert(comment.user_id.clone()) {
                continue;
            }
            if !eligibility.get(&comment.user_id).copied().unwrap_or(false) {
                continue;
            }
            if self.accounts.is_synthetic(&comment.user_id).await? {
                continue;
            }
            ranked.push(comment.user_id);
            if ranked.len() == template.winner_count {
                break;
            }
        }
        Ok(ranked)
    }

    async fn disburse_winner(
        &self,
        cycle_id: &str,
        user_id: &str,
        position: usize,
        prize: i64,
        now: i64,
    ) -> Result<()> {
        self.accounts
            .credit(user_id, prize, Some(cycle_id), LedgerKind::Prize, now)
            .await
            .context("prize credit")?;
        self.cycles
            .insert_winner(&Winner {
                cycle_id: cycle_id.to_string(),
                user_id: user_id.to_string(),
                position,
                prize,
            })
            .await
            .context("winner record")?;
        self.accounts
            .add_rank_points(user_id, rank_points_for_position(position), now)
            .await
            .context("rank points")?;
        Ok(())
    }

    /// Games-played counter and flat rank credit for every non-spectator
    /// entrant. Failures here are logged only; they carry no money.
    async fn credit_participation(&self, cycle_id: &str, now: i64) {
        let participants = match self.cycles.participants(cycle_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(cycle_id, error = %e, "participation credit skipped: participant read failed");
                return;
            }
        };
        for participant in participants.iter().filter(|p| !p.is_spectator) {
            if let Err(e) = self
                .accounts
                .record_game_played(&participant.user_id, PARTICIPATION_RANK_POINTS, now)
                .await
            {
                warn!(
                    cycle_id,
                    user_id = %participant.user_id,
                    error = %e,
                    "participation credit failed"
                );
            }
        }
    }
}
