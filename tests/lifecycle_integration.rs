//! End-to-end lifecycle tests for the contest engine.
//!
//! These drive the real stores on temp-dir sqlite databases with a
//! synthetic clock: the tick processor takes `now` as a parameter, so tests
//! replay whole contests in microseconds and can fire duplicate or
//! concurrent invocations deliberately.

use std::sync::Arc;

use arena_backend::cycles::{
    AdminOps, CycleStore, EntryPath, SettlementEngine, SettlementOutcome, TickProcessor,
};
use arena_backend::models::{Phase, Template};
use arena_backend::wallet::{AccountStore, LedgerKind};
use tempfile::TempDir;

const ENTRY_FEE: i64 = 700;

fn contest_template(min_participants: i64, winner_count: usize) -> Template {
    let prize_distribution = match winner_count {
        1 => vec![100],
        3 => vec![50, 30, 20],
        n => panic!("unsupported winner_count in fixture: {n}"),
    };
    Template {
        id: 0,
        name: "integration".to_string(),
        entry_fee: ENTRY_FEE,
        waiting_secs: 10,
        entry_secs: 60,
        live_secs: 600,
        comment_timer_secs: 5,
        winner_count,
        prize_distribution,
        platform_cut_pct: 10,
        min_participants,
        sponsored_amount: 0,
        recurring: false,
    }
}

struct Harness {
    _dir: TempDir,
    cycles: Arc<CycleStore>,
    accounts: Arc<AccountStore>,
    entry: EntryPath,
    tick: TickProcessor,
    cycle_id: String,
}

impl Harness {
    async fn new(mut template: Template) -> Self {
        let dir = TempDir::new().unwrap();
        let cycles =
            Arc::new(CycleStore::new(dir.path().join("cycles.db").to_str().unwrap()).unwrap());
        let accounts =
            Arc::new(AccountStore::new(dir.path().join("wallet.db").to_str().unwrap()).unwrap());
        template.id = cycles.insert_template(&template).await.unwrap();
        let cycle = cycles.create_cycle(&template, 1_000).await.unwrap();
        let entry = EntryPath::new(cycles.clone(), accounts.clone());
        let tick = TickProcessor::new(cycles.clone(), accounts.clone());
        Self {
            _dir: dir,
            cycles,
            accounts,
            entry,
            tick,
            cycle_id: cycle.id,
        }
    }

    async fn fund(&self, user: &str, amount: i64) {
        self.accounts.get_or_create(user, 1_000).await.unwrap();
        self.accounts
            .credit(user, amount, None, LedgerKind::Deposit, 1_000)
            .await
            .unwrap();
    }

    async fn fund_and_join(&self, user: &str, now: i64) {
        self.fund(user, 10_000).await;
        self.entry
            .join_cycle(&self.cycle_id, user, false, now)
            .await
            .unwrap();
    }

    async fn phase(&self) -> Phase {
        self.cycles.get_cycle(&self.cycle_id).await.unwrap().phase
    }
}

// Timeline for the fixture template (created at 1000):
//   entry_open_at = 1010, live_start_at = 1070, live_end_at = 1670

#[tokio::test]
async fn worked_example_forty_entrants_three_winners() {
    let h = Harness::new(contest_template(10, 3)).await;

    h.tick.run_tick(1_010).await;
    for i in 0..40 {
        h.fund_and_join(&format!("user-{i:02}"), 1_020).await;
    }

    h.tick.run_tick(1_070).await;
    assert_eq!(h.phase().await, Phase::Live);
    let cycle = h.cycles.get_cycle(&h.cycle_id).await.unwrap();
    assert_eq!(cycle.pool_value, 28_000);
    assert_eq!(cycle.participant_count, 40);

    // Everyone comments once; then the last three distinct commenters
    // stake their claims.
    for i in 0..40 {
        h.entry
            .post_comment(&h.cycle_id, &format!("user-{i:02}"), "gl", 1_071)
            .await
            .unwrap();
    }
    h.entry
        .post_comment(&h.cycle_id, "user-07", "third", 1_100)
        .await
        .unwrap();
    h.entry
        .post_comment(&h.cycle_id, "user-21", "second", 1_101)
        .await
        .unwrap();
    h.entry
        .post_comment(&h.cycle_id, "user-33", "last word", 1_102)
        .await
        .unwrap();

    // Drain the countdown and settle.
    for s in 0..5 {
        h.tick.run_tick(1_103 + s).await;
    }
    assert_eq!(h.phase().await, Phase::Ending);
    h.tick.run_tick(1_108).await;
    assert_eq!(h.phase().await, Phase::Ended);

    let winners = h.cycles.winners(&h.cycle_id).await.unwrap();
    assert_eq!(winners.len(), 3);
    assert_eq!(
        winners
            .iter()
            .map(|w| (w.user_id.as_str(), w.position, w.prize))
            .collect::<Vec<_>>(),
        vec![
            ("user-33", 1, 12_600),
            ("user-21", 2, 7_560),
            ("user-07", 3, 5_040),
        ]
    );

    // Prize credits landed: 10_000 funded - 700 fee + prize.
    assert_eq!(h.accounts.balance("user-33").await.unwrap(), 21_900);
    assert_eq!(h.accounts.balance("user-21").await.unwrap(), 16_860);
    assert_eq!(h.accounts.balance("user-07").await.unwrap(), 14_340);
    // A non-winner keeps exactly funded - fee.
    assert_eq!(h.accounts.balance("user-00").await.unwrap(), 9_300);

    // sum(prizes) + cut <= pool, shortfall is dust only (zero here).
    let paid: i64 = winners.iter().map(|w| w.prize).sum();
    assert_eq!(paid + 2_800, 28_000);

    // Audit snapshot is in place.
    let cycle = h.cycles.get_cycle(&h.cycle_id).await.unwrap();
    let snapshot: serde_json::Value =
        serde_json::from_str(cycle.settlement_snapshot.as_deref().unwrap()).unwrap();
    assert_eq!(snapshot["total_pool"], 28_000);
    assert_eq!(snapshot["platform_cut"], 2_800);
    assert_eq!(snapshot["distributable"], 25_200);
    assert_eq!(snapshot["failed_disbursements"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn under_subscription_cancels_with_full_refunds() {
    let h = Harness::new(contest_template(10, 3)).await;

    h.tick.run_tick(1_010).await;
    for i in 0..5 {
        h.fund_and_join(&format!("user-{i}"), 1_020).await;
    }

    h.tick.run_tick(1_070).await;
    assert_eq!(h.phase().await, Phase::Cancelled);
    assert!(h.cycles.winners(&h.cycle_id).await.unwrap().is_empty());

    let ledger = h.accounts.ledger_for_cycle(&h.cycle_id).await.unwrap();
    let refund_total: i64 = ledger
        .iter()
        .filter(|e| e.kind == LedgerKind::Refund)
        .map(|e| e.amount)
        .sum();
    assert_eq!(refund_total, ENTRY_FEE * 5);
    for i in 0..5 {
        assert_eq!(
            h.accounts.balance(&format!("user-{i}")).await.unwrap(),
            10_000
        );
    }
}

#[tokio::test]
async fn concurrent_settlement_produces_exactly_one_winner_set() {
    let h = Harness::new(contest_template(2, 1)).await;

    h.tick.run_tick(1_010).await;
    h.fund_and_join("alice", 1_020).await;
    h.fund_and_join("bob", 1_021).await;
    h.tick.run_tick(1_070).await;
    h.entry
        .post_comment(&h.cycle_id, "alice", "claim", 1_071)
        .await
        .unwrap();
    for s in 0..5 {
        h.tick.run_tick(1_072 + s).await;
    }
    assert_eq!(h.phase().await, Phase::Ending);

    let engine_a = SettlementEngine::new(h.cycles.clone(), h.accounts.clone());
    let engine_b = SettlementEngine::new(h.cycles.clone(), h.accounts.clone());
    let (a, b) = tokio::join!(
        engine_a.settle(&h.cycle_id, 1_080),
        engine_b.settle(&h.cycle_id, 1_080)
    );

    let settled = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(|o| matches!(o, SettlementOutcome::Settled(_)))
        .count();
    assert_eq!(settled, 1);

    let winners = h.cycles.winners(&h.cycle_id).await.unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].user_id, "alice");

    // Exactly one prize credit in the ledger.
    let prize_rows = h
        .accounts
        .ledger_for_cycle(&h.cycle_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == LedgerKind::Prize)
        .count();
    assert_eq!(prize_rows, 1);
}

#[tokio::test]
async fn winner_ranking_is_deterministic_across_replays() {
    // Two independent databases, identical activity logs, identical
    // winner lists.
    let mut winner_sets = Vec::new();
    for _ in 0..2 {
        let h = Harness::new(contest_template(2, 3)).await;
        h.tick.run_tick(1_010).await;
        for user in ["ada", "grace", "edsger", "barbara"] {
            h.fund_and_join(user, 1_020).await;
        }
        h.tick.run_tick(1_070).await;
        for (user, ts) in [
            ("ada", 1_071),
            ("grace", 1_072),
            ("edsger", 1_073),
            ("ada", 1_074),
            ("barbara", 1_075),
        ] {
            h.entry
                .post_comment(&h.cycle_id, user, "go", ts)
                .await
                .unwrap();
        }
        for s in 0..5 {
            h.tick.run_tick(1_076 + s).await;
        }
        h.tick.run_tick(1_081).await;

        let winners: Vec<(String, usize)> = h
            .cycles
            .winners(&h.cycle_id)
            .await
            .unwrap()
            .into_iter()
            .map(|w| (w.user_id, w.position))
            .collect();
        winner_sets.push(winners);
    }
    assert_eq!(winner_sets[0], winner_sets[1]);
    // Most recent distinct commenters: barbara, ada, edsger.
    assert_eq!(
        winner_sets[0],
        vec![
            ("barbara".to_string(), 1),
            ("ada".to_string(), 2),
            ("edsger".to_string(), 3),
        ]
    );
}

#[tokio::test]
async fn synthetic_accounts_and_spectators_never_win() {
    let h = Harness::new(contest_template(2, 1)).await;

    h.tick.run_tick(1_010).await;
    h.fund_and_join("real", 1_020).await;
    h.fund_and_join("sim", 1_021).await;
    h.accounts.mark_synthetic("sim", true, 1_021).await.unwrap();
    h.accounts.get_or_create("lurker", 1_000).await.unwrap();
    h.entry
        .join_cycle(&h.cycle_id, "lurker", true, 1_022)
        .await
        .unwrap();

    h.tick.run_tick(1_070).await;
    // Most recent comments come from the spectator and the synthetic
    // account; neither may win.
    h.entry
        .post_comment(&h.cycle_id, "real", "first", 1_071)
        .await
        .unwrap();
    h.entry
        .post_comment(&h.cycle_id, "sim", "late", 1_072)
        .await
        .unwrap();
    h.entry
        .post_comment(&h.cycle_id, "lurker", "latest", 1_073)
        .await
        .unwrap();

    for s in 0..5 {
        h.tick.run_tick(1_074 + s).await;
    }
    h.tick.run_tick(1_079).await;

    let winners = h.cycles.winners(&h.cycle_id).await.unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].user_id, "real");
}

#[tokio::test]
async fn phases_never_skip_or_reverse() {
    let h = Harness::new(contest_template(2, 1)).await;
    h.fund("alice", 10_000).await;
    h.fund("bob", 10_000).await;

    let mut observed = vec![h.phase().await];
    let mut joined = false;
    for now in 1_000..1_700 {
        h.tick.run_tick(now).await;
        if h.phase().await == Phase::Opening && !joined {
            h.entry
                .join_cycle(&h.cycle_id, "alice", false, now)
                .await
                .unwrap();
            h.entry
                .join_cycle(&h.cycle_id, "bob", false, now)
                .await
                .unwrap();
            joined = true;
        }
        let phase = h.phase().await;
        if *observed.last().unwrap() != phase {
            observed.push(phase);
        }
        if phase.is_terminal() {
            break;
        }
    }

    assert_eq!(
        observed,
        vec![
            Phase::Waiting,
            Phase::Opening,
            Phase::Live,
            Phase::Ending,
            Phase::Ended,
        ]
    );
}

#[tokio::test]
async fn force_settle_uses_the_same_idempotency_guard() {
    let h = Harness::new(contest_template(2, 1)).await;

    h.tick.run_tick(1_010).await;
    h.fund_and_join("alice", 1_020).await;
    h.fund_and_join("bob", 1_021).await;
    h.tick.run_tick(1_070).await;
    h.entry
        .post_comment(&h.cycle_id, "bob", "mine", 1_071)
        .await
        .unwrap();

    let admin = AdminOps::new(h.cycles.clone(), h.accounts.clone());
    let outcome = admin.force_settle(&h.cycle_id, 1_080).await.unwrap();
    assert!(matches!(outcome, SettlementOutcome::Settled(_)));
    assert_eq!(h.phase().await, Phase::Ended);

    // Forcing again is refused outright; and a late duplicate tick on the
    // same cycle adds nothing.
    assert!(admin.force_settle(&h.cycle_id, 1_081).await.is_err());
    h.tick.run_tick(1_081).await;
    assert_eq!(h.cycles.winners(&h.cycle_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sponsored_pool_is_added_at_settlement() {
    let mut template = contest_template(2, 1);
    template.sponsored_amount = 5_000;
    let h = Harness::new(template).await;

    h.tick.run_tick(1_010).await;
    h.fund_and_join("alice", 1_020).await;
    h.fund_and_join("bob", 1_021).await;
    h.tick.run_tick(1_070).await;
    h.entry
        .post_comment(&h.cycle_id, "alice", "go", 1_071)
        .await
        .unwrap();
    for s in 0..5 {
        h.tick.run_tick(1_072 + s).await;
    }
    h.tick.run_tick(1_077).await;

    // pool 1400 + sponsored 5000 = 6400; cut 640; sole winner gets 5760.
    let winners = h.cycles.winners(&h.cycle_id).await.unwrap();
    assert_eq!(winners[0].prize, 5_760);
}
