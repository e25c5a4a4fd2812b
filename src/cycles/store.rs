//! Cycle store: templates, cycles, participants, comments, winners.
//!
//! All concurrency safety lives here as conditional UPDATEs. Every phase
//! write is guarded on the expected current phase, settlement claims are
//! guarded on `settled_at IS NULL`, and the two countdown writers use
//! guards that make the tick's decrement and the comment path's reset
//! commute safely. Callers check the affected-row count; zero rows means
//! another invocation got there first and is never an error.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Comment, Cycle, Participant, Phase, Template, Winner};

#[derive(Clone)]
pub struct CycleStore {
    conn: Arc<Mutex<Connection>>,
}

impl CycleStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open cycle db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                entry_fee INTEGER NOT NULL,
                waiting_secs INTEGER NOT NULL,
                entry_secs INTEGER NOT NULL,
                live_secs INTEGER NOT NULL,
                comment_timer_secs INTEGER NOT NULL,
                winner_count INTEGER NOT NULL,
                prize_distribution TEXT NOT NULL,
                platform_cut_pct INTEGER NOT NULL,
                min_participants INTEGER NOT NULL,
                sponsored_amount INTEGER NOT NULL DEFAULT 0,
                recurring INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cycles (
                id TEXT PRIMARY KEY,
                template_id INTEGER NOT NULL,
                phase TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                entry_open_at INTEGER NOT NULL,
                entry_close_at INTEGER NOT NULL,
                live_start_at INTEGER NOT NULL,
                live_end_at INTEGER NOT NULL,
                participant_count INTEGER NOT NULL DEFAULT 0,
                pool_value INTEGER NOT NULL DEFAULT 0,
                countdown INTEGER NOT NULL DEFAULT 0,
                settled_at INTEGER,
                settlement_snapshot TEXT,
                FOREIGN KEY (template_id) REFERENCES templates(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cycles_phase ON cycles(phase)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cycles_template ON cycles(template_id, live_end_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS participants (
                cycle_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                is_spectator INTEGER NOT NULL DEFAULT 0,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (cycle_id, user_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_comments_cycle_ts
             ON comments(cycle_id, created_at DESC, id DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS winners (
                cycle_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                prize INTEGER NOT NULL,
                PRIMARY KEY (cycle_id, position)
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- templates ----

    pub async fn insert_template(&self, template: &Template) -> Result<i64> {
        template.validate()?;
        let distribution = serde_json::to_string(&template.prize_distribution)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO templates (name, entry_fee, waiting_secs, entry_secs, live_secs,
                comment_timer_secs, winner_count, prize_distribution, platform_cut_pct,
                min_participants, sponsored_amount, recurring)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                template.name,
                template.entry_fee,
                template.waiting_secs,
                template.entry_secs,
                template.live_secs,
                template.comment_timer_secs,
                template.winner_count as i64,
                distribution,
                template.platform_cut_pct,
                template.min_participants,
                template.sponsored_amount,
                template.recurring as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Seed helper: insert unless a template with the same name exists.
    /// Returns the id either way.
    pub async fn insert_template_if_absent(&self, template: &Template) -> Result<i64> {
        {
            let conn = self.conn.lock().await;
            let existing: Option<i64> = conn
                .prepare_cached("SELECT id FROM templates WHERE name = ?1")?
                .query_row(params![template.name], |row| row.get(0))
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }
        self.insert_template(template).await
    }

    /// A missing template is a configuration error for the cycle that
    /// references it, never a silent default.
    pub async fn get_template(&self, template_id: i64) -> Result<Template> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, entry_fee, waiting_secs, entry_secs, live_secs,
                    comment_timer_secs, winner_count, prize_distribution, platform_cut_pct,
                    min_participants, sponsored_amount, recurring
             FROM templates WHERE id = ?1",
        )?;
        stmt.query_row(params![template_id], row_to_template)
            .optional()?
            .ok_or_else(|| anyhow!("template {template_id} not found"))
    }

    pub async fn list_recurring_templates(&self) -> Result<Vec<Template>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, entry_fee, waiting_secs, entry_secs, live_secs,
                    comment_timer_secs, winner_count, prize_distribution, platform_cut_pct,
                    min_participants, sponsored_amount, recurring
             FROM templates WHERE recurring = 1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_template)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- cycle lifecycle ----

    /// Create a cycle in `Waiting` with all boundary timestamps computed
    /// once from `now` and the template's duration fields.
    pub async fn create_cycle(&self, template: &Template, now: i64) -> Result<Cycle> {
        let id = Uuid::new_v4().to_string();
        let entry_open_at = now + template.waiting_secs;
        let live_start_at = entry_open_at + template.entry_secs;
        let live_end_at = live_start_at + template.live_secs;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cycles (id, template_id, phase, created_at, entry_open_at,
                entry_close_at, live_start_at, live_end_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                template.id,
                Phase::Waiting.as_str(),
                now,
                entry_open_at,
                live_start_at, // entry closes when live starts
                live_start_at,
                live_end_at,
            ],
        )?;

        Ok(Cycle {
            id,
            template_id: template.id,
            phase: Phase::Waiting,
            created_at: now,
            entry_open_at,
            entry_close_at: live_start_at,
            live_start_at,
            live_end_at,
            participant_count: 0,
            pool_value: 0,
            countdown: 0,
            settled_at: None,
            settlement_snapshot: None,
        })
    }

    pub async fn get_cycle(&self, cycle_id: &str) -> Result<Cycle> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{CYCLE_SELECT} WHERE id = ?1"))?;
        let row = stmt
            .query_row(params![cycle_id], row_to_cycle_raw)
            .optional()?
            .ok_or_else(|| anyhow!("cycle {cycle_id} not found"))?;
        raw_to_cycle(row)
    }

    /// Every cycle in a non-terminal phase, the tick processor's work list.
    pub async fn active_cycles(&self) -> Result<Vec<Cycle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{CYCLE_SELECT} WHERE phase NOT IN ('ended', 'cancelled') ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], row_to_cycle_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(raw_to_cycle(row?)?);
        }
        Ok(out)
    }

    pub async fn has_active_cycle_for_template(&self, template_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM cycles
             WHERE template_id = ?1 AND phase NOT IN ('ended', 'cancelled') LIMIT 1",
        )?;
        let found: Option<i64> = stmt
            .query_row(params![template_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// End time of the most recent terminal cycle for a template, if any.
    /// Drives the recurrence cooldown.
    pub async fn latest_terminal_end(&self, template_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT MAX(live_end_at) FROM cycles
             WHERE template_id = ?1 AND phase IN ('ended', 'cancelled')",
        )?;
        let end: Option<i64> = stmt.query_row(params![template_id], |row| row.get(0))?;
        Ok(end)
    }

    /// Conditional phase write. Returns true only when this call performed
    /// the transition; a stale `from` loses the race and returns false.
    pub async fn transition_phase(&self, cycle_id: &str, from: Phase, to: Phase) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cycles SET phase = ?1 WHERE id = ?2 AND phase = ?3",
            params![to.as_str(), cycle_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// `opening → live` plus the initial countdown, in one guarded write.
    pub async fn begin_live(&self, cycle_id: &str, countdown: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cycles SET phase = 'live', countdown = ?1
             WHERE id = ?2 AND phase = 'opening'",
            params![countdown, cycle_id],
        )?;
        Ok(changed == 1)
    }

    /// Per-tick countdown decrement, clamped at zero. Only valid while
    /// live; a cycle that already advanced is untouched.
    pub async fn decrement_countdown(&self, cycle_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE cycles SET countdown = MAX(countdown - 1, 0)
             WHERE id = ?1 AND phase = 'live'",
            params![cycle_id],
        )?;
        Ok(())
    }

    /// Comment-path countdown reset. Guarded so it only ever increases the
    /// countdown and never resurrects a cycle that left `live`.
    pub async fn reset_countdown(&self, cycle_id: &str, reset: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cycles SET countdown = ?1
             WHERE id = ?2 AND phase = 'live' AND countdown < ?1",
            params![reset, cycle_id],
        )?;
        Ok(changed == 1)
    }

    /// `live → ending` once the countdown hits zero or the hard stop has
    /// passed. Returns true when this call performed the transition.
    pub async fn finish_live_if_due(&self, cycle_id: &str, now: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cycles SET phase = 'ending'
             WHERE id = ?1 AND phase = 'live' AND (countdown <= 0 OR ?2 >= live_end_at)",
            params![cycle_id, now],
        )?;
        Ok(changed == 1)
    }

    /// Settlement idempotency guard: claims the cycle by setting
    /// `settled_at` only if it is currently unset. Exactly one caller ever
    /// sees true.
    pub async fn claim_settlement(&self, cycle_id: &str, now: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cycles SET settled_at = ?1 WHERE id = ?2 AND settled_at IS NULL",
            params![now, cycle_id],
        )?;
        Ok(changed == 1)
    }

    pub async fn store_settlement_snapshot(&self, cycle_id: &str, snapshot: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE cycles SET settlement_snapshot = ?1 WHERE id = ?2",
            params![snapshot, cycle_id],
        )?;
        Ok(())
    }

    // ---- participants & comments ----

    /// Insert a join record. Returns false for a duplicate (cycle, user)
    /// pair, which is a no-op by contract.
    pub async fn insert_participant(
        &self,
        cycle_id: &str,
        user_id: &str,
        is_spectator: bool,
        now: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO participants (cycle_id, user_id, is_spectator, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![cycle_id, user_id, is_spectator as i64, now],
        )?;
        Ok(changed == 1)
    }

    /// Compensation path for a join whose fee debit failed.
    pub async fn remove_participant(&self, cycle_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM participants WHERE cycle_id = ?1 AND user_id = ?2",
            params![cycle_id, user_id],
        )?;
        Ok(())
    }

    /// Counter bump for a paid (non-spectator) entry, guarded on the entry
    /// window still being open. Spectators never touch these counters.
    pub async fn record_entry(&self, cycle_id: &str, entry_fee: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cycles SET participant_count = participant_count + 1,
                               pool_value = pool_value + ?1
             WHERE id = ?2 AND phase = 'opening'",
            params![entry_fee, cycle_id],
        )?;
        Ok(changed == 1)
    }

    pub async fn participants(&self, cycle_id: &str) -> Result<Vec<Participant>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT cycle_id, user_id, is_spectator, joined_at
             FROM participants WHERE cycle_id = ?1 ORDER BY joined_at ASC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![cycle_id], |row| {
            Ok(Participant {
                cycle_id: row.get(0)?,
                user_id: row.get(1)?,
                is_spectator: row.get::<_, i64>(2)? == 1,
                joined_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn is_participant(&self, cycle_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM participants WHERE cycle_id = ?1 AND user_id = ?2",
        )?;
        let found: Option<i64> = stmt
            .query_row(params![cycle_id, user_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn append_comment(
        &self,
        cycle_id: &str,
        user_id: &str,
        body: &str,
        now: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO comments (cycle_id, user_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![cycle_id, user_id, body, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Comments newest first; ties on the same second break by insert order
    /// (higher rowid = later) so ranking stays deterministic.
    pub async fn comments_newest_first(&self, cycle_id: &str) -> Result<Vec<Comment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, cycle_id, user_id, body, created_at
             FROM comments WHERE cycle_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![cycle_id], |row| {
            Ok(Comment {
                id: row.get(0)?,
                cycle_id: row.get(1)?,
                user_id: row.get(2)?,
                body: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- winners ----

    pub async fn insert_winner(&self, winner: &Winner) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO winners (cycle_id, user_id, position, prize)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                winner.cycle_id,
                winner.user_id,
                winner.position as i64,
                winner.prize
            ],
        )?;
        Ok(())
    }

    pub async fn winners(&self, cycle_id: &str) -> Result<Vec<Winner>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT cycle_id, user_id, position, prize
             FROM winners WHERE cycle_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![cycle_id], |row| {
            Ok(Winner {
                cycle_id: row.get(0)?,
                user_id: row.get(1)?,
                position: row.get::<_, i64>(2)? as usize,
                prize: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- observability ----

    /// Non-terminal cycles whose hard stop passed more than `grace_secs`
    /// ago. A non-empty result is the alertable "stuck cycle" symptom.
    pub async fn stuck_cycles(&self, now: i64, grace_secs: i64) -> Result<Vec<Cycle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{CYCLE_SELECT}
             WHERE phase NOT IN ('ended', 'cancelled') AND live_end_at + ?1 <= ?2
             ORDER BY live_end_at ASC"
        ))?;
        let rows = stmt.query_map(params![grace_secs, now], row_to_cycle_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(raw_to_cycle(row?)?);
        }
        Ok(out)
    }
}

const CYCLE_SELECT: &str = "SELECT id, template_id, phase, created_at, entry_open_at,
    entry_close_at, live_start_at, live_end_at, participant_count, pool_value,
    countdown, settled_at, settlement_snapshot FROM cycles";

// Phase parsing can fail, and rusqlite row closures cannot carry anyhow
// errors, so rows come out raw and are finished outside the closure.
type RawCycleRow = (
    String,
    i64,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<i64>,
    Option<String>,
);

fn row_to_cycle_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCycleRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn raw_to_cycle(raw: RawCycleRow) -> Result<Cycle> {
    let (
        id,
        template_id,
        phase,
        created_at,
        entry_open_at,
        entry_close_at,
        live_start_at,
        live_end_at,
        participant_count,
        pool_value,
        countdown,
        settled_at,
        settlement_snapshot,
    ) = raw;
    Ok(Cycle {
        id,
        template_id,
        phase: Phase::parse(&phase)?,
        created_at,
        entry_open_at,
        entry_close_at,
        live_start_at,
        live_end_at,
        participant_count,
        pool_value,
        countdown,
        settled_at,
        settlement_snapshot,
    })
}

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<Template> {
    let distribution: String = row.get(8)?;
    let prize_distribution: Vec<i64> = serde_json::from_str(&distribution).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        entry_fee: row.get(2)?,
        waiting_secs: row.get(3)?,
        entry_secs: row.get(4)?,
        live_secs: row.get(5)?,
        comment_timer_secs: row.get(6)?,
        winner_count: row.get::<_, i64>(7)? as usize,
        prize_distribution,
        platform_cut_pct: row.get(9)?,
        min_participants: row.get(10)?,
        sponsored_amount: row.get(11)?,
        recurring: row.get::<_, i64>(12)? == 1,
    })
}
