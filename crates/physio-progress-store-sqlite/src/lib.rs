//! SQLite persistence for the progression engine: versioned catalogs, user
//! stats, the append-only event log, earned badges and reward claims.
//!
//! Every event is applied inside one `IMMEDIATE` transaction guarded by the
//! stats revision, and [`SqliteProgressStore::verify_user`] replays the log
//! to check that stored state still matches the engine.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use physio_progress_core::{
    apply_event, format_date, format_rfc3339, now_utc, parse_date, parse_rfc3339_utc,
    ClaimStatus, ClaimedReward, EarnedBadge, EventResult, ProgressCatalog, ProgressEvent,
    ProgressEventKind, RankProgress, Reward, RewardKind, UserId, UserStats,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const PROGRESS_MIGRATION_VERSION: i64 = 1;

pub const PROGRESS_SUMMARY_CONTRACT: &str = "progress_summary.v1";
pub const CONSISTENCY_REPORT_CONTRACT: &str = "consistency_report.v1";

const SCHEMA_PROGRESS_V1: &str = r"
CREATE TABLE IF NOT EXISTS progress_catalogs (
  catalog_version INTEGER PRIMARY KEY CHECK (catalog_version >= 1),
  catalog_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_stats (
  user_id TEXT PRIMARY KEY,
  lessons_completed INTEGER NOT NULL CHECK (lessons_completed >= 0),
  courses_completed INTEGER NOT NULL CHECK (courses_completed >= 0),
  login_streak INTEGER NOT NULL CHECK (login_streak >= 0),
  longest_streak INTEGER NOT NULL CHECK (longest_streak >= login_streak),
  total_xp INTEGER NOT NULL CHECK (total_xp >= 0),
  last_activity_date TEXT,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_user_stats_monotonic
BEFORE UPDATE ON user_stats
WHEN NEW.lessons_completed < OLD.lessons_completed
  OR NEW.courses_completed < OLD.courses_completed
  OR NEW.longest_streak < OLD.longest_streak
  OR NEW.total_xp < OLD.total_xp
BEGIN
  SELECT RAISE(FAIL, 'user_stats counters never decrease');
END;

CREATE INDEX IF NOT EXISTS idx_user_stats_leaderboard
  ON user_stats(total_xp DESC, user_id ASC);

CREATE TABLE IF NOT EXISTS progress_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (
    event_type IN ('lesson_complete', 'course_complete', 'streak_rollover')
  ),
  activity_date TEXT,
  catalog_version INTEGER NOT NULL,
  xp_gained INTEGER NOT NULL CHECK (xp_gained >= 0),
  rank_before TEXT NOT NULL,
  rank_after TEXT NOT NULL,
  result_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  CHECK (event_type <> 'streak_rollover' OR activity_date IS NOT NULL),
  FOREIGN KEY (catalog_version) REFERENCES progress_catalogs(catalog_version)
);

CREATE TRIGGER IF NOT EXISTS trg_progress_events_no_update
BEFORE UPDATE ON progress_events
BEGIN
  SELECT RAISE(FAIL, 'progress_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_progress_events_no_delete
BEFORE DELETE ON progress_events
BEGIN
  SELECT RAISE(FAIL, 'progress_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_progress_events_user_seq
  ON progress_events(user_id, event_seq);

CREATE TABLE IF NOT EXISTS earned_badges (
  user_id TEXT NOT NULL,
  badge_id TEXT NOT NULL,
  event_seq INTEGER NOT NULL,
  earned_at TEXT NOT NULL,
  PRIMARY KEY (user_id, badge_id),
  FOREIGN KEY (event_seq) REFERENCES progress_events(event_seq)
);

CREATE TRIGGER IF NOT EXISTS trg_earned_badges_no_update
BEFORE UPDATE ON earned_badges
BEGIN
  SELECT RAISE(FAIL, 'earned_badges is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_earned_badges_no_delete
BEFORE DELETE ON earned_badges
BEGIN
  SELECT RAISE(FAIL, 'earned_badges is append-only');
END;

CREATE TABLE IF NOT EXISTS claimed_rewards (
  user_id TEXT NOT NULL,
  badge_id TEXT NOT NULL,
  reward_kind TEXT NOT NULL CHECK (
    reward_kind IN ('promo_code', 'bonus_days', 'discount_percent')
  ),
  reward_value TEXT NOT NULL,
  reward_label TEXT NOT NULL,
  claimed INTEGER NOT NULL DEFAULT 0 CHECK (claimed IN (0, 1)),
  claimed_at TEXT,
  created_at TEXT NOT NULL,
  CHECK ((claimed = 0 AND claimed_at IS NULL) OR (claimed = 1 AND claimed_at IS NOT NULL)),
  PRIMARY KEY (user_id, badge_id),
  FOREIGN KEY (user_id, badge_id) REFERENCES earned_badges(user_id, badge_id)
);

CREATE TRIGGER IF NOT EXISTS trg_claimed_rewards_claim_is_final
BEFORE UPDATE ON claimed_rewards
WHEN OLD.claimed = 1
BEGIN
  SELECT RAISE(FAIL, 'claimed_rewards claim is final');
END;

CREATE TRIGGER IF NOT EXISTS trg_claimed_rewards_no_delete
BEFORE DELETE ON claimed_rewards
BEGIN
  SELECT RAISE(FAIL, 'claimed_rewards is append-only');
END;
";

pub struct SqliteProgressStore {
    conn: Connection,
}

/// One logical event to apply for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventInput {
    /// Caller-supplied id; a repeat of a recorded id is not applied again.
    pub event_id: Option<Ulid>,
    pub user_id: UserId,
    pub event: ProgressEvent,
    pub catalog_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub user_id: UserId,
    pub event: ProgressEvent,
    pub catalog_version: u32,
    pub rank_before: String,
    pub rank_after: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub result: EventResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedEvent {
    #[serde(flatten)]
    pub stored: StoredEvent,
    /// True when `event_id` had already been recorded and nothing changed.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub user_id: UserId,
    pub badge_id: String,
    pub status: ClaimStatus,
    pub reward: Option<ClaimedReward>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSummary {
    pub contract_version: String,
    pub user_id: UserId,
    pub catalog_version: u32,
    pub known_user: bool,
    pub stats: UserStats,
    pub rank: RankProgress,
    pub earned_badges: usize,
    pub total_badges: usize,
    pub unclaimed_rewards: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub position: usize,
    pub user_id: UserId,
    pub total_xp: u64,
    pub rank_id: String,
    pub rank_name: String,
    pub badges_earned: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub contract_version: String,
    pub user_id: UserId,
    pub healthy: bool,
    pub replayed_events: usize,
    pub expected_stats: UserStats,
    pub stored_stats: Option<UserStats>,
    pub issues: Vec<ConsistencyIssue>,
}

impl SqliteProgressStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PROGRESS_V1)
            .context("failed to apply progress schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROGRESS_MIGRATION_VERSION, now],
            )
            .context("failed to register progress schema migration")?;
        if inserted > 0 {
            info!(version = PROGRESS_MIGRATION_VERSION, "applied progress schema migration");
        }

        self.upsert_catalog(&ProgressCatalog::v1())?;
        Ok(())
    }

    /// Registers a catalog version. Re-registering identical content is a
    /// no-op; a version may never change content once events reference it.
    pub fn upsert_catalog(&self, catalog: &ProgressCatalog) -> Result<()> {
        catalog
            .validate()
            .map_err(|err| anyhow!("invalid catalog configuration: {err}"))?;

        let version = catalog.catalog_version();
        if let Some(existing) = self.get_catalog(version)? {
            if &existing == catalog {
                return Ok(());
            }
            return Err(anyhow!(
                "catalog_version {version} is already registered with different content"
            ));
        }

        let payload = serde_json::to_string(catalog).context("failed to serialize catalog")?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO progress_catalogs(catalog_version, catalog_json, created_at)
                 VALUES (?1, ?2, ?3)",
                params![i64::from(version), payload, now],
            )
            .context("failed to insert catalog")?;

        info!(catalog_version = version, "registered progress catalog");
        Ok(())
    }

    pub fn get_catalogs(&self) -> Result<BTreeMap<u32, ProgressCatalog>> {
        let mut stmt = self.conn.prepare(
            "SELECT catalog_version, catalog_json FROM progress_catalogs ORDER BY catalog_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid catalog_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            map.insert(version, decode_catalog(version, &json)?);
        }

        Ok(map)
    }

    pub fn get_catalog(&self, version: u32) -> Result<Option<ProgressCatalog>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT catalog_json FROM progress_catalogs WHERE catalog_version = ?1",
                params![i64::from(version)],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load catalog")?;

        json.map(|raw| decode_catalog(version, &raw)).transpose()
    }

    pub fn get_user_stats(&self, user_id: UserId) -> Result<Option<UserStats>> {
        Ok(load_stats(&self.conn, user_id)?.map(|(stats, _)| stats))
    }

    pub fn earned_badge_ids(&self, user_id: UserId) -> Result<BTreeSet<String>> {
        load_earned_ids(&self.conn, user_id)
    }

    pub fn list_earned_badges(&self, user_id: UserId) -> Result<Vec<EarnedBadge>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, badge_id, event_seq, earned_at
             FROM earned_badges
             WHERE user_id = ?1
             ORDER BY event_seq ASC, badge_id ASC",
        )?;

        let rows = stmt.query_map(params![user_id.to_string()], parse_earned_badge_row)?;
        collect_rows(rows)
    }

    /// Applies one event inside a single write transaction: stats, earned
    /// badges, reward rows and the event log entry commit together or not
    /// at all.
    pub fn record_event(&mut self, input: &EventInput) -> Result<RecordedEvent> {
        let catalog = self.get_catalog(input.catalog_version)?.ok_or_else(|| {
            anyhow!(
                "missing catalog_version {} in progress_catalogs",
                input.catalog_version
            )
        })?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start event transaction")?;

        if let Some(event_id) = input.event_id {
            if let Some(existing) = find_event(&tx, event_id)? {
                if existing.user_id != input.user_id
                    || existing.event != input.event
                    || existing.catalog_version != input.catalog_version
                {
                    return Err(anyhow!(
                        "event_id {event_id} was already recorded for a different event"
                    ));
                }
                warn!(
                    event_id = %event_id,
                    user_id = %input.user_id,
                    event_seq = existing.event_seq,
                    "duplicate event id; returning recorded result"
                );
                return Ok(RecordedEvent {
                    stored: existing,
                    duplicate: true,
                });
            }
        }

        let current = load_stats(&tx, input.user_id)?;
        let earned = load_earned_ids(&tx, input.user_id)?;
        let stats = current
            .as_ref()
            .map(|(stats, _)| stats.clone())
            .unwrap_or_default();

        let result = apply_event(&stats, &input.event, &earned, &catalog);
        let final_rank = result.new_rank.as_ref().unwrap_or(&result.previous_rank);

        let event_id = input.event_id.unwrap_or_else(Ulid::new);
        let recorded_at = now_utc();
        let recorded_at_raw =
            format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?;

        write_stats(
            &tx,
            input.user_id,
            &result.final_stats,
            current.as_ref().map(|(_, revision)| *revision),
            &recorded_at_raw,
        )?;

        let activity_date = input
            .event
            .activity_date()
            .map(format_date)
            .transpose()
            .map_err(|err| anyhow!(err.to_string()))?;

        tx.execute(
            "INSERT INTO progress_events(
                event_id, user_id, event_type, activity_date, catalog_version,
                xp_gained, rank_before, rank_after, result_json, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event_id.to_string(),
                input.user_id.to_string(),
                input.event.kind().as_str(),
                activity_date,
                i64::from(input.catalog_version),
                xp_to_sql(result.xp_gained)?,
                result.previous_rank.id,
                final_rank.id,
                serde_json::to_string(&result).context("failed to serialize event result")?,
                recorded_at_raw,
            ],
        )
        .context("failed to append progress event")?;

        let event_seq = tx.last_insert_rowid();

        for badge in &result.newly_unlocked_badges {
            tx.execute(
                "INSERT INTO earned_badges(user_id, badge_id, event_seq, earned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![input.user_id.to_string(), badge.id, event_seq, recorded_at_raw],
            )
            .with_context(|| format!("failed to record earned badge {}", badge.id))?;

            if let Some(reward) = &badge.reward {
                tx.execute(
                    "INSERT INTO claimed_rewards(
                        user_id, badge_id, reward_kind, reward_value, reward_label,
                        claimed, claimed_at, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)",
                    params![
                        input.user_id.to_string(),
                        badge.id,
                        reward.kind.as_str(),
                        reward.value,
                        reward.label,
                        recorded_at_raw,
                    ],
                )
                .with_context(|| format!("failed to record reward for badge {}", badge.id))?;
            }
        }

        tx.commit().context("failed to commit event transaction")?;

        debug!(
            user_id = %input.user_id,
            event = input.event.kind().as_str(),
            event_seq,
            xp_gained = result.xp_gained,
            total_xp = result.final_stats.total_xp,
            "applied progress event"
        );
        for badge in &result.newly_unlocked_badges {
            info!(user_id = %input.user_id, badge_id = %badge.id, xp_reward = badge.xp_reward, "badge unlocked");
        }
        if let Some(new_rank) = &result.new_rank {
            info!(
                user_id = %input.user_id,
                from = %result.previous_rank.id,
                to = %new_rank.id,
                "rank changed"
            );
        }

        Ok(RecordedEvent {
            stored: StoredEvent {
                event_seq,
                event_id,
                user_id: input.user_id,
                event: input.event,
                catalog_version: input.catalog_version,
                rank_before: result.previous_rank.id.clone(),
                rank_after: final_rank.id.clone(),
                recorded_at,
                result,
            },
            duplicate: false,
        })
    }

    pub fn list_events(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<StoredEvent>> {
        let mut query = "SELECT
                event_seq, event_id, user_id, event_type, activity_date, catalog_version,
                rank_before, rank_after, result_json, recorded_at
             FROM progress_events
             WHERE user_id = ?1
             ORDER BY event_seq ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id.to_string()], parse_event_row)?;
        collect_rows(rows)
    }

    pub fn list_rewards(&self, user_id: UserId) -> Result<Vec<ClaimedReward>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, badge_id, reward_kind, reward_value, reward_label,
                    claimed, claimed_at, created_at
             FROM claimed_rewards
             WHERE user_id = ?1
             ORDER BY created_at ASC, badge_id ASC",
        )?;

        let rows = stmt.query_map(params![user_id.to_string()], parse_reward_row)?;
        collect_rows(rows)
    }

    /// Marks the reward attached to an earned badge as claimed.
    ///
    /// Claiming twice succeeds and keeps the first `claimed_at`. A badge
    /// without a reward reports [`ClaimStatus::NoReward`]. A badge the user
    /// has not earned is an error.
    pub fn claim_reward(
        &mut self,
        user_id: UserId,
        badge_id: &str,
        at: OffsetDateTime,
    ) -> Result<ClaimOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start claim transaction")?;

        let earned: Option<i64> = tx
            .query_row(
                "SELECT event_seq FROM earned_badges WHERE user_id = ?1 AND badge_id = ?2",
                params![user_id.to_string(), badge_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up earned badge")?;
        if earned.is_none() {
            return Err(anyhow!(
                "badge {badge_id} has not been earned by user {user_id}"
            ));
        }

        let reward = tx
            .query_row(
                "SELECT user_id, badge_id, reward_kind, reward_value, reward_label,
                        claimed, claimed_at, created_at
                 FROM claimed_rewards
                 WHERE user_id = ?1 AND badge_id = ?2",
                params![user_id.to_string(), badge_id],
                parse_reward_row,
            )
            .optional()
            .context("failed to load reward")?;

        let Some(mut reward) = reward else {
            return Ok(ClaimOutcome {
                user_id,
                badge_id: badge_id.to_string(),
                status: ClaimStatus::NoReward,
                reward: None,
            });
        };

        let status = reward.claim(at);
        if status == ClaimStatus::Claimed {
            let claimed_at = reward
                .claimed_at
                .map(format_rfc3339)
                .transpose()
                .map_err(|err| anyhow!(err.to_string()))?;
            tx.execute(
                "UPDATE claimed_rewards
                 SET claimed = 1, claimed_at = ?3
                 WHERE user_id = ?1 AND badge_id = ?2 AND claimed = 0",
                params![user_id.to_string(), badge_id, claimed_at],
            )
            .context("failed to mark reward claimed")?;
            tx.commit().context("failed to commit claim transaction")?;
            info!(user_id = %user_id, badge_id, kind = reward.reward.kind.as_str(), "reward claimed");
        } else {
            debug!(user_id = %user_id, badge_id, "reward already claimed");
        }

        Ok(ClaimOutcome {
            user_id,
            badge_id: badge_id.to_string(),
            status,
            reward: Some(reward),
        })
    }

    pub fn progress_summary(
        &self,
        user_id: UserId,
        catalog: &ProgressCatalog,
    ) -> Result<ProgressSummary> {
        let stored = self.get_user_stats(user_id)?;
        let known_user = stored.is_some();
        let stats = stored.unwrap_or_default();
        let earned = self.earned_badge_ids(user_id)?;
        let unclaimed_rewards = self
            .list_rewards(user_id)?
            .iter()
            .filter(|item| !item.claimed)
            .count();

        Ok(ProgressSummary {
            contract_version: PROGRESS_SUMMARY_CONTRACT.to_string(),
            user_id,
            catalog_version: catalog.catalog_version(),
            known_user,
            rank: catalog.rank_progress(stats.total_xp),
            stats,
            earned_badges: earned.len(),
            total_badges: catalog.badges().len(),
            unclaimed_rewards,
        })
    }

    pub fn leaderboard(
        &self,
        limit: usize,
        catalog: &ProgressCatalog,
    ) -> Result<Vec<LeaderboardEntry>> {
        let limit_i64 = i64::try_from(limit).context("leaderboard limit out of range")?;
        let mut stmt = self.conn.prepare(
            "SELECT s.user_id, s.total_xp,
                    (SELECT COUNT(*) FROM earned_badges e WHERE e.user_id = s.user_id)
             FROM user_stats s
             ORDER BY s.total_xp DESC, s.user_id ASC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit_i64], |row| {
            let user_id = parse_user_id(0, &row.get::<_, String>(0)?)?;
            let total_xp = column_u64(row.get(1)?, 1, "total_xp")?;
            let badges: i64 = row.get(2)?;
            Ok((user_id, total_xp, badges))
        })?;

        let mut entries = Vec::new();
        for (index, row) in collect_rows(rows)?.into_iter().enumerate() {
            let (user_id, total_xp, badges) = row;
            let rank = catalog.rank_for_xp(total_xp);
            entries.push(LeaderboardEntry {
                position: index + 1,
                user_id,
                total_xp,
                rank_id: rank.id.clone(),
                rank_name: rank.name.clone(),
                badges_earned: usize::try_from(badges)
                    .with_context(|| format!("invalid badge count {badges} for {user_id}"))?,
            });
        }
        Ok(entries)
    }

    /// Replays the user's event log through the engine and compares the
    /// outcome with the stored stats, badges and reward rows.
    pub fn verify_user(&self, user_id: UserId) -> Result<ConsistencyReport> {
        let catalogs = self.get_catalogs()?;
        let events = self.list_events(user_id, None)?;
        let mut issues = Vec::new();

        let mut expected = UserStats::default();
        let mut expected_badges = BTreeSet::new();
        let mut expected_rewards: BTreeMap<String, Reward> = BTreeMap::new();

        for event in &events {
            let Some(catalog) = catalogs.get(&event.catalog_version) else {
                issues.push(issue(
                    "missing_catalog",
                    IssueSeverity::Error,
                    format!(
                        "event {} references unknown catalog_version {}",
                        event.event_seq, event.catalog_version
                    ),
                ));
                continue;
            };

            let replayed = apply_event(&expected, &event.event, &expected_badges, catalog);
            if replayed != event.result {
                issues.push(issue(
                    "event_result_mismatch",
                    IssueSeverity::Error,
                    format!(
                        "event {} recorded a result that differs from replay",
                        event.event_seq
                    ),
                ));
            }

            for badge in &replayed.newly_unlocked_badges {
                expected_badges.insert(badge.id.clone());
                if let Some(reward) = &badge.reward {
                    expected_rewards.insert(badge.id.clone(), reward.clone());
                }
            }
            expected = replayed.final_stats;
        }

        let stored = load_stats(&self.conn, user_id)?;
        match &stored {
            Some((stats, revision)) => {
                if stats != &expected {
                    issues.push(issue(
                        "stats_mismatch",
                        IssueSeverity::Error,
                        format!("stored stats {stats:?} differ from replayed stats {expected:?}"),
                    ));
                }
                let applied =
                    i64::try_from(events.len()).context("event count exceeds i64 range")?;
                if *revision != applied {
                    issues.push(issue(
                        "revision_mismatch",
                        IssueSeverity::Warning,
                        format!("stats revision {revision} but {applied} events recorded"),
                    ));
                }
            }
            None if !events.is_empty() => issues.push(issue(
                "missing_stats",
                IssueSeverity::Error,
                format!("{} events recorded but no stats row exists", events.len()),
            )),
            None => {}
        }

        let stored_badges = self.earned_badge_ids(user_id)?;
        for missing in expected_badges.difference(&stored_badges) {
            issues.push(issue(
                "missing_badge",
                IssueSeverity::Error,
                format!("badge {missing} unlocked on replay but not stored"),
            ));
        }
        for extra in stored_badges.difference(&expected_badges) {
            issues.push(issue(
                "unexpected_badge",
                IssueSeverity::Error,
                format!("badge {extra} stored but not unlocked on replay"),
            ));
        }

        let stored_rewards: BTreeMap<String, ClaimedReward> = self
            .list_rewards(user_id)?
            .into_iter()
            .map(|item| (item.badge_id.clone(), item))
            .collect();
        for (badge_id, reward) in &expected_rewards {
            match stored_rewards.get(badge_id) {
                None => issues.push(issue(
                    "missing_reward_row",
                    IssueSeverity::Error,
                    format!("badge {badge_id} carries a reward but no reward row exists"),
                )),
                Some(row) if &row.reward != reward => issues.push(issue(
                    "reward_mismatch",
                    IssueSeverity::Warning,
                    format!("reward row for badge {badge_id} differs from catalog"),
                )),
                Some(_) => {}
            }
        }
        for badge_id in stored_rewards.keys() {
            if !expected_rewards.contains_key(badge_id) {
                issues.push(issue(
                    "orphan_reward_row",
                    IssueSeverity::Error,
                    format!("reward row for badge {badge_id} has no rewarding unlock"),
                ));
            }
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == IssueSeverity::Error);
        for item in &issues {
            warn!(user_id = %user_id, code = %item.code, "{}", item.message);
        }

        Ok(ConsistencyReport {
            contract_version: CONSISTENCY_REPORT_CONTRACT.to_string(),
            user_id,
            healthy,
            replayed_events: events.len(),
            expected_stats: expected,
            stored_stats: stored.map(|(stats, _)| stats),
            issues,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn decode_catalog(version: u32, json: &str) -> Result<ProgressCatalog> {
    let value: Value = serde_json::from_str(json).context("invalid stored catalog JSON")?;
    ProgressCatalog::from_json(&value)
        .map_err(|err| anyhow!("failed to parse catalog {version}: {err}"))
}

fn load_stats(conn: &Connection, user_id: UserId) -> Result<Option<(UserStats, i64)>> {
    conn.query_row(
        "SELECT lessons_completed, courses_completed, login_streak, longest_streak,
                total_xp, last_activity_date, revision
         FROM user_stats
         WHERE user_id = ?1",
        params![user_id.to_string()],
        parse_stats_row,
    )
    .optional()
    .context("failed to load user stats")
}

fn load_earned_ids(conn: &Connection, user_id: UserId) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT badge_id FROM earned_badges WHERE user_id = ?1")?;
    let rows = stmt.query_map(params![user_id.to_string()], |row| row.get::<_, String>(0))?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

/// Writes `stats` only if the row still carries `expected_revision`.
fn write_stats(
    conn: &Connection,
    user_id: UserId,
    stats: &UserStats,
    expected_revision: Option<i64>,
    now: &str,
) -> Result<()> {
    let last_activity_date = stats
        .last_activity_date
        .map(format_date)
        .transpose()
        .map_err(|err| anyhow!(err.to_string()))?;

    let changed = match expected_revision {
        None => conn
            .execute(
                "INSERT INTO user_stats(
                    user_id, lessons_completed, courses_completed, login_streak,
                    longest_streak, total_xp, last_activity_date, revision,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
                params![
                    user_id.to_string(),
                    i64::from(stats.lessons_completed),
                    i64::from(stats.courses_completed),
                    i64::from(stats.login_streak),
                    i64::from(stats.longest_streak),
                    xp_to_sql(stats.total_xp)?,
                    last_activity_date,
                    now,
                ],
            )
            .context("failed to insert user stats")?,
        Some(revision) => conn
            .execute(
                "UPDATE user_stats SET
                    lessons_completed = ?2,
                    courses_completed = ?3,
                    login_streak = ?4,
                    longest_streak = ?5,
                    total_xp = ?6,
                    last_activity_date = ?7,
                    revision = revision + 1,
                    updated_at = ?8
                 WHERE user_id = ?1 AND revision = ?9",
                params![
                    user_id.to_string(),
                    i64::from(stats.lessons_completed),
                    i64::from(stats.courses_completed),
                    i64::from(stats.login_streak),
                    i64::from(stats.longest_streak),
                    xp_to_sql(stats.total_xp)?,
                    last_activity_date,
                    now,
                    revision,
                ],
            )
            .context("failed to update user stats")?,
    };

    if changed != 1 {
        return Err(anyhow!(
            "concurrent update detected for user {user_id}: stats revision changed"
        ));
    }
    Ok(())
}

fn find_event(conn: &Connection, event_id: Ulid) -> Result<Option<StoredEvent>> {
    conn.query_row(
        "SELECT
            event_seq, event_id, user_id, event_type, activity_date, catalog_version,
            rank_before, rank_after, result_json, recorded_at
         FROM progress_events
         WHERE event_id = ?1",
        params![event_id.to_string()],
        parse_event_row,
    )
    .optional()
    .context("failed to look up event by id")
}

fn parse_stats_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(UserStats, i64)> {
    let last_activity_date = row
        .get::<_, Option<String>>(5)?
        .as_deref()
        .map(parse_date)
        .transpose()
        .map_err(|err| invalid_column(5, rusqlite::types::Type::Text, err.to_string()))?;

    Ok((
        UserStats {
            lessons_completed: column_u32(row.get(0)?, 0, "lessons_completed")?,
            courses_completed: column_u32(row.get(1)?, 1, "courses_completed")?,
            login_streak: column_u32(row.get(2)?, 2, "login_streak")?,
            longest_streak: column_u32(row.get(3)?, 3, "longest_streak")?,
            total_xp: column_u64(row.get(4)?, 4, "total_xp")?,
            last_activity_date,
        },
        row.get(6)?,
    ))
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let event_id_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(3)?;
    let activity_date_raw: Option<String> = row.get(4)?;
    let catalog_version_i64: i64 = row.get(5)?;
    let result_json: String = row.get(8)?;

    let event_id = Ulid::from_string(&event_id_raw).map_err(|_| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid event_id ULID: {event_id_raw}"),
        )
    })?;

    let kind = ProgressEventKind::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(
            3,
            rusqlite::types::Type::Text,
            format!("invalid event_type: {event_type_raw}"),
        )
    })?;

    let activity_date = activity_date_raw
        .as_deref()
        .map(parse_date)
        .transpose()
        .map_err(|err| invalid_column(4, rusqlite::types::Type::Text, err.to_string()))?;
    let event = ProgressEvent::from_parts(kind, activity_date)
        .map_err(|err| invalid_column(3, rusqlite::types::Type::Text, err.to_string()))?;

    let catalog_version = u32::try_from(catalog_version_i64).map_err(|_| {
        invalid_column(
            5,
            rusqlite::types::Type::Integer,
            format!("invalid catalog_version: {catalog_version_i64}"),
        )
    })?;

    let result: EventResult = serde_json::from_str(&result_json).map_err(|err| {
        invalid_column(
            8,
            rusqlite::types::Type::Text,
            format!("invalid result_json: {err}"),
        )
    })?;

    let recorded_at = parse_rfc3339_utc(&row.get::<_, String>(9)?)
        .map_err(|err| invalid_column(9, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(StoredEvent {
        event_seq: row.get(0)?,
        event_id,
        user_id: parse_user_id(2, &row.get::<_, String>(2)?)?,
        event,
        catalog_version,
        rank_before: row.get(6)?,
        rank_after: row.get(7)?,
        recorded_at,
        result,
    })
}

fn parse_earned_badge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EarnedBadge> {
    Ok(EarnedBadge {
        user_id: parse_user_id(0, &row.get::<_, String>(0)?)?,
        badge_id: row.get(1)?,
        event_seq: row.get(2)?,
        earned_at: parse_rfc3339_utc(&row.get::<_, String>(3)?)
            .map_err(|err| invalid_column(3, rusqlite::types::Type::Text, err.to_string()))?,
    })
}

fn parse_reward_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimedReward> {
    let kind_raw: String = row.get(2)?;
    let kind = RewardKind::parse(&kind_raw).ok_or_else(|| {
        invalid_column(
            2,
            rusqlite::types::Type::Text,
            format!("invalid reward_kind: {kind_raw}"),
        )
    })?;

    let claimed_at = row
        .get::<_, Option<String>>(6)?
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()
        .map_err(|err| invalid_column(6, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(ClaimedReward {
        user_id: parse_user_id(0, &row.get::<_, String>(0)?)?,
        badge_id: row.get(1)?,
        reward: Reward {
            kind,
            value: row.get(3)?,
            label: row.get(4)?,
        },
        claimed: row.get::<_, i64>(5)? == 1,
        claimed_at,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(7)?)
            .map_err(|err| invalid_column(7, rusqlite::types::Type::Text, err.to_string()))?,
    })
}

fn parse_user_id(index: usize, raw: &str) -> rusqlite::Result<UserId> {
    UserId::parse(raw)
        .map_err(|err| invalid_column(index, rusqlite::types::Type::Text, err.to_string()))
}

fn column_u32(value: i64, index: usize, name: &str) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        invalid_column(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid {name}: {value}"),
        )
    })
}

fn column_u64(value: i64, index: usize, name: &str) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        invalid_column(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid {name}: {value}"),
        )
    })
}

fn xp_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("xp value {value} exceeds sqlite integer range"))
}

fn invalid_column(
    index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn issue(code: &str, severity: IssueSeverity, message: String) -> ConsistencyIssue {
    ConsistencyIssue {
        code: code.to_string(),
        severity,
        message,
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
