//! Stable embedded progress command surface for host runtimes.
//!
//! Hosts (the web backend, batch jobs, support tooling) should drive the
//! progression engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_progress_with_db`] for direct `ProgressCommand` execution against a DB path.
//! - [`run_progress`] for execution against an existing [`SqliteProgressStore`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use physio_progress_core::{
    format_rfc3339, now_utc, parse_date, today_utc, BadgeDefinition, ProgressCatalog,
    ProgressEvent, Rank, RankProgress, Reward, UserId, UserStats,
};
use physio_progress_store_sqlite::{
    ConsistencyReport, EventInput, IssueSeverity, LeaderboardEntry, ProgressSummary,
    RecordedEvent, SqliteProgressStore,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

pub const EVENT_RESULT_CONTRACT: &str = "event_result.v1";

#[derive(Debug, Parser)]
#[command(name = "progress")]
#[command(about = "Student progression CLI: XP, ranks, badges and rewards")]
pub struct Cli {
    #[arg(long, default_value = "./physio_progress.sqlite3")]
    db: PathBuf,

    /// JSON catalog file; the built-in v1 catalog is used when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: ProgressCommand,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Stats {
        #[command(subcommand)]
        command: Box<StatsCommand>,
    },
    Badges {
        #[command(subcommand)]
        command: Box<BadgesCommand>,
    },
    Rewards {
        #[command(subcommand)]
        command: Box<RewardsCommand>,
    },
    Ranks {
        #[command(subcommand)]
        command: Box<RanksCommand>,
    },
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Verify(VerifyArgs),
    Leaderboard(LeaderboardArgs),
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    LessonComplete(EventArgs),
    CourseComplete(EventArgs),
    /// First qualifying activity of a calendar day (drives the streak).
    DailyActivity(DailyActivityArgs),
}

#[derive(Debug, Args)]
pub struct EventArgs {
    #[arg(long)]
    user_id: String,
    /// Idempotency key; repeating it returns the recorded result.
    #[arg(long)]
    event_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct DailyActivityArgs {
    #[arg(long)]
    user_id: String,
    /// Activity date (YYYY-MM-DD); defaults to today in UTC.
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    event_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    Show(UserArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum BadgesCommand {
    List(UserArgs),
    Catalog(JsonArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum RewardsCommand {
    List(UserArgs),
    Claim(ClaimArgs),
}

#[derive(Debug, Args)]
pub struct ClaimArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    badge_id: String,
}

#[derive(Debug, Subcommand)]
pub enum RanksCommand {
    List(JsonArgs),
    Progress(RankProgressArgs),
}

#[derive(Debug, Args)]
pub struct RankProgressArgs {
    #[arg(long)]
    xp: u64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    Show,
    Check(CatalogCheckArgs),
}

#[derive(Debug, Args)]
pub struct CatalogCheckArgs {
    #[arg(long)]
    file: PathBuf,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when catalog loading, migration, or command execution
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_progress_with_db(&cli.db, cli.catalog.as_deref(), cli.command)
}

/// Executes a parsed progress command using the provided `SQLite` DB path.
///
/// Catalog commands never touch the database.
///
/// # Errors
/// Returns an error when the catalog is invalid, store open/migrate fails, or
/// the requested command fails.
pub fn run_progress_with_db(
    db_path: &Path,
    catalog_path: Option<&Path>,
    command: ProgressCommand,
) -> Result<()> {
    let catalog = load_catalog(catalog_path)?;
    match command {
        ProgressCommand::Catalog { command } => run_catalog(*command, &catalog),
        progress_command => {
            let mut store = SqliteProgressStore::open(db_path)?;
            store.migrate()?;
            store.upsert_catalog(&catalog)?;
            run_progress(progress_command, &mut store, &catalog)
        }
    }
}

/// Executes a parsed progress command against an existing store handle.
///
/// `catalog` must already be registered in the store.
///
/// # Errors
/// Returns an error when argument validation, persistence, or a consistency
/// check fails.
pub fn run_progress(
    command: ProgressCommand,
    store: &mut SqliteProgressStore,
    catalog: &ProgressCatalog,
) -> Result<()> {
    match command {
        ProgressCommand::Event { command } => run_event(*command, store, catalog),
        ProgressCommand::Stats { command } => run_stats(*command, store, catalog),
        ProgressCommand::Badges { command } => run_badges(*command, store, catalog),
        ProgressCommand::Rewards { command } => run_rewards(*command, store),
        ProgressCommand::Ranks { command } => run_ranks(*command, catalog),
        ProgressCommand::Events { command } => run_events(*command, store),
        ProgressCommand::Verify(args) => {
            let report = store.verify_user(parse_user_id(&args.user_id)?)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_consistency_report(&report);
            }
            if report.healthy {
                Ok(())
            } else {
                Err(anyhow!(
                    "consistency check failed for user {}",
                    report.user_id
                ))
            }
        }
        ProgressCommand::Leaderboard(args) => {
            let entries = store.leaderboard(args.limit, catalog)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_leaderboard(&entries);
            }
            Ok(())
        }
        ProgressCommand::Catalog { command } => run_catalog(*command, catalog),
    }
}

fn run_event(
    command: EventCommand,
    store: &mut SqliteProgressStore,
    catalog: &ProgressCatalog,
) -> Result<()> {
    let (user_id, event_id, event) = match command {
        EventCommand::LessonComplete(args) => {
            (args.user_id, args.event_id, ProgressEvent::LessonComplete)
        }
        EventCommand::CourseComplete(args) => {
            (args.user_id, args.event_id, ProgressEvent::CourseComplete)
        }
        EventCommand::DailyActivity(args) => {
            let activity_date = match args.date.as_deref() {
                Some(raw) => {
                    parse_date(raw).map_err(|err| anyhow!("invalid --date value: {err}"))?
                }
                None => today_utc(),
            };
            (
                args.user_id,
                args.event_id,
                ProgressEvent::StreakRollover { activity_date },
            )
        }
    };

    let input = EventInput {
        event_id: event_id.as_deref().map(parse_event_id).transpose()?,
        user_id: parse_user_id(&user_id)?,
        event,
        catalog_version: catalog.catalog_version(),
    };

    let recorded = store.record_event(&input)?;
    let payload = build_event_result_json_payload(&recorded, catalog)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_stats(
    command: StatsCommand,
    store: &SqliteProgressStore,
    catalog: &ProgressCatalog,
) -> Result<()> {
    match command {
        StatsCommand::Show(args) => {
            let summary = store.progress_summary(parse_user_id(&args.user_id)?, catalog)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
    }
}

fn run_badges(
    command: BadgesCommand,
    store: &SqliteProgressStore,
    catalog: &ProgressCatalog,
) -> Result<()> {
    match command {
        BadgesCommand::List(args) => {
            let earned = store.list_earned_badges(parse_user_id(&args.user_id)?)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&earned)?);
                return Ok(());
            }

            println!("{:<16} {:<22} {:<12} {:<9} earned_at", "badge_id", "name", "category", "event_seq");
            println!("{}", "-".repeat(90));
            for item in &earned {
                let (name, category) = catalog
                    .badge(&item.badge_id)
                    .map_or(("(unknown)", "-"), |badge| {
                        (badge.name.as_str(), badge.category.as_str())
                    });
                println!(
                    "{:<16} {:<22} {:<12} {:<9} {}",
                    item.badge_id,
                    name,
                    category,
                    item.event_seq,
                    format_rfc3339(item.earned_at).map_err(|err| anyhow!(err.to_string()))?
                );
            }
            Ok(())
        }
        BadgesCommand::Catalog(args) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(catalog.badges())?);
            } else {
                print_badge_catalog(catalog.badges());
            }
            Ok(())
        }
    }
}

fn run_rewards(command: RewardsCommand, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        RewardsCommand::List(args) => {
            let rewards = store.list_rewards(parse_user_id(&args.user_id)?)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rewards)?);
                return Ok(());
            }

            println!("{:<16} {:<17} {:<12} {:<8} label", "badge_id", "kind", "value", "claimed");
            println!("{}", "-".repeat(80));
            for item in &rewards {
                println!(
                    "{:<16} {:<17} {:<12} {:<8} {}",
                    item.badge_id,
                    item.reward.kind.as_str(),
                    item.reward.value,
                    if item.claimed { "yes" } else { "no" },
                    item.reward.label
                );
            }
            Ok(())
        }
        RewardsCommand::Claim(args) => {
            let outcome =
                store.claim_reward(parse_user_id(&args.user_id)?, &args.badge_id, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

fn run_ranks(command: RanksCommand, catalog: &ProgressCatalog) -> Result<()> {
    match command {
        RanksCommand::List(args) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(catalog.ranks())?);
            } else {
                print_ranks(catalog.ranks());
            }
            Ok(())
        }
        RanksCommand::Progress(args) => {
            let progress = catalog.rank_progress(args.xp);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&progress)?);
            } else {
                print_rank_progress(&progress);
            }
            Ok(())
        }
    }
}

fn run_events(command: EventsCommand, store: &SqliteProgressStore) -> Result<()> {
    match command {
        EventsCommand::List(args) => {
            let events = store.list_events(parse_user_id(&args.user_id)?, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
    }
}

fn run_catalog(command: CatalogCommand, catalog: &ProgressCatalog) -> Result<()> {
    match command {
        CatalogCommand::Show => {
            println!("{}", serde_json::to_string_pretty(catalog)?);
            Ok(())
        }
        CatalogCommand::Check(args) => {
            let checked = load_catalog(Some(&args.file))?;
            println!(
                "catalog_version={} ranks={} badges={} valid=yes",
                checked.catalog_version(),
                checked.ranks().len(),
                checked.badges().len()
            );
            Ok(())
        }
    }
}

fn load_catalog(path: Option<&Path>) -> Result<ProgressCatalog> {
    let Some(path) = path else {
        return Ok(ProgressCatalog::v1());
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("catalog file {} must be valid JSON", path.display()))?;
    let catalog = ProgressCatalog::from_json(&value)
        .map_err(|err| anyhow!("invalid catalog {}: {err}", path.display()))?;

    debug!(
        path = %path.display(),
        catalog_version = catalog.catalog_version(),
        "loaded catalog file"
    );
    Ok(catalog)
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::parse(raw).map_err(|err| anyhow!("invalid --user-id value: {err}"))
}

fn parse_event_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid --event-id ULID: {raw}"))
}

fn print_summary(summary: &ProgressSummary) {
    let stats = &summary.stats;
    println!(
        "user={} rank={} xp={} progress={}%",
        summary.user_id, summary.rank.rank.name, stats.total_xp, summary.rank.progress_percent
    );
    match (&summary.rank.next_rank, summary.rank.xp_to_next_rank) {
        (Some(next), Some(remaining)) => println!("next_rank={} xp_to_next={remaining}", next.name),
        _ => println!("next_rank=none"),
    }
    println!(
        "lessons={} courses={} streak={} longest_streak={} last_activity={}",
        stats.lessons_completed,
        stats.courses_completed,
        stats.login_streak,
        stats.longest_streak,
        stats
            .last_activity_date
            .map_or_else(|| "never".to_string(), |date| date.to_string())
    );
    println!(
        "badges={}/{} unclaimed_rewards={}",
        summary.earned_badges, summary.total_badges, summary.unclaimed_rewards
    );
}

fn print_badge_catalog(badges: &[BadgeDefinition]) {
    println!(
        "{:<16} {:<22} {:<12} {:<18} {:<6} reward",
        "badge_id", "name", "category", "condition", "xp"
    );
    println!("{}", "-".repeat(100));
    for item in badges {
        let condition = format!(
            "{}>={}",
            item.condition.kind_str(),
            item.condition.threshold()
        );
        println!(
            "{:<16} {:<22} {:<12} {:<18} {:<6} {}",
            item.id,
            item.name,
            item.category.as_str(),
            condition,
            item.xp_reward,
            item.reward.as_ref().map_or_else(|| "-".to_string(), describe_reward)
        );
    }
}

fn describe_reward(reward: &Reward) -> String {
    format!("{}:{} ({})", reward.kind.as_str(), reward.value, reward.label)
}

fn print_ranks(ranks: &[Rank]) {
    println!("{:<14} {:<14} {:<8} {:<8} icon", "rank_id", "name", "min_xp", "max_xp");
    println!("{}", "-".repeat(60));
    for item in ranks {
        println!(
            "{:<14} {:<14} {:<8} {:<8} {}",
            item.id,
            item.name,
            item.min_xp,
            item.max_xp
                .map_or_else(|| "-".to_string(), |value| value.to_string()),
            item.icon
        );
    }
}

fn print_rank_progress(progress: &RankProgress) {
    println!(
        "xp={} rank={} progress={}% xp_into_rank={}",
        progress.xp, progress.rank.name, progress.progress_percent, progress.xp_into_rank
    );
    match (&progress.next_rank, progress.xp_to_next_rank) {
        (Some(next), Some(remaining)) => println!("next_rank={} xp_to_next={remaining}", next.name),
        _ => println!("next_rank=none"),
    }
}

fn print_leaderboard(entries: &[LeaderboardEntry]) {
    println!(
        "{:<4} {:<28} {:<8} {:<14} badges",
        "pos", "user_id", "xp", "rank"
    );
    println!("{}", "-".repeat(70));
    for item in entries {
        println!(
            "{:<4} {:<28} {:<8} {:<14} {}",
            item.position, item.user_id, item.total_xp, item.rank_name, item.badges_earned
        );
    }
}

fn print_consistency_report(report: &ConsistencyReport) {
    println!(
        "contract={} user={} replayed_events={} healthy={}",
        report.contract_version,
        report.user_id,
        report.replayed_events,
        if report.healthy { "yes" } else { "no" }
    );
    if !report.issues.is_empty() {
        let formatted = report
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IssueSeverity::Warning => "warning",
                    IssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRewardPayload {
    badge_id: String,
    reward: Reward,
}

/// `event_result.v1`: what the dashboard needs to animate one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventResultJsonPayload {
    contract_version: String,
    event_seq: i64,
    event_id: String,
    user_id: UserId,
    duplicate: bool,
    recorded_at: String,
    catalog_version: u32,
    event: ProgressEvent,
    xp_gained: u64,
    direct_xp: u64,
    badge_xp: u64,
    total_xp: u64,
    previous_rank: Rank,
    rank_changed: bool,
    new_rank: Option<Rank>,
    rank_progress: RankProgress,
    newly_unlocked_badges: Vec<BadgeDefinition>,
    pending_rewards: Vec<PendingRewardPayload>,
    stats: UserStats,
}

fn build_event_result_json_payload(
    recorded: &RecordedEvent,
    catalog: &ProgressCatalog,
) -> Result<EventResultJsonPayload> {
    let stored = &recorded.stored;
    let result = &stored.result;
    Ok(EventResultJsonPayload {
        contract_version: EVENT_RESULT_CONTRACT.to_string(),
        event_seq: stored.event_seq,
        event_id: stored.event_id.to_string(),
        user_id: stored.user_id,
        duplicate: recorded.duplicate,
        recorded_at: format_rfc3339(stored.recorded_at).map_err(|err| anyhow!(err.to_string()))?,
        catalog_version: stored.catalog_version,
        event: stored.event,
        xp_gained: result.xp_gained,
        direct_xp: result.direct_xp,
        badge_xp: result.badge_xp,
        total_xp: result.final_stats.total_xp,
        previous_rank: result.previous_rank.clone(),
        rank_changed: result.rank_changed,
        new_rank: result.new_rank.clone(),
        rank_progress: catalog.rank_progress(result.final_stats.total_xp),
        newly_unlocked_badges: result.newly_unlocked_badges.clone(),
        pending_rewards: result
            .pending_rewards()
            .map(|(badge, reward)| PendingRewardPayload {
                badge_id: badge.id.clone(),
                reward: reward.clone(),
            })
            .collect(),
        stats: result.final_stats.clone(),
    })
}
