//! Progression engine for the student dashboard: ranks, badges, XP and
//! claimable rewards.
//!
//! Everything in this crate is a pure, synchronous computation over values
//! the caller already holds. Persistence lives in
//! `physio-progress-store-sqlite`; this crate never touches I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub Ulid);

impl UserId {
    /// Parses a canonical ULID string.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ProgressError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ProgressError::Validation(format!("invalid user id {value}: {err}")))
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BadgeCategory {
    Learning,
    Completion,
    Consistency,
    Milestone,
}

impl BadgeCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Learning => "learning",
            Self::Completion => "completion",
            Self::Consistency => "consistency",
            Self::Milestone => "milestone",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "learning" => Some(Self::Learning),
            "completion" => Some(Self::Completion),
            "consistency" => Some(Self::Consistency),
            "milestone" => Some(Self::Milestone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    PromoCode,
    BonusDays,
    DiscountPercent,
}

impl RewardKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromoCode => "promo_code",
            Self::BonusDays => "bonus_days",
            Self::DiscountPercent => "discount_percent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "promo_code" => Some(Self::PromoCode),
            "bonus_days" => Some(Self::BonusDays),
            "discount_percent" => Some(Self::DiscountPercent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Reward {
    pub kind: RewardKind,
    pub value: String,
    pub label: String,
}

impl Reward {
    /// Checks that `value` is meaningful for `kind`.
    ///
    /// # Errors
    /// Returns [`ProgressError::Configuration`] for an empty promo code,
    /// a non-positive day count, or a discount outside `1..=100`.
    pub fn validate(&self) -> Result<(), ProgressError> {
        match self.kind {
            RewardKind::PromoCode => {
                if self.value.trim().is_empty() {
                    return Err(ProgressError::Configuration(
                        "promo_code reward MUST carry a code".to_string(),
                    ));
                }
            }
            RewardKind::BonusDays => match self.value.parse::<u32>() {
                Ok(days) if days > 0 => {}
                _ => {
                    return Err(ProgressError::Configuration(format!(
                        "bonus_days reward value MUST be a positive integer, got {}",
                        self.value
                    )))
                }
            },
            RewardKind::DiscountPercent => match self.value.parse::<u8>() {
                Ok(percent) if (1..=100).contains(&percent) => {}
                _ => {
                    return Err(ProgressError::Configuration(format!(
                        "discount_percent reward value MUST be in [1, 100], got {}",
                        self.value
                    )))
                }
            },
        }

        if self.label.trim().is_empty() {
            return Err(ProgressError::Configuration(
                "reward label MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// Stat predicate that unlocks a badge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnlockCondition {
    LessonsCompleted { min: u32 },
    CoursesCompleted { min: u32 },
    LongestStreak { min: u32 },
    TotalXp { min: u64 },
}

impl UnlockCondition {
    #[must_use]
    pub fn is_met(self, stats: &UserStats) -> bool {
        match self {
            Self::LessonsCompleted { min } => stats.lessons_completed >= min,
            Self::CoursesCompleted { min } => stats.courses_completed >= min,
            Self::LongestStreak { min } => stats.longest_streak >= min,
            Self::TotalXp { min } => stats.total_xp >= min,
        }
    }

    #[must_use]
    pub fn kind_str(self) -> &'static str {
        match self {
            Self::LessonsCompleted { .. } => "lessons_completed",
            Self::CoursesCompleted { .. } => "courses_completed",
            Self::LongestStreak { .. } => "longest_streak",
            Self::TotalXp { .. } => "total_xp",
        }
    }

    #[must_use]
    pub fn threshold(self) -> u64 {
        match self {
            Self::LessonsCompleted { min }
            | Self::CoursesCompleted { min }
            | Self::LongestStreak { min } => u64::from(min),
            Self::TotalXp { min } => min,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Rank {
    pub id: String,
    pub name: String,
    pub min_xp: u64,
    /// Inclusive upper bound; `None` on the terminal tier.
    pub max_xp: Option<u64>,
    pub icon: String,
    pub color: String,
}

impl Rank {
    #[must_use]
    pub fn contains(&self, xp: u64) -> bool {
        if xp < self.min_xp {
            return false;
        }
        match self.max_xp {
            Some(max) => xp <= max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct BadgeDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub xp_reward: u64,
    pub category: BadgeCategory,
    pub condition: UnlockCondition,
    #[serde(default)]
    pub reward: Option<Reward>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct XpTable {
    pub lesson_complete: u64,
    pub course_complete: u64,
}

impl XpTable {
    /// XP granted directly by an event, before any badge bonus.
    #[must_use]
    pub fn direct_xp(&self, kind: ProgressEventKind) -> u64 {
        match kind {
            ProgressEventKind::LessonComplete => self.lesson_complete,
            ProgressEventKind::CourseComplete => self.course_complete,
            ProgressEventKind::StreakRollover => 0,
        }
    }
}

/// Serialized shape of a catalog; converted through validation on decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogDocument {
    pub catalog_version: u32,
    pub ranks: Vec<Rank>,
    pub badges: Vec<BadgeDefinition>,
    pub xp: XpTable,
}

/// Immutable rank/badge/XP configuration shared by every engine call.
///
/// A `ProgressCatalog` can only be obtained through validation, so every
/// instance partitions `[0, u64::MAX]` into ranks and carries unique badge
/// ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "CatalogDocument", into = "CatalogDocument")]
pub struct ProgressCatalog {
    catalog_version: u32,
    ranks: Vec<Rank>,
    badges: Vec<BadgeDefinition>,
    xp: XpTable,
}

impl ProgressCatalog {
    /// Builds a catalog from its parts.
    ///
    /// # Errors
    /// Returns [`ProgressError::Configuration`] when any catalog invariant
    /// is violated.
    pub fn new(
        catalog_version: u32,
        ranks: Vec<Rank>,
        badges: Vec<BadgeDefinition>,
        xp: XpTable,
    ) -> Result<Self, ProgressError> {
        let catalog = Self {
            catalog_version,
            ranks,
            badges,
            xp,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn v1() -> Self {
        let ranks = vec![
            rank("novice", "Novice", 0, Some(99), "seedling", "#9CA3AF"),
            rank("apprentice", "Apprentice", 100, Some(299), "footprints", "#60A5FA"),
            rank("practitioner", "Practitioner", 300, Some(699), "activity", "#34D399"),
            rank("specialist", "Specialist", 700, Some(1_499), "stethoscope", "#FBBF24"),
            rank("expert", "Expert", 1_500, Some(2_999), "award", "#F97316"),
            rank("master", "Master", 3_000, None, "crown", "#A855F7"),
        ];

        let badges = vec![
            badge(
                "first_lesson",
                "First Steps",
                "Complete your first lesson.",
                "book-open",
                20,
                BadgeCategory::Learning,
                UnlockCondition::LessonsCompleted { min: 1 },
                None,
            ),
            badge(
                "lessons_5",
                "Warming Up",
                "Complete 5 lessons.",
                "flame",
                30,
                BadgeCategory::Learning,
                UnlockCondition::LessonsCompleted { min: 5 },
                None,
            ),
            badge(
                "lessons_10",
                "Steady Learner",
                "Complete 10 lessons.",
                "bookmark",
                50,
                BadgeCategory::Learning,
                UnlockCondition::LessonsCompleted { min: 10 },
                None,
            ),
            badge(
                "lessons_25",
                "Knowledge Builder",
                "Complete 25 lessons.",
                "layers",
                100,
                BadgeCategory::Learning,
                UnlockCondition::LessonsCompleted { min: 25 },
                Some(Reward {
                    kind: RewardKind::PromoCode,
                    value: "LEARN25".to_string(),
                    label: "25% off your next course".to_string(),
                }),
            ),
            badge(
                "lessons_50",
                "Scholar",
                "Complete 50 lessons.",
                "graduation-cap",
                200,
                BadgeCategory::Learning,
                UnlockCondition::LessonsCompleted { min: 50 },
                Some(Reward {
                    kind: RewardKind::DiscountPercent,
                    value: "15".to_string(),
                    label: "15% off any subscription".to_string(),
                }),
            ),
            badge(
                "first_course",
                "Course Finisher",
                "Complete your first course.",
                "check-circle",
                100,
                BadgeCategory::Completion,
                UnlockCondition::CoursesCompleted { min: 1 },
                None,
            ),
            badge(
                "courses_3",
                "Triple Threat",
                "Complete 3 courses.",
                "target",
                150,
                BadgeCategory::Completion,
                UnlockCondition::CoursesCompleted { min: 3 },
                Some(Reward {
                    kind: RewardKind::BonusDays,
                    value: "7".to_string(),
                    label: "7 bonus subscription days".to_string(),
                }),
            ),
            badge(
                "courses_5",
                "Curriculum Champion",
                "Complete 5 courses.",
                "trophy",
                300,
                BadgeCategory::Completion,
                UnlockCondition::CoursesCompleted { min: 5 },
                Some(Reward {
                    kind: RewardKind::DiscountPercent,
                    value: "20".to_string(),
                    label: "20% off your next course".to_string(),
                }),
            ),
            badge(
                "streak_3",
                "On a Roll",
                "Study 3 days in a row.",
                "calendar",
                25,
                BadgeCategory::Consistency,
                UnlockCondition::LongestStreak { min: 3 },
                None,
            ),
            badge(
                "streak_7",
                "Week Warrior",
                "Study 7 days in a row.",
                "calendar-check",
                50,
                BadgeCategory::Consistency,
                UnlockCondition::LongestStreak { min: 7 },
                None,
            ),
            badge(
                "streak_30",
                "Unstoppable",
                "Study 30 days in a row.",
                "zap",
                150,
                BadgeCategory::Consistency,
                UnlockCondition::LongestStreak { min: 30 },
                Some(Reward {
                    kind: RewardKind::BonusDays,
                    value: "30".to_string(),
                    label: "30 bonus subscription days".to_string(),
                }),
            ),
            badge(
                "xp_500",
                "Rising Star",
                "Earn 500 XP.",
                "star",
                50,
                BadgeCategory::Milestone,
                UnlockCondition::TotalXp { min: 500 },
                None,
            ),
            badge(
                "xp_1000",
                "Powerhouse",
                "Earn 1000 XP.",
                "sparkles",
                100,
                BadgeCategory::Milestone,
                UnlockCondition::TotalXp { min: 1_000 },
                Some(Reward {
                    kind: RewardKind::PromoCode,
                    value: "PHYSIO1000".to_string(),
                    label: "Free workshop seat".to_string(),
                }),
            ),
        ];

        Self {
            catalog_version: 1,
            ranks,
            badges,
            xp: XpTable {
                lesson_complete: 10,
                course_complete: 50,
            },
        }
    }

    /// Validates rank partitioning, badge uniqueness and threshold ordering.
    ///
    /// # Errors
    /// Returns [`ProgressError::Configuration`] naming the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), ProgressError> {
        if self.catalog_version == 0 {
            return Err(ProgressError::Configuration(
                "catalog_version MUST be >= 1".to_string(),
            ));
        }

        let Some(first) = self.ranks.first() else {
            return Err(ProgressError::Configuration(
                "catalog MUST define at least one rank".to_string(),
            ));
        };
        if first.min_xp != 0 {
            return Err(ProgressError::Configuration(
                "first rank MUST start at 0 XP".to_string(),
            ));
        }

        let mut rank_ids = BTreeSet::new();
        for item in &self.ranks {
            if item.id.trim().is_empty() {
                return Err(ProgressError::Configuration(
                    "rank id MUST be provided".to_string(),
                ));
            }
            if !rank_ids.insert(item.id.as_str()) {
                return Err(ProgressError::Configuration(format!(
                    "duplicate rank id {}",
                    item.id
                )));
            }
        }

        for pair in self.ranks.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            if next.min_xp <= current.min_xp {
                return Err(ProgressError::Configuration(format!(
                    "rank {} MUST start above rank {}",
                    next.id, current.id
                )));
            }
            if current.max_xp != Some(next.min_xp - 1) {
                return Err(ProgressError::Configuration(format!(
                    "rank {} max_xp MUST equal {} (next rank min_xp - 1)",
                    current.id,
                    next.min_xp - 1
                )));
            }
        }

        if let Some(last) = self.ranks.last() {
            if last.max_xp.is_some() {
                return Err(ProgressError::Configuration(format!(
                    "terminal rank {} MUST be open-ended",
                    last.id
                )));
            }
        }

        let mut badge_ids = BTreeSet::new();
        let mut last_threshold: BTreeMap<&'static str, (u64, &str)> = BTreeMap::new();
        for item in &self.badges {
            if item.id.trim().is_empty() {
                return Err(ProgressError::Configuration(
                    "badge id MUST be provided".to_string(),
                ));
            }
            if !badge_ids.insert(item.id.as_str()) {
                return Err(ProgressError::Configuration(format!(
                    "duplicate badge id {}",
                    item.id
                )));
            }

            let kind = item.condition.kind_str();
            let threshold = item.condition.threshold();
            if let Some((previous, previous_id)) = last_threshold.get(kind) {
                if threshold <= *previous {
                    return Err(ProgressError::Configuration(format!(
                        "badge {} {kind} threshold {threshold} MUST exceed {previous} of badge {previous_id}",
                        item.id
                    )));
                }
            }
            last_threshold.insert(kind, (threshold, item.id.as_str()));

            if let Some(reward) = &item.reward {
                reward.validate().map_err(|err| {
                    ProgressError::Configuration(format!("badge {}: {err}", item.id))
                })?;
            }
        }

        Ok(())
    }

    /// Decodes and validates a catalog from JSON.
    ///
    /// # Errors
    /// Returns [`ProgressError::Configuration`] when decoding fails or the
    /// decoded catalog violates an invariant.
    pub fn from_json(value: &Value) -> Result<Self, ProgressError> {
        let document: CatalogDocument = serde_json::from_value(value.clone()).map_err(|err| {
            ProgressError::Configuration(format!("invalid catalog JSON payload: {err}"))
        })?;
        Self::try_from(document)
    }

    #[must_use]
    pub fn catalog_version(&self) -> u32 {
        self.catalog_version
    }

    #[must_use]
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    #[must_use]
    pub fn badges(&self) -> &[BadgeDefinition] {
        &self.badges
    }

    #[must_use]
    pub fn xp(&self) -> &XpTable {
        &self.xp
    }

    #[must_use]
    pub fn badge(&self, badge_id: &str) -> Option<&BadgeDefinition> {
        self.badges.iter().find(|item| item.id == badge_id)
    }

    #[must_use]
    pub fn rank(&self, rank_id: &str) -> Option<&Rank> {
        self.ranks.iter().find(|item| item.id == rank_id)
    }

    /// Returns the unique rank whose window contains `xp`.
    #[must_use]
    pub fn rank_for_xp(&self, xp: u64) -> &Rank {
        // Validation guarantees a non-empty list starting at 0 XP.
        self.ranks
            .iter()
            .rev()
            .find(|item| xp >= item.min_xp)
            .unwrap_or(&self.ranks[0])
    }

    #[must_use]
    pub fn next_rank(&self, current: &Rank) -> Option<&Rank> {
        let position = self.ranks.iter().position(|item| item.id == current.id)?;
        self.ranks.get(position + 1)
    }

    /// Percent of the way from `current.min_xp` to the next rank, rounded
    /// half-up and clamped to 100. Always 100 on the terminal rank.
    #[must_use]
    pub fn progress_within_rank(&self, xp: u64, current: &Rank) -> u8 {
        let Some(next) = self.next_rank(current) else {
            return 100;
        };

        let span = next.min_xp.saturating_sub(current.min_xp);
        if span == 0 {
            return 100;
        }

        let into = u128::from(xp.saturating_sub(current.min_xp));
        let span = u128::from(span);
        let percent = (into * 200 + span) / (span * 2);
        u8::try_from(percent.min(100)).unwrap_or(100)
    }

    #[must_use]
    pub fn rank_progress(&self, xp: u64) -> RankProgress {
        let current = self.rank_for_xp(xp);
        let next = self.next_rank(current);
        RankProgress {
            xp,
            rank: current.clone(),
            next_rank: next.cloned(),
            progress_percent: self.progress_within_rank(xp, current),
            xp_into_rank: xp.saturating_sub(current.min_xp),
            xp_to_next_rank: next.map(|item| item.min_xp.saturating_sub(xp)),
        }
    }

    /// Badges whose condition holds for `stats` and that are not yet in
    /// `already_earned`, in catalog order.
    #[must_use]
    pub fn scan_for_newly_unlocked(
        &self,
        stats: &UserStats,
        already_earned: &BTreeSet<String>,
    ) -> Vec<&BadgeDefinition> {
        self.badges
            .iter()
            .filter(|item| !already_earned.contains(&item.id) && item.condition.is_met(stats))
            .collect()
    }
}

impl TryFrom<CatalogDocument> for ProgressCatalog {
    type Error = ProgressError;

    fn try_from(document: CatalogDocument) -> Result<Self, Self::Error> {
        Self::new(
            document.catalog_version,
            document.ranks,
            document.badges,
            document.xp,
        )
    }
}

impl From<ProgressCatalog> for CatalogDocument {
    fn from(catalog: ProgressCatalog) -> Self {
        Self {
            catalog_version: catalog.catalog_version,
            ranks: catalog.ranks,
            badges: catalog.badges,
            xp: catalog.xp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankProgress {
    pub xp: u64,
    pub rank: Rank,
    pub next_rank: Option<Rank>,
    pub progress_percent: u8,
    pub xp_into_rank: u64,
    pub xp_to_next_rank: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserStats {
    pub lessons_completed: u32,
    pub courses_completed: u32,
    pub login_streak: u32,
    pub longest_streak: u32,
    pub total_xp: u64,
    #[serde(default, with = "iso_date::option")]
    pub last_activity_date: Option<Date>,
}

impl UserStats {
    /// Applies the consecutive-day rule for activity on `day`.
    fn roll_streak(&mut self, day: Date) {
        match self.last_activity_date {
            None => self.login_streak = 1,
            Some(last) if day <= last => {}
            Some(last) if last.next_day() == Some(day) => {
                self.login_streak = self.login_streak.saturating_add(1);
            }
            Some(_) => self.login_streak = 1,
        }

        self.longest_streak = self.longest_streak.max(self.login_streak);
        self.last_activity_date = Some(self.last_activity_date.map_or(day, |last| last.max(day)));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    LessonComplete,
    CourseComplete,
    StreakRollover,
}

impl ProgressEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LessonComplete => "lesson_complete",
            Self::CourseComplete => "course_complete",
            Self::StreakRollover => "streak_rollover",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lesson_complete" => Some(Self::LessonComplete),
            "course_complete" => Some(Self::CourseComplete),
            "streak_rollover" => Some(Self::StreakRollover),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    LessonComplete,
    CourseComplete,
    /// First qualifying activity on a calendar day.
    StreakRollover {
        #[serde(with = "iso_date")]
        activity_date: Date,
    },
}

impl ProgressEvent {
    #[must_use]
    pub fn kind(self) -> ProgressEventKind {
        match self {
            Self::LessonComplete => ProgressEventKind::LessonComplete,
            Self::CourseComplete => ProgressEventKind::CourseComplete,
            Self::StreakRollover { .. } => ProgressEventKind::StreakRollover,
        }
    }

    #[must_use]
    pub fn activity_date(self) -> Option<Date> {
        match self {
            Self::StreakRollover { activity_date } => Some(activity_date),
            Self::LessonComplete | Self::CourseComplete => None,
        }
    }

    /// Rebuilds an event from its stored kind and optional date.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when a streak rollover has no
    /// activity date.
    pub fn from_parts(
        kind: ProgressEventKind,
        activity_date: Option<Date>,
    ) -> Result<Self, ProgressError> {
        match kind {
            ProgressEventKind::LessonComplete => Ok(Self::LessonComplete),
            ProgressEventKind::CourseComplete => Ok(Self::CourseComplete),
            ProgressEventKind::StreakRollover => activity_date
                .map(|activity_date| Self::StreakRollover { activity_date })
                .ok_or_else(|| {
                    ProgressError::Validation(
                        "streak_rollover requires activity_date".to_string(),
                    )
                }),
        }
    }
}

/// Outcome of applying one event to one user's stats.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventResult {
    pub event: ProgressEvent,
    pub catalog_version: u32,
    pub final_stats: UserStats,
    pub xp_gained: u64,
    pub direct_xp: u64,
    pub badge_xp: u64,
    pub newly_unlocked_badges: Vec<BadgeDefinition>,
    pub previous_rank: Rank,
    pub rank_changed: bool,
    pub new_rank: Option<Rank>,
}

impl EventResult {
    /// Newly unlocked badges that carry a claimable reward.
    pub fn pending_rewards(&self) -> impl Iterator<Item = (&BadgeDefinition, &Reward)> {
        self.newly_unlocked_badges
            .iter()
            .filter_map(|item| item.reward.as_ref().map(|reward| (item, reward)))
    }
}

/// Applies `event` to `stats` and returns the resulting bundle.
///
/// Rank change is judged on the total after badge bonuses, so a badge whose
/// XP crosses a rank boundary is reported as a rank-up.
#[must_use]
pub fn apply_event(
    stats: &UserStats,
    event: &ProgressEvent,
    already_earned: &BTreeSet<String>,
    catalog: &ProgressCatalog,
) -> EventResult {
    let mut next = stats.clone();
    match *event {
        ProgressEvent::LessonComplete => {
            next.lessons_completed = next.lessons_completed.saturating_add(1);
        }
        ProgressEvent::CourseComplete => {
            next.courses_completed = next.courses_completed.saturating_add(1);
        }
        ProgressEvent::StreakRollover { activity_date } => next.roll_streak(activity_date),
    }

    let direct_xp = catalog.xp().direct_xp(event.kind());
    next.total_xp = next.total_xp.saturating_add(direct_xp);

    let previous_rank = catalog.rank_for_xp(stats.total_xp);

    let unlocked: Vec<BadgeDefinition> = catalog
        .scan_for_newly_unlocked(&next, already_earned)
        .into_iter()
        .cloned()
        .collect();
    let badge_xp = unlocked
        .iter()
        .fold(0_u64, |sum, item| sum.saturating_add(item.xp_reward));
    next.total_xp = next.total_xp.saturating_add(badge_xp);

    let final_rank = catalog.rank_for_xp(next.total_xp);
    let rank_changed = final_rank.id != previous_rank.id;

    EventResult {
        event: *event,
        catalog_version: catalog.catalog_version(),
        xp_gained: next.total_xp - stats.total_xp,
        final_stats: next,
        direct_xp,
        badge_xp,
        newly_unlocked_badges: unlocked,
        previous_rank: previous_rank.clone(),
        rank_changed,
        new_rank: rank_changed.then(|| final_rank.clone()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EarnedBadge {
    pub user_id: UserId,
    pub badge_id: String,
    pub event_seq: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub earned_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Claimed,
    AlreadyClaimed,
    NoReward,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClaimedReward {
    pub user_id: UserId,
    pub badge_id: String,
    pub reward: Reward,
    pub claimed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ClaimedReward {
    #[must_use]
    pub fn unclaimed(
        user_id: UserId,
        badge_id: String,
        reward: Reward,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            user_id,
            badge_id,
            reward,
            claimed: false,
            claimed_at: None,
            created_at,
        }
    }

    /// Marks the reward claimed at `at`. A second call is a no-op that
    /// keeps the original `claimed_at`.
    pub fn claim(&mut self, at: OffsetDateTime) -> ClaimStatus {
        if self.claimed {
            return ClaimStatus::AlreadyClaimed;
        }
        self.claimed = true;
        self.claimed_at = Some(at.to_offset(UtcOffset::UTC));
        ClaimStatus::Claimed
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProgressError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProgressError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProgressError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProgressError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a calendar date in `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when `value` is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, ProgressError> {
    let format = time::format_description::parse(DATE_FORMAT)
        .map_err(|err| ProgressError::Validation(format!("invalid date format: {err}")))?;
    Date::parse(value, format.as_slice())
        .map_err(|err| ProgressError::Validation(format!("invalid date {value}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, ProgressError> {
    let format = time::format_description::parse(DATE_FORMAT)
        .map_err(|err| ProgressError::Validation(format!("invalid date format: {err}")))?;
    value
        .format(format.as_slice())
        .map_err(|err| ProgressError::Validation(format!("failed to format date: {err}")))
}

const DATE_FORMAT: &str = "[year]-[month]-[day]";

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn today_utc() -> Date {
    now_utc().date()
}

mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_date(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        pub fn serialize<S: Serializer>(
            value: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(date) => super::serialize(date, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .as_deref()
                .map(crate::parse_date)
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

fn rank(
    id: &str,
    name: &str,
    min_xp: u64,
    max_xp: Option<u64>,
    icon: &str,
    color: &str,
) -> Rank {
    Rank {
        id: id.to_string(),
        name: name.to_string(),
        min_xp,
        max_xp,
        icon: icon.to_string(),
        color: color.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn badge(
    id: &str,
    name: &str,
    description: &str,
    icon: &str,
    xp_reward: u64,
    category: BadgeCategory,
    condition: UnlockCondition,
    reward: Option<Reward>,
) -> BadgeDefinition {
    BadgeDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        icon: icon.to_string(),
        xp_reward,
        category,
        condition,
        reward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_date(value: &str) -> Date {
        must_ok(parse_date(value))
    }

    fn earned(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    fn badge_ids(result: &EventResult) -> Vec<&str> {
        result
            .newly_unlocked_badges
            .iter()
            .map(|item| item.id.as_str())
            .collect()
    }

    #[test]
    fn v1_catalog_is_valid() {
        let catalog = ProgressCatalog::v1();
        must_ok(catalog.validate());
        assert_eq!(catalog.catalog_version(), 1);
    }

    #[test]
    fn ranks_partition_xp_without_gaps_or_overlaps() {
        let catalog = ProgressCatalog::v1();
        for xp in 0..=4_000_u64 {
            let containing: Vec<&Rank> = catalog
                .ranks()
                .iter()
                .filter(|item| item.contains(xp))
                .collect();
            assert_eq!(containing.len(), 1, "xp {xp} matched {containing:?}");
            assert_eq!(catalog.rank_for_xp(xp).id, containing[0].id);
        }
        assert_eq!(catalog.rank_for_xp(u64::MAX).id, "master");
    }

    #[test]
    fn rank_boundaries_are_inclusive_lower_bounds() {
        let catalog = ProgressCatalog::v1();
        assert_eq!(catalog.rank_for_xp(99).id, "novice");
        assert_eq!(catalog.rank_for_xp(100).id, "apprentice");
        assert_eq!(catalog.rank_for_xp(299).id, "apprentice");
        assert_eq!(catalog.rank_for_xp(300).id, "practitioner");
    }

    #[test]
    fn next_rank_is_none_for_terminal_tier() {
        let catalog = ProgressCatalog::v1();
        let novice = catalog.rank_for_xp(0);
        assert_eq!(must_some(catalog.next_rank(novice)).id, "apprentice");
        let master = catalog.rank_for_xp(10_000);
        assert!(catalog.next_rank(master).is_none());
    }

    #[test]
    fn progress_within_rank_is_monotonic_and_reaches_100() {
        let catalog = ProgressCatalog::v1();
        let apprentice = must_some(catalog.rank("apprentice")).clone();

        let mut previous = 0_u8;
        for xp in apprentice.min_xp..=300 {
            let percent = catalog.progress_within_rank(xp, &apprentice);
            assert!(percent >= previous, "progress dropped at xp {xp}");
            assert!(percent <= 100);
            previous = percent;
        }

        assert_eq!(catalog.progress_within_rank(100, &apprentice), 0);
        assert_eq!(catalog.progress_within_rank(200, &apprentice), 50);
        assert_eq!(catalog.progress_within_rank(299, &apprentice), 100);
        assert_eq!(catalog.progress_within_rank(300, &apprentice), 100);
        assert_eq!(catalog.progress_within_rank(5_000, &apprentice), 100);
    }

    #[test]
    fn progress_is_always_100_on_terminal_rank() {
        let catalog = ProgressCatalog::v1();
        let master = must_some(catalog.rank("master")).clone();
        for xp in [3_000, 3_001, 50_000, u64::MAX] {
            assert_eq!(catalog.progress_within_rank(xp, &master), 100);
        }
    }

    #[test]
    fn rank_progress_reports_distance_to_next_rank() {
        let catalog = ProgressCatalog::v1();
        let progress = catalog.rank_progress(250);
        assert_eq!(progress.rank.id, "apprentice");
        assert_eq!(must_some(progress.next_rank).id, "practitioner");
        assert_eq!(progress.xp_into_rank, 150);
        assert_eq!(progress.xp_to_next_rank, Some(50));
        assert_eq!(progress.progress_percent, 75);

        let terminal = catalog.rank_progress(4_000);
        assert!(terminal.next_rank.is_none());
        assert_eq!(terminal.xp_to_next_rank, None);
    }

    #[test]
    fn scan_returns_catalog_order_and_skips_earned() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            lessons_completed: 10,
            courses_completed: 1,
            total_xp: 600,
            ..UserStats::default()
        };

        let ids: Vec<&str> = catalog
            .scan_for_newly_unlocked(&stats, &earned(&["lessons_5"]))
            .iter()
            .map(|item| item.id.as_str())
            .collect();
        assert_eq!(ids, vec!["first_lesson", "lessons_10", "first_course", "xp_500"]);
    }

    #[test]
    fn scan_is_idempotent_once_results_are_recorded() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            lessons_completed: 30,
            longest_streak: 7,
            login_streak: 7,
            total_xp: 1_200,
            ..UserStats::default()
        };

        let mut already = BTreeSet::new();
        let first = catalog.scan_for_newly_unlocked(&stats, &already);
        assert!(!first.is_empty());
        for item in &first {
            already.insert(item.id.clone());
        }

        assert!(catalog.scan_for_newly_unlocked(&stats, &already).is_empty());
    }

    #[test]
    fn first_lesson_from_zero_grants_lesson_and_badge_xp() {
        let catalog = ProgressCatalog::v1();
        let result = apply_event(
            &UserStats::default(),
            &ProgressEvent::LessonComplete,
            &BTreeSet::new(),
            &catalog,
        );

        assert_eq!(result.final_stats.lessons_completed, 1);
        assert_eq!(result.direct_xp, 10);
        assert_eq!(badge_ids(&result), vec!["first_lesson"]);
        assert_eq!(result.badge_xp, 20);
        assert_eq!(result.final_stats.total_xp, 30);
        assert_eq!(result.xp_gained, 30);
        assert_eq!(result.previous_rank.id, "novice");
        assert!(!result.rank_changed);
        assert!(result.new_rank.is_none());
    }

    #[test]
    fn crossing_boundary_with_direct_xp_reports_rank_up() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            lessons_completed: 2,
            total_xp: 95,
            ..UserStats::default()
        };

        let result = apply_event(
            &stats,
            &ProgressEvent::LessonComplete,
            &earned(&["first_lesson"]),
            &catalog,
        );

        assert!(result.newly_unlocked_badges.is_empty());
        assert_eq!(result.final_stats.total_xp, 105);
        assert!(result.rank_changed);
        let new_rank = must_some(result.new_rank);
        assert_eq!(new_rank.id, "apprentice");
        assert_eq!(new_rank.min_xp, 100);
    }

    #[test]
    fn badge_bonus_that_crosses_boundary_reports_rank_up() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            total_xp: 75,
            ..UserStats::default()
        };

        let result = apply_event(
            &stats,
            &ProgressEvent::LessonComplete,
            &BTreeSet::new(),
            &catalog,
        );

        // 75 + 10 stays a novice; the first_lesson bonus pushes it to 105.
        assert_eq!(
            catalog.rank_for_xp(stats.total_xp + result.direct_xp).id,
            "novice"
        );
        assert_eq!(result.final_stats.total_xp, 105);
        assert!(result.rank_changed);
        assert_eq!(must_some(result.new_rank).id, "apprentice");
    }

    #[test]
    fn consecutive_day_extends_streak_and_unlocks_streak_badge() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            login_streak: 2,
            longest_streak: 2,
            total_xp: 40,
            last_activity_date: Some(must_date("2026-03-09")),
            ..UserStats::default()
        };

        let result = apply_event(
            &stats,
            &ProgressEvent::StreakRollover {
                activity_date: must_date("2026-03-10"),
            },
            &BTreeSet::new(),
            &catalog,
        );

        assert_eq!(result.final_stats.login_streak, 3);
        assert_eq!(result.final_stats.longest_streak, 3);
        assert_eq!(result.direct_xp, 0);
        assert_eq!(badge_ids(&result), vec!["streak_3"]);
        assert_eq!(result.final_stats.total_xp, 65);
        assert_eq!(
            result.final_stats.last_activity_date,
            Some(must_date("2026-03-10"))
        );
    }

    #[test]
    fn streak_resets_to_one_after_a_gap() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            login_streak: 5,
            longest_streak: 9,
            last_activity_date: Some(must_date("2026-03-01")),
            ..UserStats::default()
        };

        let result = apply_event(
            &stats,
            &ProgressEvent::StreakRollover {
                activity_date: must_date("2026-03-03"),
            },
            &earned(&["streak_3", "streak_7"]),
            &catalog,
        );

        assert_eq!(result.final_stats.login_streak, 1);
        assert_eq!(result.final_stats.longest_streak, 9);
    }

    #[test]
    fn first_activity_starts_streak_at_one() {
        let catalog = ProgressCatalog::v1();
        let result = apply_event(
            &UserStats::default(),
            &ProgressEvent::StreakRollover {
                activity_date: must_date("2026-01-01"),
            },
            &BTreeSet::new(),
            &catalog,
        );
        assert_eq!(result.final_stats.login_streak, 1);
        assert_eq!(result.final_stats.longest_streak, 1);
    }

    #[test]
    fn same_day_or_stale_rollover_leaves_streak_unchanged() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            login_streak: 4,
            longest_streak: 4,
            last_activity_date: Some(must_date("2026-03-10")),
            ..UserStats::default()
        };

        for day in ["2026-03-10", "2026-03-02"] {
            let result = apply_event(
                &stats,
                &ProgressEvent::StreakRollover {
                    activity_date: must_date(day),
                },
                &earned(&["streak_3"]),
                &catalog,
            );
            assert_eq!(result.final_stats.login_streak, 4);
            assert_eq!(
                result.final_stats.last_activity_date,
                Some(must_date("2026-03-10"))
            );
            assert_eq!(result.xp_gained, 0);
        }
    }

    #[test]
    fn streak_continues_across_month_and_year_boundaries() {
        let catalog = ProgressCatalog::v1();
        for (last, next) in [("2026-02-28", "2026-03-01"), ("2025-12-31", "2026-01-01")] {
            let stats = UserStats {
                login_streak: 1,
                longest_streak: 1,
                last_activity_date: Some(must_date(last)),
                ..UserStats::default()
            };
            let result = apply_event(
                &stats,
                &ProgressEvent::StreakRollover {
                    activity_date: must_date(next),
                },
                &BTreeSet::new(),
                &catalog,
            );
            assert_eq!(result.final_stats.login_streak, 2, "{last} -> {next}");
        }
    }

    #[test]
    fn apply_event_never_decreases_counters() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            lessons_completed: 12,
            courses_completed: 2,
            login_streak: 3,
            longest_streak: 8,
            total_xp: 640,
            last_activity_date: Some(must_date("2026-04-01")),
        };
        let already = earned(&[
            "first_lesson",
            "lessons_5",
            "lessons_10",
            "first_course",
            "streak_3",
            "streak_7",
            "xp_500",
        ]);

        for event in [
            ProgressEvent::LessonComplete,
            ProgressEvent::CourseComplete,
            ProgressEvent::StreakRollover {
                activity_date: must_date("2026-04-02"),
            },
            ProgressEvent::StreakRollover {
                activity_date: must_date("2026-04-09"),
            },
        ] {
            let result = apply_event(&stats, &event, &already, &catalog);
            let after = &result.final_stats;
            assert!(after.total_xp >= stats.total_xp);
            assert!(after.lessons_completed >= stats.lessons_completed);
            assert!(after.courses_completed >= stats.courses_completed);
            assert!(after.longest_streak >= stats.longest_streak);
            assert!(after.longest_streak >= after.login_streak);
            assert_eq!(result.xp_gained, after.total_xp - stats.total_xp);
            assert_eq!(result.xp_gained, result.direct_xp + result.badge_xp);
        }
    }

    #[test]
    fn course_completion_unlocks_reward_badge() {
        let catalog = ProgressCatalog::v1();
        let stats = UserStats {
            courses_completed: 2,
            total_xp: 460,
            ..UserStats::default()
        };

        let result = apply_event(
            &stats,
            &ProgressEvent::CourseComplete,
            &earned(&["first_course"]),
            &catalog,
        );

        assert_eq!(badge_ids(&result), vec!["courses_3", "xp_500"]);
        let rewards: Vec<(&str, RewardKind)> = result
            .pending_rewards()
            .map(|(item, reward)| (item.id.as_str(), reward.kind))
            .collect();
        assert_eq!(rewards, vec![("courses_3", RewardKind::BonusDays)]);
        assert_eq!(result.final_stats.total_xp, 460 + 50 + 150 + 50);
    }

    #[test]
    fn claiming_twice_keeps_original_timestamp() {
        let user_id = UserId(must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M2")));
        let reward = Reward {
            kind: RewardKind::PromoCode,
            value: "LEARN25".to_string(),
            label: "25% off".to_string(),
        };
        let created = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let first_claim = must_ok(parse_rfc3339_utc("2026-02-08T09:30:00Z"));
        let second_claim = must_ok(parse_rfc3339_utc("2026-02-09T10:00:00Z"));

        let mut claimed = ClaimedReward::unclaimed(user_id, "lessons_25".to_string(), reward, created);
        assert!(!claimed.claimed);

        assert_eq!(claimed.claim(first_claim), ClaimStatus::Claimed);
        assert_eq!(claimed.claim(second_claim), ClaimStatus::AlreadyClaimed);
        assert!(claimed.claimed);
        assert_eq!(claimed.claimed_at, Some(first_claim));
    }

    #[test]
    fn alternate_catalog_is_injected_not_global() {
        let catalog = must_ok(ProgressCatalog::new(
            7,
            vec![
                rank("white", "White Belt", 0, Some(9), "w", "#fff"),
                rank("black", "Black Belt", 10, None, "b", "#000"),
            ],
            vec![badge(
                "one",
                "One",
                "One lesson",
                "1",
                5,
                BadgeCategory::Learning,
                UnlockCondition::LessonsCompleted { min: 1 },
                None,
            )],
            XpTable {
                lesson_complete: 3,
                course_complete: 0,
            },
        ));

        let result = apply_event(
            &UserStats {
                total_xp: 2,
                ..UserStats::default()
            },
            &ProgressEvent::LessonComplete,
            &BTreeSet::new(),
            &catalog,
        );
        assert_eq!(result.catalog_version, 7);
        assert_eq!(result.final_stats.total_xp, 10);
        assert_eq!(must_some(result.new_rank).id, "black");
    }

    #[test]
    fn catalog_rejects_rank_gap() {
        let result = ProgressCatalog::new(
            1,
            vec![
                rank("a", "A", 0, Some(49), "", ""),
                rank("b", "B", 60, None, "", ""),
            ],
            Vec::new(),
            ProgressCatalog::v1().xp,
        );
        assert!(matches!(result, Err(ProgressError::Configuration(_))));
    }

    #[test]
    fn catalog_rejects_bounded_terminal_rank_and_nonzero_start() {
        let bounded = ProgressCatalog::new(
            1,
            vec![rank("a", "A", 0, Some(49), "", "")],
            Vec::new(),
            ProgressCatalog::v1().xp,
        );
        assert!(bounded.is_err());

        let late_start = ProgressCatalog::new(
            1,
            vec![rank("a", "A", 5, None, "", "")],
            Vec::new(),
            ProgressCatalog::v1().xp,
        );
        assert!(late_start.is_err());
    }

    #[test]
    fn catalog_rejects_duplicate_badge_ids_and_unordered_thresholds() {
        let mut document = CatalogDocument::from(ProgressCatalog::v1());
        let duplicate = document.badges[0].clone();
        document.badges.push(duplicate);
        assert!(ProgressCatalog::try_from(document).is_err());

        let mut document = CatalogDocument::from(ProgressCatalog::v1());
        document.badges.swap(0, 1);
        let err = match ProgressCatalog::try_from(document) {
            Ok(_) => panic!("expected unordered thresholds to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn catalog_rejects_invalid_reward_values() {
        for (kind, value) in [
            (RewardKind::DiscountPercent, "0"),
            (RewardKind::DiscountPercent, "101"),
            (RewardKind::BonusDays, "-3"),
            (RewardKind::PromoCode, "  "),
        ] {
            let mut document = CatalogDocument::from(ProgressCatalog::v1());
            document.badges[0].reward = Some(Reward {
                kind,
                value: value.to_string(),
                label: "label".to_string(),
            });
            assert!(
                ProgressCatalog::try_from(document).is_err(),
                "{kind:?} {value} accepted"
            );
        }
    }

    #[test]
    fn catalog_json_decoding_validates() {
        let encoded = must_ok(serde_json::to_value(ProgressCatalog::v1()));
        let decoded = must_ok(ProgressCatalog::from_json(&encoded));
        assert_eq!(decoded, ProgressCatalog::v1());

        let mut broken = encoded;
        broken["ranks"][0]["min_xp"] = json!(1);
        assert!(matches!(
            ProgressCatalog::from_json(&broken),
            Err(ProgressError::Configuration(_))
        ));
    }

    #[test]
    fn event_json_shape_is_tagged_with_iso_dates() {
        let event = ProgressEvent::StreakRollover {
            activity_date: must_date("2026-05-04"),
        };
        let value = must_ok(serde_json::to_value(event));
        assert_eq!(
            value,
            json!({"event": "streak_rollover", "activity_date": "2026-05-04"})
        );
        let decoded: ProgressEvent = must_ok(serde_json::from_value(value));
        assert_eq!(decoded, event);

        assert_eq!(
            must_ok(serde_json::to_value(ProgressEvent::LessonComplete)),
            json!({"event": "lesson_complete"})
        );
    }

    #[test]
    fn event_from_parts_requires_date_for_rollover() {
        assert!(ProgressEvent::from_parts(ProgressEventKind::StreakRollover, None).is_err());
        assert_eq!(
            must_ok(ProgressEvent::from_parts(
                ProgressEventKind::CourseComplete,
                None
            )),
            ProgressEvent::CourseComplete
        );
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }
}
