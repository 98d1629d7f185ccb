//! Farming plan, stage schedule, and harvest recording.
//!
//! A user has at most one active plan. Stage dates are derived from the
//! start date; fertilizer applications are whatever the user entered.
//! Recording a harvest moves the plan into the harvest history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use time::Date;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::ledger::ActionLedger;
use crate::store::Store;

time::serde::format_description!(plan_date, Date, "[year]-[month]-[day]");

/// How often every user's plan is re-checked for a stage starting today.
pub const PROGRESS_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub const PROGRESS_TITLE: &str = "Farming Progress Update";

pub const NOT_STARTED: &str = "Not Started";

const VEGETATIVE: &str = "Vegetative Stage";
const FIRST_FERTILIZER: &str = "First Fertilizer Application";
const REPRODUCTIVE: &str = "Reproductive Stage";
const SECOND_FERTILIZER: &str = "Second Fertilizer Application";
const RIPENING: &str = "Ripening Stage";
const HARVEST: &str = "Harvest";

/// Stages that can be "current"; fertilizer applications are events only.
const MAIN_STAGES: [&str; 4] = [VEGETATIVE, REPRODUCTIVE, RIPENING, HARVEST];

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("no active farming plan")]
    NoPlan,
    #[error("invalid farming plan: {0}")]
    Invalid(String),
    #[error("harvest amount must be a positive number of sacks")]
    InvalidAmount,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlantingMethod {
    Direct,
    Transplant,
}

impl PlantingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Transplant => "transplant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "transplant" => Some(Self::Transplant),
            _ => None,
        }
    }

    /// Transplanted rice spends longer in the field.
    pub fn days_to_harvest(self) -> i64 {
        match self {
            Self::Direct => 100,
            Self::Transplant => 110,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmingPlan {
    pub rice_variety: String,
    pub planting_method: PlantingMethod,
    pub hectare_coverage: f64,
    #[serde(with = "plan_date")]
    pub start_date: Date,
    #[serde(with = "plan_date")]
    pub first_application: Date,
    #[serde(with = "plan_date")]
    pub second_application: Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestRecord {
    pub rice_variety: String,
    pub planting_method: PlantingMethod,
    pub hectare_coverage: f64,
    #[serde(with = "plan_date")]
    pub start_date: Date,
    #[serde(with = "plan_date")]
    pub harvest_date: Date,
    /// Sacks of rice.
    pub harvest_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub name: &'static str,
    #[serde(with = "plan_date")]
    pub date: Date,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub current_stage: &'static str,
    pub days_since_start: i64,
    pub stages: Vec<Stage>,
}

fn days_after(start: Date, days: i64) -> Date {
    start
        .checked_add(time::Duration::days(days))
        .unwrap_or(Date::MAX)
}

impl FarmingPlan {
    /// Collects every problem rather than stopping at the first.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut problems = Vec::new();
        if self.rice_variety.trim().is_empty() {
            problems.push("rice variety must not be empty".to_string());
        }
        if self.hectare_coverage.is_nan() || self.hectare_coverage <= 0.0 {
            problems.push(format!(
                "hectare coverage must be > 0, got {}",
                self.hectare_coverage
            ));
        }
        for (name, d) in [
            ("first application", self.first_application),
            ("second application", self.second_application),
        ] {
            if d < self.start_date {
                problems.push(format!("{name} {d} is before start date {}", self.start_date));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PlanError::Invalid(problems.join("; ")))
        }
    }

    pub fn harvest_date(&self) -> Date {
        days_after(self.start_date, self.planting_method.days_to_harvest())
    }

    /// The six scheduled events, in schedule order.
    pub fn stages(&self) -> Vec<Stage> {
        vec![
            Stage {
                name: VEGETATIVE,
                date: self.start_date,
            },
            Stage {
                name: FIRST_FERTILIZER,
                date: self.first_application,
            },
            Stage {
                name: REPRODUCTIVE,
                date: days_after(self.start_date, 45),
            },
            Stage {
                name: SECOND_FERTILIZER,
                date: self.second_application,
            },
            Stage {
                name: RIPENING,
                date: days_after(self.start_date, 80),
            },
            Stage {
                name: HARVEST,
                date: self.harvest_date(),
            },
        ]
    }

    pub fn current_stage(&self, today: Date) -> &'static str {
        self.stages()
            .iter()
            .rev()
            .find(|s| MAIN_STAGES.contains(&s.name) && s.date <= today)
            .map(|s| s.name)
            .unwrap_or(NOT_STARTED)
    }

    pub fn progress(&self, today: Date) -> Progress {
        Progress {
            current_stage: self.current_stage(today),
            days_since_start: (today - self.start_date).whole_days(),
            stages: self.stages(),
        }
    }

    pub fn into_harvest(self, harvest_date: Date, harvest_amount: f64) -> HarvestRecord {
        HarvestRecord {
            rice_variety: self.rice_variety,
            planting_method: self.planting_method,
            hectare_coverage: self.hectare_coverage,
            start_date: self.start_date,
            harvest_date,
            harvest_amount,
        }
    }
}

/// Sacks harvested under one grouping key (variety, method or month).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldGroup {
    pub key: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestSummary {
    pub harvest_count: usize,
    pub total_harvest: f64,
    pub top_harvest: f64,
    pub latest_harvest: f64,
    pub previous_harvest: f64,
    /// Latest against previous, in percent. `None` without a previous
    /// harvest to compare with.
    pub percentage_change: Option<f64>,
    pub average_yield_per_cycle: f64,
    pub by_variety: Vec<YieldGroup>,
    pub by_method: Vec<YieldGroup>,
    /// Keyed `YYYY-MM`, oldest month first.
    pub by_month: Vec<YieldGroup>,
}

fn grouped(totals: BTreeMap<String, f64>) -> Vec<YieldGroup> {
    totals
        .into_iter()
        .map(|(key, total)| YieldGroup { key, total })
        .collect()
}

/// Totals and trends over a user's harvest history, in any order.
pub fn summarize_harvests(history: &[HarvestRecord]) -> HarvestSummary {
    let mut newest_first: Vec<&HarvestRecord> = history.iter().collect();
    newest_first.sort_by(|a, b| b.harvest_date.cmp(&a.harvest_date));

    let mut by_variety = BTreeMap::new();
    let mut by_method = BTreeMap::new();
    let mut by_month = BTreeMap::new();
    for h in &newest_first {
        *by_variety.entry(h.rice_variety.clone()).or_insert(0.0) += h.harvest_amount;
        *by_method
            .entry(h.planting_method.as_str().to_string())
            .or_insert(0.0) += h.harvest_amount;
        let month = format!("{}-{:02}", h.harvest_date.year(), u8::from(h.harvest_date.month()));
        *by_month.entry(month).or_insert(0.0) += h.harvest_amount;
    }

    let total_harvest: f64 = newest_first.iter().map(|h| h.harvest_amount).sum();
    let top_harvest = newest_first
        .iter()
        .map(|h| h.harvest_amount)
        .fold(0.0, f64::max);
    let latest_harvest = newest_first.first().map_or(0.0, |h| h.harvest_amount);
    let previous_harvest = newest_first.get(1).map_or(0.0, |h| h.harvest_amount);
    let percentage_change = (previous_harvest > 0.0)
        .then(|| (latest_harvest - previous_harvest) / previous_harvest * 100.0);
    let average_yield_per_cycle = if newest_first.is_empty() {
        0.0
    } else {
        total_harvest / newest_first.len() as f64
    };

    HarvestSummary {
        harvest_count: newest_first.len(),
        total_harvest,
        top_harvest,
        latest_harvest,
        previous_harvest,
        percentage_change,
        average_yield_per_cycle,
        by_variety: grouped(by_variety),
        by_method: grouped(by_method),
        by_month: grouped(by_month),
    }
}

pub fn stage_description(stage: &str) -> String {
    format!(
        "Your farm is now in the \"{stage}\". Make sure to take the appropriate actions for this stage."
    )
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Push one progress notification per stage dated `today`, at most once a
/// day each. Returns how many were emitted.
pub async fn announce_stages<S: Store>(
    ledger: &ActionLedger<S>,
    plan: &FarmingPlan,
    today: Date,
) -> usize {
    let mut emitted = 0;
    for stage in plan.stages().into_iter().filter(|s| s.date == today) {
        let description = stage_description(stage.name);
        if ledger.has_notified_today(&description).await {
            continue;
        }
        if ledger.append_notification(PROGRESS_TITLE, &description).await {
            info!(user = %ledger.user_id(), stage = stage.name, "farm stage reached");
            emitted += 1;
        }
    }
    emitted
}

pub async fn save_plan<S: Store>(
    store: &S,
    user_id: &str,
    plan: &FarmingPlan,
) -> Result<(), PlanError> {
    plan.validate()?;
    store.put_plan(user_id, plan).await?;
    info!(
        user = %user_id,
        variety = %plan.rice_variety,
        start = %plan.start_date,
        "farming plan saved"
    );
    Ok(())
}

/// Move the active plan into the harvest history.
pub async fn record_harvest<S: Store>(
    store: &S,
    user_id: &str,
    amount_sacks: f64,
    today: Date,
) -> Result<HarvestRecord, PlanError> {
    if !amount_sacks.is_finite() || amount_sacks <= 0.0 {
        return Err(PlanError::InvalidAmount);
    }
    let plan = store.get_plan(user_id).await?.ok_or(PlanError::NoPlan)?;
    let record = plan.into_harvest(today, amount_sacks);
    store.append_harvest(user_id, &record).await?;
    store.delete_plan(user_id).await?;
    info!(user = %user_id, sacks = amount_sacks, "harvest recorded; plan closed");
    Ok(record)
}

/// Background check of every user's plan. Runs until shutdown.
pub async fn run_progress_watch<S: Store>(
    ledgers: Vec<ActionLedger<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PROGRESS_CHECK_INTERVAL);
    info!(
        users = ledgers.len(),
        every_min = PROGRESS_CHECK_INTERVAL.as_secs() / 60,
        "progress watch started"
    );
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for ledger in &ledgers {
                    let today = ledger.today();
                    match ledger.store().get_plan(ledger.user_id()).await {
                        Ok(Some(plan)) => {
                            announce_stages(ledger, &plan, today).await;
                        }
                        Ok(None) => debug!(user = %ledger.user_id(), "no active plan"),
                        Err(e) => error!(
                            user = %ledger.user_id(),
                            "progress watch: get_plan failed: {e:#}"
                        ),
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
