//! Daily water intake.
//!
//! One [`WaterDay`] per user and calendar day, stored in `<username>/water.json`.
//! A day without a record reads as zero glasses with the most recent goal.
use std::sync::Arc;

use axum::{
    Extension,
    body::Bytes,
    extract::State,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::diet::AnalyticsQuery;
use crate::error::AppError;
use crate::extract::{Json, Query};
use crate::login::CurrentUser;
use crate::nutrition::round1;
use crate::store::{Store, WATER_FILE};

pub const MAX_GOAL: u32 = 30;
pub const MAX_GLASSES_PER_CHANGE: u32 = 20;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaterDay {
    pub id: Uuid,
    pub date: NaiveDate,
    pub glasses: u32,
    pub goal: u32,
    pub updated_at: DateTime<Utc>,
}

impl WaterDay {
    pub fn goal_met(&self) -> bool {
        self.glasses >= self.goal
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaterAnalytics {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days_tracked: usize,
    pub total_glasses: u32,
    pub average_glasses: f64,
    pub days_goal_met: usize,
    /// Percentage of tracked days that met their goal
    pub goal_completion_rate: f64,
    pub current_streak: u32,
}

#[derive(Debug, Deserialize)]
pub struct GlassesRequest {
    #[serde(default = "one")]
    pub glasses: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct GoalRequest {
    pub goal: u32,
}

pub fn records(store: &Store, username: &str) -> Result<Vec<WaterDay>, AppError> {
    store.read(&Store::user_file(username, WATER_FILE))
}

/// Goal of the latest record on or before `date`.
fn carried_goal(days: &[WaterDay], date: NaiveDate, default_goal: u32) -> u32 {
    days.iter()
        .filter(|d| d.date <= date)
        .max_by_key(|d| d.date)
        .map(|d| d.goal)
        .unwrap_or(default_goal)
}

fn blank_day(days: &[WaterDay], date: NaiveDate, default_goal: u32) -> WaterDay {
    WaterDay {
        id: Uuid::new_v4(),
        date,
        glasses: 0,
        goal: carried_goal(days, date, default_goal),
        updated_at: Utc::now(),
    }
}

pub fn get_day(
    store: &Store,
    username: &str,
    date: NaiveDate,
    default_goal: u32,
) -> Result<WaterDay, AppError> {
    let days = records(store, username)?;
    Ok(days
        .iter()
        .find(|d| d.date == date)
        .cloned()
        .unwrap_or_else(|| blank_day(&days, date, default_goal)))
}

fn mutate_day(
    store: &Store,
    username: &str,
    date: NaiveDate,
    default_goal: u32,
    f: impl FnOnce(&mut WaterDay),
) -> Result<WaterDay, AppError> {
    store.update(
        &Store::user_file(username, WATER_FILE),
        |days: &mut Vec<WaterDay>| {
            if !days.iter().any(|d| d.date == date) {
                let day = blank_day(days, date, default_goal);
                days.push(day);
                days.sort_by_key(|d| d.date);
            }

            let day = days
                .iter_mut()
                .find(|d| d.date == date)
                .ok_or_else(|| AppError::internal("water record vanished"))?;
            f(day);
            day.updated_at = Utc::now();
            Ok(day.clone())
        },
    )
}

/// Reads the glass count from an add/remove body.
///
/// An empty body means one glass. Anything else must be a valid
/// [`GlassesRequest`].
pub fn glasses_from(body: &[u8]) -> Result<u32, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(1);
    }
    serde_json::from_slice::<GlassesRequest>(body)
        .map(|request| request.glasses)
        .map_err(|e| AppError::bad_request(format!("Invalid request body: {e}")))
}

fn check_glasses(glasses: u32) -> Result<(), AppError> {
    if (1..=MAX_GLASSES_PER_CHANGE).contains(&glasses) {
        Ok(())
    } else {
        Err(AppError::bad_request(format!(
            "glasses must be between 1 and {MAX_GLASSES_PER_CHANGE}"
        )))
    }
}

/// Adds glasses to the record for `date`, creating it if needed.
///
/// # Errors
/// * `BadRequest` unless `glasses` is between 1 and [`MAX_GLASSES_PER_CHANGE`]
pub fn add_glasses(
    store: &Store,
    username: &str,
    date: NaiveDate,
    glasses: u32,
    default_goal: u32,
) -> Result<WaterDay, AppError> {
    check_glasses(glasses)?;
    mutate_day(store, username, date, default_goal, |day| {
        day.glasses = day.glasses.saturating_add(glasses);
    })
}

/// Never goes below zero.
pub fn remove_glasses(
    store: &Store,
    username: &str,
    date: NaiveDate,
    glasses: u32,
    default_goal: u32,
) -> Result<WaterDay, AppError> {
    check_glasses(glasses)?;
    mutate_day(store, username, date, default_goal, |day| {
        day.glasses = day.glasses.saturating_sub(glasses);
    })
}

pub fn reset_day(
    store: &Store,
    username: &str,
    date: NaiveDate,
    default_goal: u32,
) -> Result<WaterDay, AppError> {
    mutate_day(store, username, date, default_goal, |day| day.glasses = 0)
}

pub fn set_goal(
    store: &Store,
    username: &str,
    date: NaiveDate,
    goal: u32,
    default_goal: u32,
) -> Result<WaterDay, AppError> {
    if !(1..=MAX_GOAL).contains(&goal) {
        return Err(AppError::bad_request(format!(
            "Goal must be between 1 and {MAX_GOAL} glasses"
        )));
    }
    mutate_day(store, username, date, default_goal, |day| day.goal = goal)
}

/// Recorded days in the window ending at `end`, newest first.
pub fn history(days: &[WaterDay], end: NaiveDate, window: u32) -> Vec<WaterDay> {
    let start = end - Duration::days(i64::from(window.max(1)) - 1);
    let mut recent: Vec<WaterDay> = days
        .iter()
        .filter(|d| d.date >= start && d.date <= end)
        .cloned()
        .collect();
    recent.sort_by(|a, b| b.date.cmp(&a.date));
    recent
}

/// Consecutive goal-met days ending at `today`. A today that is not met yet
/// does not break the streak; the count then starts from yesterday.
pub fn current_streak(days: &[WaterDay], today: NaiveDate) -> u32 {
    let met = |date: NaiveDate| days.iter().any(|d| d.date == date && d.goal_met());

    let mut cursor = if met(today) {
        today
    } else {
        today - Duration::days(1)
    };
    let mut streak = 0;
    while met(cursor) {
        streak += 1;
        cursor = cursor - Duration::days(1);
    }
    streak
}

pub fn compute_analytics(days: &[WaterDay], end: NaiveDate, window: u32) -> WaterAnalytics {
    let recent = history(days, end, window);
    let start = end - Duration::days(i64::from(window.max(1)) - 1);

    let tracked: Vec<&WaterDay> = recent.iter().filter(|d| d.glasses > 0).collect();
    let total_glasses: u32 = tracked.iter().map(|d| d.glasses).sum();
    let days_goal_met = tracked.iter().filter(|d| d.goal_met()).count();

    let (average_glasses, goal_completion_rate) = if tracked.is_empty() {
        (0.0, 0.0)
    } else {
        let n = tracked.len() as f64;
        (
            round1(f64::from(total_glasses) / n),
            round1(days_goal_met as f64 * 100.0 / n),
        )
    };

    WaterAnalytics {
        start,
        end,
        days_tracked: tracked.len(),
        total_glasses,
        average_glasses,
        days_goal_met,
        goal_completion_rate,
        current_streak: current_streak(days, end),
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub async fn handle_today(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<WaterDay>, AppError> {
    Ok(Json(get_day(
        &state.store,
        &user.username,
        today(),
        state.config.default_water_goal,
    )?))
}

pub async fn handle_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<Vec<WaterDay>>, AppError> {
    let window = query.days()?;
    let days = records(&state.store, &user.username)?;
    Ok(Json(history(&days, today(), window)))
}

pub async fn handle_analytics(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<WaterAnalytics>, AppError> {
    let window = query.days()?;
    let days = records(&state.store, &user.username)?;
    Ok(Json(compute_analytics(&days, today(), window)))
}

pub async fn handle_add(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    body: Bytes,
) -> Result<Json<WaterDay>, AppError> {
    let glasses = glasses_from(&body)?;
    Ok(Json(add_glasses(
        &state.store,
        &user.username,
        today(),
        glasses,
        state.config.default_water_goal,
    )?))
}

pub async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    body: Bytes,
) -> Result<Json<WaterDay>, AppError> {
    let glasses = glasses_from(&body)?;
    Ok(Json(remove_glasses(
        &state.store,
        &user.username,
        today(),
        glasses,
        state.config.default_water_goal,
    )?))
}

pub async fn handle_reset(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<WaterDay>, AppError> {
    Ok(Json(reset_day(
        &state.store,
        &user.username,
        today(),
        state.config.default_water_goal,
    )?))
}

pub async fn handle_goal(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<GoalRequest>,
) -> Result<Json<WaterDay>, AppError> {
    Ok(Json(set_goal(
        &state.store,
        &user.username,
        today(),
        request.goal,
        state.config.default_water_goal,
    )?))
}
