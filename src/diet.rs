//! Meal log.
//!
//! Entries are stored per user in `<username>/diet.json`. Owners manage their
//! own entries; administrators may read and edit anyone's.
use std::sync::Arc;

use axum::{Extension, extract::State};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::catalog::find_visible_product;
use crate::error::AppError;
use crate::extract::{Json, Path, Query};
use crate::login::{CurrentUser, get_users};
use crate::nutrition::{MealType, Nutrition, estimate_nutrition, round1};
use crate::store::{DIET_FILE, Store};

pub const MAX_ANALYTICS_DAYS: u32 = 365;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MealItem {
    #[serde(default)]
    pub name: String,
    pub quantity: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DietEntry {
    pub id: Uuid,
    pub owner: String,
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub items: Vec<MealItem>,
    pub feeling: Option<String>,
    pub energy_level: Option<u8>,
    pub comments: Option<String>,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub fiber: f64,
    pub is_custom_meal: bool,
    pub custom_meal_name: Option<String>,
    pub custom_meal_description: Option<String>,
    pub image: Option<String>,
    pub product_id: Option<Uuid>,
    pub collection_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DietEntry {
    pub fn nutrition(&self) -> Nutrition {
        Nutrition::new(self.calories, self.protein, self.carbs, self.fat, self.fiber)
    }

    fn set_nutrition(&mut self, nutrition: Nutrition) {
        self.calories = nutrition.calories;
        self.protein = nutrition.protein;
        self.carbs = nutrition.carbs;
        self.fat = nutrition.fat;
        self.fiber = nutrition.fiber;
    }

    /// Display name: the custom meal name, else the first item's name.
    pub fn title(&self) -> String {
        self.custom_meal_name
            .clone()
            .or_else(|| self.items.first().map(|item| item.name.clone()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.meal_type.as_str().to_string())
    }
}

/// Create/replace payload.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DietInput {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    pub meal_type: Option<MealType>,
    #[serde(default)]
    pub items: Vec<MealItem>,
    #[serde(default)]
    pub feeling: Option<String>,
    #[serde(default)]
    pub energy_level: Option<u8>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub calories: f64,
    #[serde(default)]
    pub protein: f64,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub fat: f64,
    #[serde(default)]
    pub fiber: f64,
    #[serde(default)]
    pub is_custom_meal: bool,
    #[serde(default)]
    pub custom_meal_name: Option<String>,
    #[serde(default)]
    pub custom_meal_description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub collection_id: Option<Uuid>,
}

impl DietInput {
    fn nutrition(&self) -> Nutrition {
        Nutrition::new(self.calories, self.protein, self.carbs, self.fat, self.fiber)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DietQuery {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub meal_type: Option<MealType>,
}

impl DietQuery {
    pub fn matches(&self, entry: &DietEntry) -> bool {
        self.date.is_none_or(|d| entry.date == d)
            && self.start.is_none_or(|s| entry.date >= s)
            && self.end.is_none_or(|e| entry.date <= e)
            && self.meal_type.is_none_or(|m| entry.meal_type == m)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AnalyticsQuery {
    #[serde(default)]
    pub days: Option<u32>,
}

impl AnalyticsQuery {
    pub fn days(&self) -> Result<u32, AppError> {
        match self.days.unwrap_or(7) {
            d @ 1..=MAX_ANALYTICS_DAYS => Ok(d),
            _ => Err(AppError::bad_request(format!(
                "days must be between 1 and {MAX_ANALYTICS_DAYS}"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub entries: usize,
    pub nutrition: Nutrition,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MealTypeBreakdown {
    pub meal_type: MealType,
    pub entries: usize,
    pub calories: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DietAnalytics {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub entries: usize,
    pub days_logged: usize,
    pub total: Nutrition,
    /// Averaged over days that have at least one entry
    pub daily_average: Nutrition,
    pub by_meal_type: Vec<MealTypeBreakdown>,
    pub daily: Vec<DailyTotal>,
}

fn check_meal(
    is_custom_meal: bool,
    custom_meal_name: Option<&str>,
    items: &[MealItem],
    energy_level: Option<u8>,
    nutrition: Nutrition,
) -> Result<(), AppError> {
    if is_custom_meal && custom_meal_name.is_none_or(|name| name.trim().is_empty()) {
        return Err(AppError::bad_request("Custom meals need a name"));
    }
    if let Some(item) = items
        .iter()
        .find(|item| !(item.quantity.is_finite() && item.quantity > 0.0))
    {
        return Err(AppError::bad_request(format!(
            "Quantity for \"{}\" must be greater than zero",
            item.name
        )));
    }
    if energy_level.is_some_and(|level| !(1..=5).contains(&level)) {
        return Err(AppError::bad_request("Energy level must be between 1 and 5"));
    }
    if !nutrition.is_valid() {
        return Err(AppError::bad_request("Nutrition values must be non-negative"));
    }

    Ok(())
}

/// Checks the rules a meal entry must satisfy before it is stored.
///
/// # Errors
/// * `BadRequest` when the meal type is missing, a custom meal has no name,
///   an item quantity is not positive, the energy level is outside 1..=5 or
///   a nutrition value is negative
pub fn validate_input(input: &DietInput) -> Result<(), AppError> {
    if input.meal_type.is_none() {
        return Err(AppError::bad_request("Meal type is required"));
    }
    check_meal(
        input.is_custom_meal,
        input.custom_meal_name.as_deref(),
        &input.items,
        input.energy_level,
        input.nutrition(),
    )
}

/// Applies the same rules as [`validate_input`] to an already built entry,
/// such as one read back from an archive.
pub fn validate_entry(entry: &DietEntry) -> Result<(), AppError> {
    check_meal(
        entry.is_custom_meal,
        entry.custom_meal_name.as_deref(),
        &entry.items,
        entry.energy_level,
        entry.nutrition(),
    )
}

/// Nutrition to store for an entry.
///
/// Any non-zero explicit value wins, so macros sent without calories are kept.
/// When all five are zero, custom meals are estimated from their name and
/// product meals take the product's per-serving values times the summed item
/// quantities.
fn resolve_nutrition(
    store: &Store,
    user: &CurrentUser,
    input: &DietInput,
    meal_type: MealType,
) -> Result<Nutrition, AppError> {
    let given = input.nutrition();
    if given != Nutrition::default() {
        return Ok(given);
    }

    if input.is_custom_meal {
        let name = input.custom_meal_name.as_deref().unwrap_or_default();
        let estimate =
            estimate_nutrition(name, meal_type, input.custom_meal_description.as_deref());
        return Ok(estimate.nutrition);
    }

    if let Some(product_id) = input.product_id {
        let product = find_visible_product(store, user, product_id)?;
        let servings: f64 = if input.items.is_empty() {
            1.0
        } else {
            input.items.iter().map(|item| item.quantity).sum()
        };
        return Ok(product.nutrition.scaled(servings).rounded());
    }

    Ok(given)
}

fn build_entry(
    store: &Store,
    user: &CurrentUser,
    owner: &str,
    input: DietInput,
) -> Result<DietEntry, AppError> {
    validate_input(&input)?;
    let meal_type = input
        .meal_type
        .ok_or_else(|| AppError::bad_request("Meal type is required"))?;
    let nutrition = resolve_nutrition(store, user, &input, meal_type)?;
    let now = Utc::now();

    let mut entry = DietEntry {
        id: Uuid::new_v4(),
        owner: owner.to_string(),
        date: input.date.unwrap_or_else(|| now.date_naive()),
        meal_type,
        items: input.items,
        feeling: input.feeling,
        energy_level: input.energy_level,
        comments: input.comments,
        calories: 0.0,
        protein: 0.0,
        carbs: 0.0,
        fat: 0.0,
        fiber: 0.0,
        is_custom_meal: input.is_custom_meal,
        custom_meal_name: input.custom_meal_name.map(|n| n.trim().to_string()),
        custom_meal_description: input.custom_meal_description,
        image: input.image,
        product_id: input.product_id,
        collection_id: input.collection_id,
        created_at: now,
        updated_at: now,
    };
    entry.set_nutrition(nutrition);
    Ok(entry)
}

/// Validates and stores a new entry owned by `user`.
///
/// # Arguments
/// * `store` - Data directory, the entry goes to `<username>/diet.json`
/// * `user` - Owner of the new entry
/// * `input` - Entry fields. Nutrition left at zero is filled in by
///   estimation or from the referenced product
///
/// # Returns
/// The stored entry with its id and timestamps.
///
/// # Errors
/// * `BadRequest` when the input breaks a meal rule
/// * `Forbidden` or `NotFound` when `productId` names a product the user
///   cannot see
pub fn create_entry(
    store: &Store,
    user: &CurrentUser,
    input: DietInput,
) -> Result<DietEntry, AppError> {
    let entry = build_entry(store, user, &user.username, input)?;

    store.update(
        &Store::user_file(&user.username, DIET_FILE),
        |entries: &mut Vec<DietEntry>| {
            entries.push(entry.clone());
            Ok(())
        },
    )?;

    info!("{} logged {} on {}", user.username, entry.title(), entry.date);
    Ok(entry)
}

pub fn list_entries(
    store: &Store,
    username: &str,
    query: &DietQuery,
) -> Result<Vec<DietEntry>, AppError> {
    let mut entries: Vec<DietEntry> = store.read(&Store::user_file(username, DIET_FILE))?;
    entries.retain(|entry| query.matches(entry));
    entries.sort_by(|a, b| a.date.cmp(&b.date).then(a.created_at.cmp(&b.created_at)));
    Ok(entries)
}

/// Finds an entry in the caller's log, or in anyone's log for administrators.
fn locate_entry(store: &Store, user: &CurrentUser, id: Uuid) -> Result<DietEntry, AppError> {
    let own: Vec<DietEntry> = store.read(&Store::user_file(&user.username, DIET_FILE))?;
    if let Some(entry) = own.into_iter().find(|e| e.id == id) {
        return Ok(entry);
    }

    if user.is_admin() {
        for username in get_users(store)?.keys() {
            let entries: Vec<DietEntry> = store.read(&Store::user_file(username, DIET_FILE))?;
            if let Some(entry) = entries.into_iter().find(|e| e.id == id) {
                return Ok(entry);
            }
        }
    }

    Err(AppError::NotFound("Diet entry"))
}

pub fn get_entry(store: &Store, user: &CurrentUser, id: Uuid) -> Result<DietEntry, AppError> {
    locate_entry(store, user, id)
}

/// Replaces an entry's content, keeping its id, owner and creation time.
pub fn update_entry(
    store: &Store,
    user: &CurrentUser,
    id: Uuid,
    input: DietInput,
) -> Result<DietEntry, AppError> {
    let existing = locate_entry(store, user, id)?;
    let mut updated = build_entry(store, user, &existing.owner, input)?;
    updated.id = existing.id;
    updated.created_at = existing.created_at;

    store.update(
        &Store::user_file(&existing.owner, DIET_FILE),
        |entries: &mut Vec<DietEntry>| {
            let slot = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(AppError::NotFound("Diet entry"))?;
            *slot = updated.clone();
            Ok(())
        },
    )?;

    Ok(updated)
}

pub fn delete_entry(store: &Store, user: &CurrentUser, id: Uuid) -> Result<(), AppError> {
    let existing = locate_entry(store, user, id)?;

    store.update(
        &Store::user_file(&existing.owner, DIET_FILE),
        |entries: &mut Vec<DietEntry>| {
            entries.retain(|e| e.id != id);
            Ok(())
        },
    )?;

    info!("{} deleted diet entry {id}", user.username);
    Ok(())
}

fn round_nutrition(nutrition: Nutrition) -> Nutrition {
    Nutrition {
        calories: round1(nutrition.calories),
        ..nutrition.rounded()
    }
}

/// Totals and averages for the `days` calendar days ending at `end`.
pub fn compute_analytics(entries: &[DietEntry], end: NaiveDate, days: u32) -> DietAnalytics {
    let days = days.max(1);
    let start = end - Duration::days(i64::from(days) - 1);

    let mut daily: Vec<DailyTotal> = start
        .iter_days()
        .take(days as usize)
        .map(|date| DailyTotal {
            date,
            entries: 0,
            nutrition: Nutrition::default(),
        })
        .collect();
    let mut by_meal_type: Vec<MealTypeBreakdown> = MealType::ALL
        .iter()
        .map(|&meal_type| MealTypeBreakdown {
            meal_type,
            entries: 0,
            calories: 0.0,
        })
        .collect();

    let mut total = Nutrition::default();
    let mut count = 0;
    for entry in entries.iter().filter(|e| e.date >= start && e.date <= end) {
        let offset = (entry.date - start).num_days() as usize;
        let day = &mut daily[offset];
        day.entries += 1;
        day.nutrition = day.nutrition + entry.nutrition();

        if let Some(slot) = by_meal_type.iter_mut().find(|b| b.meal_type == entry.meal_type) {
            slot.entries += 1;
            slot.calories += entry.calories;
        }

        total = total + entry.nutrition();
        count += 1;
    }

    let days_logged = daily.iter().filter(|d| d.entries > 0).count();
    let daily_average = if days_logged == 0 {
        Nutrition::default()
    } else {
        round_nutrition(total.scaled(1.0 / days_logged as f64))
    };

    for day in &mut daily {
        day.nutrition = round_nutrition(day.nutrition);
    }
    for slot in &mut by_meal_type {
        slot.calories = round1(slot.calories);
    }

    DietAnalytics {
        start,
        end,
        entries: count,
        days_logged,
        total: round_nutrition(total),
        daily_average,
        by_meal_type,
        daily,
    }
}

pub async fn handle_create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(input): Json<DietInput>,
) -> Result<Json<DietEntry>, AppError> {
    Ok(Json(create_entry(&state.store, &user, input)?))
}

pub async fn handle_list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<DietQuery>,
) -> Result<Json<Vec<DietEntry>>, AppError> {
    Ok(Json(list_entries(&state.store, &user.username, &query)?))
}

pub async fn handle_get(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<DietEntry>, AppError> {
    Ok(Json(get_entry(&state.store, &user, id)?))
}

pub async fn handle_update(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(input): Json<DietInput>,
) -> Result<Json<DietEntry>, AppError> {
    Ok(Json(update_entry(&state.store, &user, id, input)?))
}

pub async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    delete_entry(&state.store, &user, id)?;
    Ok(Json(serde_json::json!({ "message": "Diet entry deleted" })))
}

pub async fn handle_analytics(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<DietAnalytics>, AppError> {
    let days = query.days()?;
    let entries = list_entries(&state.store, &user.username, &DietQuery::default())?;
    Ok(Json(compute_analytics(
        &entries,
        Utc::now().date_naive(),
        days,
    )))
}

/// Another user's log. Administrators only.
pub async fn handle_admin_list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(user_id): Path<String>,
    Query(query): Query<DietQuery>,
) -> Result<Json<Vec<DietEntry>>, AppError> {
    user.require_admin()?;
    if !get_users(&state.store)?.contains_key(&user_id) {
        return Err(AppError::NotFound("User"));
    }
    Ok(Json(list_entries(&state.store, &user_id, &query)?))
}
