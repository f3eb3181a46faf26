use std::collections::HashSet;
use std::error::Error;
use std::io::{Read, Write};
use std::sync::Arc;

use axum::{
    Extension,
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
};
use bincode::{deserialize, serialize};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::diet::{DietEntry, DietQuery, list_entries, validate_entry};
use crate::error::AppError;
use crate::extract::{Json, Query};
use crate::login::CurrentUser;
use crate::store::{DIET_FILE, Store, WATER_FILE};
use crate::water::{MAX_GOAL, WaterDay, records};

const CSV_HEADER: [&str; 14] = [
    "date",
    "mealType",
    "meal",
    "items",
    "calories",
    "protein",
    "carbs",
    "fat",
    "fiber",
    "feeling",
    "energyLevel",
    "comments",
    "isCustomMeal",
    "createdAt",
];

pub const ARCHIVE_VERSION: u32 = 1;

/// Snapshot of a user's logs, stored as gzip-compressed bincode.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserArchive {
    pub version: u32,
    pub username: String,
    pub exported_at: DateTime<Utc>,
    pub diet: Vec<DietEntry>,
    pub water: Vec<WaterDay>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub diet_entries: usize,
    pub water_days: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
}

fn push_field(line: &mut String, value: &str) {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        let escaped = value.replace('"', "\"\"");
        line.push_str(&format!("\"{}\"", escaped));
    } else {
        line.push_str(value);
    }
}

fn describe_items(entry: &DietEntry) -> String {
    entry
        .items
        .iter()
        .map(|item| {
            if item.unit.is_empty() {
                format!("{} x{}", item.name, item.quantity)
            } else {
                format!("{} {}{}", item.name, item.quantity, item.unit)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn row(entry: &DietEntry) -> Vec<String> {
    vec![
        entry.date.to_string(),
        entry.meal_type.as_str().to_string(),
        entry.title(),
        describe_items(entry),
        entry.calories.to_string(),
        entry.protein.to_string(),
        entry.carbs.to_string(),
        entry.fat.to_string(),
        entry.fiber.to_string(),
        entry.feeling.clone().unwrap_or_default(),
        entry.energy_level.map(|e| e.to_string()).unwrap_or_default(),
        entry.comments.clone().unwrap_or_default(),
        entry.is_custom_meal.to_string(),
        entry.created_at.to_rfc3339(),
    ]
}

/// Convert diet entries to CSV, one row per entry, with a header row.
///
/// Fields containing commas, quotes or newlines are quoted.
pub fn to_csv(entries: &[DietEntry]) -> String {
    let mut csv_content = CSV_HEADER.join(",");
    csv_content.push('\n');

    for entry in entries {
        for (i, value) in row(entry).iter().enumerate() {
            if i > 0 {
                csv_content.push(',');
            }
            push_field(&mut csv_content, value);
        }
        csv_content.push('\n');
    }

    csv_content
}

/// Convert diet entries to an XLSX workbook using rust_xlsxwriter.
///
/// Numeric columns are written as numbers so they can be summed in a spreadsheet.
pub fn to_xlsx(entries: &[DietEntry]) -> Result<Vec<u8>, Box<dyn Error>> {
    use rust_xlsxwriter::{Format, Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name("Diet")?;

    let bold = Format::new().set_bold();
    for (col, title) in CSV_HEADER.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &bold)?;
    }

    for (r, entry) in entries.iter().enumerate() {
        let r = (r + 1) as u32;
        for (col, value) in row(entry).iter().enumerate() {
            let col = col as u16;
            match col {
                4..=8 => {
                    worksheet.write_number(r, col, value.parse::<f64>().unwrap_or(0.0))?;
                }
                _ => {
                    worksheet.write_string(r, col, value)?;
                }
            }
        }
    }

    workbook.push_worksheet(worksheet);
    let buffer = workbook.save_to_buffer()?;

    Ok(buffer)
}

pub fn export_archive(archive: &UserArchive) -> std::io::Result<Vec<u8>> {
    let bytes = serialize(archive)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    encoder.finish()
}

pub fn import_archive(data: &[u8]) -> std::io::Result<UserArchive> {
    let mut decoder = GzDecoder::new(data);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;

    let archive: UserArchive = deserialize(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if archive.version != ARCHIVE_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported archive version {}", archive.version),
        ));
    }
    Ok(archive)
}

/// Replaces the user's diet and water logs with the archive contents.
///
/// Entries are re-owned by `username`, so an archive taken from one account
/// can be restored into another. Every record gets a fresh id.
///
/// # Arguments
/// * `store` - Data directory to write into
/// * `username` - Account that receives the restored logs
/// * `archive` - Decoded archive, see [`import_archive`]
///
/// # Errors
/// * `BadRequest` on the first diet entry that breaks the meal rules, or on
///   a water day with an out-of-range goal or a repeated date. Nothing is
///   written in that case.
pub fn restore_archive(
    store: &Store,
    username: &str,
    archive: UserArchive,
) -> Result<ImportSummary, AppError> {
    let UserArchive {
        mut diet,
        mut water,
        ..
    } = archive;

    for entry in &diet {
        validate_entry(entry)?;
    }
    let mut dates = HashSet::new();
    for day in &water {
        if !(1..=MAX_GOAL).contains(&day.goal) {
            return Err(AppError::bad_request(format!(
                "Water goal for {} must be between 1 and {MAX_GOAL}",
                day.date
            )));
        }
        if !dates.insert(day.date) {
            return Err(AppError::bad_request(format!(
                "Water day {} appears more than once",
                day.date
            )));
        }
    }

    for entry in diet.iter_mut() {
        entry.id = Uuid::new_v4();
        entry.owner = username.to_string();
    }
    for day in water.iter_mut() {
        day.id = Uuid::new_v4();
    }

    let summary = ImportSummary {
        diet_entries: diet.len(),
        water_days: water.len(),
    };
    store.write(&Store::user_file(username, DIET_FILE), &diet)?;
    store.write(&Store::user_file(username, WATER_FILE), &water)?;

    info!(
        "{} restored {} diet entries and {} water days",
        username, summary.diet_entries, summary.water_days
    );
    Ok(summary)
}

fn attachment(content_type: &'static str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

pub async fn handle_export(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, AppError> {
    let entries = list_entries(&state.store, &user.username, &DietQuery::default())?;

    match query.format.as_deref().unwrap_or("csv") {
        "csv" => Ok(attachment(
            "text/csv",
            "diet.csv",
            to_csv(&entries).into_bytes(),
        )),
        "xlsx" => {
            let data = to_xlsx(&entries)
                .map_err(|e| AppError::internal(format!("Failed to build workbook: {e}")))?;
            Ok(attachment(
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                "diet.xlsx",
                data,
            ))
        }
        other => Err(AppError::bad_request(format!(
            "Unsupported export format: {other}"
        ))),
    }
}

pub async fn handle_archive_download(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Response, AppError> {
    let archive = UserArchive {
        version: ARCHIVE_VERSION,
        username: user.username.clone(),
        exported_at: Utc::now(),
        diet: list_entries(&state.store, &user.username, &DietQuery::default())?,
        water: records(&state.store, &user.username)?,
    };

    let data = export_archive(&archive)?;
    Ok(attachment(
        "application/gzip",
        &format!("{}-archive.bin.gz", user.username),
        data,
    ))
}

pub async fn handle_archive_upload(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<Json<ImportSummary>, AppError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(AppError::bad_request)? {
        if field.name() == Some("archive") {
            upload = Some(field.bytes().await.map_err(AppError::bad_request)?);
            break;
        }
    }

    let data = upload.ok_or_else(|| AppError::bad_request("Missing archive field"))?;
    let archive = import_archive(&data)
        .map_err(|e| AppError::bad_request(format!("Invalid archive: {e}")))?;

    Ok(Json(restore_archive(&state.store, &user.username, archive)?))
}
