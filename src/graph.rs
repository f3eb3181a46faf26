use std::io::Cursor;
use std::sync::Arc;

use axum::{
    Extension,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use chrono::{NaiveDate, Utc};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use plotters::prelude::*;

use crate::app::AppState;
use crate::diet::{AnalyticsQuery, DietAnalytics, DietQuery, compute_analytics, list_entries};
use crate::error::AppError;
use crate::extract::Query;
use crate::login::CurrentUser;
use crate::water::{WaterDay, records};

/// Available chart types
#[derive(Clone, Debug)]
pub enum GraphType {
    /// Connected points, for trends
    Line,

    /// One bar per day, for counts
    Bar,
}

/// Configuration options for chart generation
#[derive(Clone, Debug)]
pub struct GraphOptions {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub width: u32,
    pub height: u32,
    pub graph_type: GraphType,
    /// Optional horizontal reference line, e.g. the daily water goal
    pub target: Option<f64>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            title: "Graph".to_string(),
            x_label: "Day".to_string(),
            y_label: "Value".to_string(),
            width: 800,
            height: 600,
            graph_type: GraphType::Line,
            target: None,
        }
    }
}

/// Calories per day for every day of the analytics window.
pub fn calorie_series(analytics: &DietAnalytics) -> Vec<(NaiveDate, f64)> {
    analytics
        .daily
        .iter()
        .map(|day| (day.date, day.nutrition.calories))
        .collect()
}

/// Glasses per day for the `window` days ending at `end`, missing days as zero.
pub fn water_series(days: &[WaterDay], end: NaiveDate, window: u32) -> Vec<(NaiveDate, f64)> {
    let start = end - chrono::Duration::days(i64::from(window.max(1)) - 1);

    start
        .iter_days()
        .take(window.max(1) as usize)
        .map(|date| {
            let glasses = days
                .iter()
                .find(|d| d.date == date)
                .map(|d| d.glasses)
                .unwrap_or(0);
            (date, f64::from(glasses))
        })
        .collect()
}

/// Renders a daily series to PNG bytes.
///
/// # Errors
/// * Returns an error if drawing fails (for example when no font is available)
pub fn render_chart(
    data: &[(NaiveDate, f64)],
    options: &GraphOptions,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let (width, height) = (options.width, options.height);
    let mut buffer = vec![0u8; (width * height * 3) as usize];

    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE)?;

        let labels: Vec<String> = data
            .iter()
            .map(|(date, _)| date.format("%m-%d").to_string())
            .collect();
        let max_y = data
            .iter()
            .map(|(_, y)| *y)
            .chain(options.target)
            .fold(0.0_f64, f64::max);
        let y_range = 0.0..(max_y * 1.1).max(1.0);
        let x_range = 0..data.len().max(1) as i32;

        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 30).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(x_range, y_range)?;

        chart
            .configure_mesh()
            .x_desc(&options.x_label)
            .y_desc(&options.y_label)
            .x_label_formatter(&|x| labels.get(*x as usize).cloned().unwrap_or_default())
            .draw()?;

        match options.graph_type {
            GraphType::Line => {
                chart.draw_series(LineSeries::new(
                    data.iter().enumerate().map(|(i, (_, y))| (i as i32, *y)),
                    &BLUE,
                ))?;
            }
            GraphType::Bar => {
                chart.draw_series(data.iter().enumerate().map(|(i, (_, y))| {
                    let mut bar =
                        Rectangle::new([(i as i32, 0.0), (i as i32 + 1, *y)], BLUE.filled());
                    bar.set_margin(0, 0, 4, 4);
                    bar
                }))?;
            }
        }

        if let Some(target) = options.target {
            chart.draw_series(LineSeries::new(
                [(0, target), (data.len() as i32, target)],
                &RED,
            ))?;
        }

        root.present()?;
    }

    let image = RgbImage::from_raw(width, height, buffer).ok_or("chart buffer size mismatch")?;
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut png, ImageOutputFormat::Png)?;

    Ok(png.into_inner())
}

fn png_response(result: Result<Vec<u8>, Box<dyn std::error::Error>>) -> Result<Response, AppError> {
    let png = result.map_err(|e| AppError::internal(format!("Failed to render chart: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

pub async fn handle_diet_chart(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Response, AppError> {
    let days = query.days()?;
    let entries = list_entries(&state.store, &user.username, &DietQuery::default())?;
    let analytics = compute_analytics(&entries, Utc::now().date_naive(), days);

    let options = GraphOptions {
        title: format!("Calories, last {days} days"),
        y_label: "kcal".to_string(),
        ..Default::default()
    };
    png_response(render_chart(&calorie_series(&analytics), &options))
}

pub async fn handle_water_chart(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Response, AppError> {
    let days = query.days()?;
    let today = Utc::now().date_naive();
    let history = records(&state.store, &user.username)?;
    let goal = history
        .iter()
        .max_by_key(|d| d.date)
        .map(|d| d.goal)
        .unwrap_or(state.config.default_water_goal);

    let options = GraphOptions {
        title: format!("Water intake, last {days} days"),
        y_label: "glasses".to_string(),
        graph_type: GraphType::Bar,
        target: Some(f64::from(goal)),
        ..Default::default()
    };
    png_response(render_chart(&water_series(&history, today, days), &options))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn water_series_fills_missing_days() {
        let end = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let days = vec![WaterDay {
            id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
            glasses: 6,
            goal: 8,
            updated_at: Utc::now(),
        }];

        let series = water_series(&days, end, 3);
        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0.0, 6.0, 0.0]);
        assert_eq!(series[0].0, NaiveDate::from_ymd_opt(2025, 1, 8).unwrap());
    }

    #[test]
    fn calorie_series_follows_analytics_window() {
        let end = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let analytics = compute_analytics(&[], end, 5);
        let series = calorie_series(&analytics);

        assert_eq!(series.len(), 5);
        assert_eq!(series.last().unwrap().0, end);
        assert!(series.iter().all(|(_, v)| *v == 0.0));
    }
}
