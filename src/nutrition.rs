//! # Nutrition
//!
//! Two ways of putting numbers on a meal.
//!
//! ## Estimation
//! A keyword table of common foods with per-100 g macro profiles. The meal
//! name and description are lower-cased and scanned for every keyword; the
//! matching entry with the highest confidence wins, earlier entries win ties.
//! The profile is scaled to a 200 g serving and by a meal type multiplier
//! (breakfast 0.8, lunch 1.0, dinner 1.2, snack 0.5).
//!
//! ## Photo analysis
//! ```text
//! image (URL | data URL | base64)
//!   -> bytes (fetched or decoded)
//!   -> recompressed if over IMAGE_COMPRESS_THRESHOLD
//!   -> rejected if still over IMAGE_MAX_BYTES
//!   -> remote analyzer
//! any failure -> estimation
//! ```
//! A single linear attempt, no retries.
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{ColorType, DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::app::AppState;
use crate::config::Config;
use crate::error::AppError;
use crate::extract::Json;

/// Grams assumed for one estimated serving.
pub const SERVING_GRAMS: f64 = 200.0;

/// Confidence reported when no keyword matched.
pub const DEFAULT_CONFIDENCE: u8 = 40;

/// Confidence reported for analyzer results that do not carry one.
const ANALYZER_CONFIDENCE: u8 = 85;

/// Longest edge after the first recompression pass.
const MAX_IMAGE_EDGE: u32 = 1024;

const JPEG_QUALITIES: [u8; 3] = [80, 65, 50];

const DOWNSCALE_ROUNDS: usize = 3;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub const ALL: [MealType; 4] = [
        MealType::Breakfast,
        MealType::Lunch,
        MealType::Dinner,
        MealType::Snack,
    ];

    pub fn multiplier(self) -> f64 {
        match self {
            MealType::Breakfast => 0.8,
            MealType::Lunch => 1.0,
            MealType::Dinner => 1.2,
            MealType::Snack => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
            MealType::Dinner => "dinner",
            MealType::Snack => "snack",
        }
    }
}

/// Macro breakdown. Calories in kcal, everything else in grams.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Nutrition {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub fiber: f64,
}

impl Nutrition {
    pub const fn new(calories: f64, protein: f64, carbs: f64, fat: f64, fiber: f64) -> Self {
        Self {
            calories,
            protein,
            carbs,
            fat,
            fiber,
        }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            calories: self.calories * factor,
            protein: self.protein * factor,
            carbs: self.carbs * factor,
            fat: self.fat * factor,
            fiber: self.fiber * factor,
        }
    }

    /// Whole calories, macros to one decimal.
    pub fn rounded(self) -> Self {
        Self {
            calories: self.calories.round(),
            protein: round1(self.protein),
            carbs: round1(self.carbs),
            fat: round1(self.fat),
            fiber: round1(self.fiber),
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.calories, self.protein, self.carbs, self.fat, self.fiber]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

impl std::ops::Add for Nutrition {
    type Output = Nutrition;

    fn add(self, other: Nutrition) -> Nutrition {
        Nutrition {
            calories: self.calories + other.calories,
            protein: self.protein + other.protein,
            carbs: self.carbs + other.carbs,
            fat: self.fat + other.fat,
            fiber: self.fiber + other.fiber,
        }
    }
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

struct FoodProfile {
    keyword: &'static str,
    per_100g: Nutrition,
    confidence: u8,
}

const fn food(
    keyword: &'static str,
    calories: f64,
    protein: f64,
    carbs: f64,
    fat: f64,
    fiber: f64,
    confidence: u8,
) -> FoodProfile {
    FoodProfile {
        keyword,
        per_100g: Nutrition::new(calories, protein, carbs, fat, fiber),
        confidence,
    }
}

const DEFAULT_PROFILE: Nutrition = Nutrition::new(150.0, 8.0, 18.0, 6.0, 2.0);

#[rustfmt::skip]
const FOOD_TABLE: &[FoodProfile] = &[
    food("chicken breast", 165.0, 31.0,  0.0,  3.6,  0.0, 90),
    food("chicken",        239.0, 27.0,  0.0, 14.0,  0.0, 80),
    food("salmon",         208.0, 20.0,  0.0, 13.0,  0.0, 85),
    food("tuna",           132.0, 28.0,  0.0,  1.3,  0.0, 85),
    food("beef",           250.0, 26.0,  0.0, 15.0,  0.0, 80),
    food("pork",           242.0, 27.0,  0.0, 14.0,  0.0, 75),
    food("egg",            155.0, 13.0,  1.1, 11.0,  0.0, 85),
    food("tofu",            76.0,  8.0,  1.9,  4.8,  0.3, 80),
    food("lentil",         116.0,  9.0, 20.0,  0.4,  7.9, 85),
    food("beans",          127.0,  8.7, 22.8,  0.5,  6.4, 80),
    food("rice",           130.0,  2.7, 28.0,  0.3,  0.4, 80),
    food("pasta",          131.0,  5.0, 25.0,  1.1,  1.8, 80),
    food("bread",          265.0,  9.0, 49.0,  3.2,  2.7, 75),
    food("oatmeal",         68.0,  2.4, 12.0,  1.4,  1.7, 85),
    food("quinoa",         120.0,  4.4, 21.0,  1.9,  2.8, 85),
    food("potato",          77.0,  2.0, 17.0,  0.1,  2.2, 75),
    food("fries",          312.0,  3.4, 41.0, 15.0,  3.8, 75),
    food("salad",           20.0,  1.5,  3.6,  0.2,  1.8, 70),
    food("broccoli",        34.0,  2.8,  7.0,  0.4,  2.6, 85),
    food("spinach",         23.0,  2.9,  3.6,  0.4,  2.2, 85),
    food("avocado",        160.0,  2.0,  8.5, 14.7,  6.7, 85),
    food("banana",          89.0,  1.1, 23.0,  0.3,  2.6, 90),
    food("apple",           52.0,  0.3, 14.0,  0.2,  2.4, 90),
    food("berries",         57.0,  0.7, 14.0,  0.3,  2.4, 80),
    food("yogurt",          59.0, 10.0,  3.6,  0.4,  0.0, 80),
    food("cheese",         402.0, 25.0,  1.3, 33.0,  0.0, 75),
    food("milk",            42.0,  3.4,  5.0,  1.0,  0.0, 80),
    food("almond",         579.0, 21.0, 22.0, 50.0, 12.5, 80),
    food("nuts",           607.0, 20.0, 21.0, 54.0,  7.0, 70),
    food("protein shake",   80.0, 12.0,  5.0,  1.5,  0.5, 75),
    food("smoothie",        60.0,  1.5, 12.0,  0.8,  1.5, 60),
    food("pizza",          266.0, 11.0, 33.0, 10.0,  2.3, 70),
    food("burger",         295.0, 17.0, 24.0, 14.0,  1.3, 70),
    food("sandwich",       250.0, 11.0, 30.0,  9.0,  2.5, 60),
    food("soup",            50.0,  2.5,  6.0,  1.5,  1.0, 55),
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Estimate {
    #[serde(flatten)]
    pub nutrition: Nutrition,
    pub confidence: u8,
    pub matched: Option<String>,
    pub suggestion: String,
}

/// Keyword-table estimate for one serving of a meal.
pub fn estimate_nutrition(name: &str, meal_type: MealType, description: Option<&str>) -> Estimate {
    let text = format!("{} {}", name, description.unwrap_or("")).to_lowercase();

    // strict comparison keeps the first entry on ties
    let best = FOOD_TABLE
        .iter()
        .filter(|profile| text.contains(profile.keyword))
        .fold(None::<&FoodProfile>, |best, profile| match best {
            Some(b) if b.confidence >= profile.confidence => Some(b),
            _ => Some(profile),
        });

    let (per_100g, confidence, matched) = match best {
        Some(profile) => (profile.per_100g, profile.confidence, Some(profile.keyword)),
        None => (DEFAULT_PROFILE, DEFAULT_CONFIDENCE, None),
    };

    let factor = SERVING_GRAMS / 100.0 * meal_type.multiplier();
    let nutrition = per_100g.scaled(factor).rounded();

    let suggestion = match matched {
        Some(keyword) => format!(
            "Estimated from \"{}\" for a {}g {} serving. Adjust the values if your portion differs.",
            keyword,
            SERVING_GRAMS,
            meal_type.as_str()
        ),
        None => format!(
            "No known food recognised, using a generic {}g {} estimate. Please review the values.",
            SERVING_GRAMS,
            meal_type.as_str()
        ),
    };

    Estimate {
        nutrition,
        confidence,
        matched: matched.map(str::to_string),
        suggestion,
    }
}

/// Why the photo analysis did not produce a result.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("no nutrition analyzer configured")]
    NoAnalyzer,

    #[error("could not read image: {0}")]
    InvalidImage(String),

    #[error("could not fetch image: {0}")]
    Fetch(String),

    #[error("image too large ({0} bytes)")]
    TooLarge(usize),

    #[error("analyzer failed: {0}")]
    Analyzer(String),
}

/// Where the image bytes come from.
#[derive(Debug, PartialEq)]
pub enum ImageSource {
    Remote(String),
    Inline(Vec<u8>),
}

/// Accepts an http(s) URL, a `data:<mime>;base64,` URL or bare base64.
pub fn parse_image_source(raw: &str) -> Result<ImageSource, AnalysisError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AnalysisError::InvalidImage("empty image".to_string()));
    }

    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(ImageSource::Remote(raw.to_string()));
    }

    let payload = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| AnalysisError::InvalidImage("malformed data URL".to_string()))?;
            if !header.ends_with(";base64") {
                return Err(AnalysisError::InvalidImage(
                    "data URL is not base64 encoded".to_string(),
                ));
            }
            data
        }
        None => raw,
    };

    STANDARD
        .decode(payload)
        .map(ImageSource::Inline)
        .map_err(|e| AnalysisError::InvalidImage(e.to_string()))
}

/// Downloads a remote meal photo.
///
/// # Arguments
/// * `client` - Shared HTTP client, its timeout bounds the whole download
/// * `url` - Image location
/// * `max_bytes` - Largest body accepted, checked against `Content-Length`
///   and again while streaming
///
/// # Errors
/// * `Fetch` on connection failures and non-success statuses
/// * `TooLarge` once the body exceeds `max_bytes`
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, AnalysisError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AnalysisError::Fetch(e.to_string()))?;

    if let Some(length) = response.content_length() {
        let length = usize::try_from(length).unwrap_or(usize::MAX);
        if length > max_bytes {
            return Err(AnalysisError::TooLarge(length));
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| AnalysisError::Fetch(e.to_string()))?
    {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(AnalysisError::TooLarge(bytes.len() + chunk.len()));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ColorType::Rgb8,
    )?;
    Ok(buffer.into_inner())
}

/// Shrinks an image until it fits under `threshold` bytes.
///
/// Images already under the threshold are returned untouched. Otherwise the
/// image is bounded to [`MAX_IMAGE_EDGE`] and re-encoded as JPEG at falling
/// qualities, halving its dimensions between rounds. When nothing fits, the
/// smallest attempt is returned and the caller decides whether it is usable.
pub fn compress_image(bytes: &[u8], threshold: usize) -> Result<Vec<u8>, image::ImageError> {
    if bytes.len() <= threshold {
        return Ok(bytes.to_vec());
    }

    let mut image = image::load_from_memory(bytes)?;
    if image.width().max(image.height()) > MAX_IMAGE_EDGE {
        image = image.resize(MAX_IMAGE_EDGE, MAX_IMAGE_EDGE, FilterType::Triangle);
    }

    let mut smallest = bytes.to_vec();
    for _ in 0..DOWNSCALE_ROUNDS {
        for quality in JPEG_QUALITIES {
            let encoded = encode_jpeg(&image, quality)?;
            if encoded.len() <= threshold {
                return Ok(encoded);
            }
            if encoded.len() < smallest.len() {
                smallest = encoded;
            }
        }

        let (width, height) = ((image.width() / 2).max(1), (image.height() / 2).max(1));
        image = image.resize(width, height, FilterType::Triangle);
    }

    Ok(smallest)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerRequest {
    /// Base64 encoded image bytes
    pub image: String,
    pub meal_name: String,
    pub meal_type: MealType,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzerResponse {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    #[serde(default)]
    pub fiber: f64,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Remote photo-to-nutrition service.
#[async_trait]
pub trait NutritionAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalyzerRequest) -> Result<AnalyzerResponse, AnalysisError>;
}

/// JSON-over-HTTP analyzer at `NUTRITION_API_URL`.
pub struct RemoteAnalyzer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl RemoteAnalyzer {
    pub fn new(client: reqwest::Client, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl NutritionAnalyzer for RemoteAnalyzer {
    async fn analyze(&self, request: &AnalyzerRequest) -> Result<AnalyzerResponse, AnalysisError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AnalysisError::Analyzer(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Analyzer(format!("{status}: {body}")));
        }

        response
            .json::<AnalyzerResponse>()
            .await
            .map_err(|e| AnalysisError::Analyzer(e.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Ai,
    Estimate,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub source: AnalysisSource,
    pub nutrition: Nutrition,
    pub confidence: u8,
    pub suggestion: String,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub meal_name: String,
    pub meal_type: MealType,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub image: String,
    pub meal_name: String,
    pub meal_type: MealType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Remote photos may be recompressed below `image_max_bytes`, so downloads
/// get more headroom than the final upload.
fn download_limit(config: &Config) -> usize {
    config.image_max_bytes.saturating_mul(4)
}

async fn analyze_with_ai(
    http: &reqwest::Client,
    analyzer: Option<&dyn NutritionAnalyzer>,
    config: &Config,
    request: &AnalyzeRequest,
) -> Result<Analysis, AnalysisError> {
    let analyzer = analyzer.ok_or(AnalysisError::NoAnalyzer)?;

    let bytes = match parse_image_source(&request.image)? {
        ImageSource::Remote(url) => fetch_image(http, &url, download_limit(config)).await?,
        ImageSource::Inline(bytes) => bytes,
    };

    let original = bytes.len();
    let bytes = if original > config.image_compress_threshold {
        let threshold = config.image_compress_threshold;
        let compressed = tokio::task::spawn_blocking(move || compress_image(&bytes, threshold))
            .await
            .map_err(|e| AnalysisError::InvalidImage(e.to_string()))?
            .map_err(|e| AnalysisError::InvalidImage(e.to_string()))?;
        info!("Compressed meal image from {original} to {} bytes", compressed.len());
        compressed
    } else {
        bytes
    };

    if bytes.len() > config.image_max_bytes {
        return Err(AnalysisError::TooLarge(bytes.len()));
    }

    let response = analyzer
        .analyze(&AnalyzerRequest {
            image: STANDARD.encode(&bytes),
            meal_name: request.meal_name.clone(),
            meal_type: request.meal_type,
            description: request.description.clone(),
        })
        .await?;

    let nutrition = Nutrition::new(
        response.calories,
        response.protein,
        response.carbs,
        response.fat,
        response.fiber,
    );
    if !nutrition.is_valid() {
        return Err(AnalysisError::Analyzer(
            "analyzer returned invalid values".to_string(),
        ));
    }

    Ok(Analysis {
        source: AnalysisSource::Ai,
        nutrition: nutrition.rounded(),
        confidence: response.confidence.unwrap_or(ANALYZER_CONFIDENCE).min(100),
        suggestion: response
            .description
            .unwrap_or_else(|| "Analyzed from your meal photo.".to_string()),
        fallback_reason: None,
    })
}

/// Photo analysis, falling back to [`estimate_nutrition`] on any failure.
///
/// # Arguments
/// * `http` - Client used to download remote photos
/// * `analyzer` - Remote analyzer, `None` skips straight to estimation
/// * `config` - Compression threshold and size limits
/// * `request` - Photo plus the meal name and type used by the fallback
///
/// # Returns
/// An [`Analysis`] with `source` set to `ai` or `estimate`. Estimates carry
/// the failure in `fallbackReason`.
pub async fn analyze_meal(
    http: &reqwest::Client,
    analyzer: Option<&dyn NutritionAnalyzer>,
    config: &Config,
    request: &AnalyzeRequest,
) -> Analysis {
    match analyze_with_ai(http, analyzer, config, request).await {
        Ok(analysis) => analysis,
        Err(reason) => {
            warn!("Meal analysis for \"{}\" fell back to estimation: {reason}", request.meal_name);

            let estimate = estimate_nutrition(
                &request.meal_name,
                request.meal_type,
                request.description.as_deref(),
            );
            Analysis {
                source: AnalysisSource::Estimate,
                nutrition: estimate.nutrition,
                confidence: estimate.confidence,
                suggestion: estimate.suggestion,
                fallback_reason: Some(reason.to_string()),
            }
        }
    }
}

pub async fn handle_estimate(Json(request): Json<EstimateRequest>) -> Json<Estimate> {
    Json(estimate_nutrition(
        &request.meal_name,
        request.meal_type,
        request.description.as_deref(),
    ))
}

pub async fn handle_analyze(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<Analysis>, AppError> {
    if request.image.trim().is_empty() {
        return Err(AppError::bad_request("An image is required"));
    }

    Ok(Json(
        analyze_meal(
            &state.http,
            state.analyzer.as_deref(),
            &state.config,
            &request,
        )
        .await,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_confidence_match() {
        let estimate = estimate_nutrition("Grilled chicken breast salad", MealType::Lunch, None);
        assert_eq!(estimate.matched.as_deref(), Some("chicken breast"));
        assert_eq!(estimate.confidence, 90);
        assert_eq!(estimate.nutrition, Nutrition::new(330.0, 62.0, 0.0, 7.2, 0.0));
    }

    #[test]
    fn ties_go_to_the_earlier_entry() {
        let estimate = estimate_nutrition("apple and banana", MealType::Snack, None);
        assert_eq!(estimate.matched.as_deref(), Some("banana"));
    }

    #[test]
    fn description_participates_in_matching() {
        let estimate = estimate_nutrition("Mum's special", MealType::Dinner, Some("Baked SALMON"));
        assert_eq!(estimate.matched.as_deref(), Some("salmon"));
    }

    #[test]
    fn unknown_meals_use_default_profile() {
        let estimate = estimate_nutrition("mystery bowl", MealType::Snack, None);
        assert_eq!(estimate.matched, None);
        assert_eq!(estimate.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(estimate.nutrition, Nutrition::new(150.0, 8.0, 18.0, 6.0, 2.0));
    }

    #[test]
    fn meal_type_scales_linearly() {
        let breakfast = estimate_nutrition("oatmeal", MealType::Breakfast, None);
        assert_eq!(breakfast.nutrition, Nutrition::new(109.0, 3.8, 19.2, 2.2, 2.7));

        let lunch = estimate_nutrition("chicken breast", MealType::Lunch, None).nutrition;
        let dinner = estimate_nutrition("chicken breast", MealType::Dinner, None).nutrition;
        assert_eq!(dinner.calories, (lunch.calories * 1.2).round());
        assert_eq!(dinner.fat, 8.6);
    }

    #[test]
    fn estimation_is_deterministic() {
        let a = estimate_nutrition("Beef burger with fries", MealType::Dinner, None);
        let b = estimate_nutrition("Beef burger with fries", MealType::Dinner, None);
        assert_eq!(a, b);
    }

    #[test]
    fn parses_image_sources() {
        assert_eq!(
            parse_image_source("https://res.cloudinary.com/x/meal.jpg").unwrap(),
            ImageSource::Remote("https://res.cloudinary.com/x/meal.jpg".to_string())
        );
        assert_eq!(
            parse_image_source("data:image/png;base64,AQID").unwrap(),
            ImageSource::Inline(vec![1, 2, 3])
        );
        assert_eq!(
            parse_image_source("AQID").unwrap(),
            ImageSource::Inline(vec![1, 2, 3])
        );
        assert!(parse_image_source("data:image/png,AQID").is_err());
        assert!(parse_image_source("   ").is_err());
        assert!(parse_image_source("not base64!").is_err());
    }

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let mut seed: u32 = 0x1234_5678;
        let img = image::RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [r, g, b, _] = seed.to_le_bytes();
            image::Rgb([r, g, b])
        });

        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn small_images_pass_through() {
        let png = noisy_png(8, 8);
        assert_eq!(compress_image(&png, png.len()).unwrap(), png);
    }

    #[test]
    fn large_images_are_recompressed_under_threshold() {
        let png = noisy_png(1200, 900);
        let threshold = 200_000;
        assert!(png.len() > threshold);

        let compressed = compress_image(&png, threshold).unwrap();
        assert!(compressed.len() <= threshold);

        let decoded = image::load_from_memory(&compressed).unwrap();
        assert!(decoded.width() <= MAX_IMAGE_EDGE);
    }

    #[test]
    fn rejects_undecodable_large_payloads() {
        let garbage = vec![0u8; 64];
        assert!(compress_image(&garbage, 16).is_err());
    }

    #[tokio::test]
    async fn downloads_stop_at_the_size_cap() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/small.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 16]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/huge.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let small = fetch_image(&client, &format!("{}/small.png", server.uri()), 1024)
            .await
            .unwrap();
        assert_eq!(small.len(), 16);

        let huge = fetch_image(&client, &format!("{}/huge.png", server.uri()), 1024).await;
        assert!(matches!(huge, Err(AnalysisError::TooLarge(n)) if n > 1024));

        let missing = fetch_image(&client, &format!("{}/gone.png", server.uri()), 1024).await;
        assert!(matches!(missing, Err(AnalysisError::Fetch(_))));
    }
}
