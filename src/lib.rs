/*!
# Nutrilog

A diet and hydration tracking service with a JSON API, built in Rust.

## Overview

Users log meals (from the product catalog or as custom meals), track glasses of
water against a daily goal and work through quizzes an administrator has queued
for them. Meal nutrition is filled in automatically: a photo can be sent to a
remote analyzer, and when that is unavailable a keyword heuristic estimates the
values instead.

## Architecture

### HTTP Layer
- **Technologies**: axum, tower-http (tracing, CORS)
- Session cookie or bearer token authentication middleware
- JSON error bodies of the form `{"message": ...}`

### Domain Layer
- **Diet log** - Entries per user with date range and meal type filters, analytics
- **Nutrition** - Keyword estimator, image compression, remote analyzer with fallback
- **Catalog** - Products and nested collections, optionally gated by an access code
- **Water** - One record per user and day, goals, streaks
- **Quizzes** - First-in first-out queue of pending quizzes per user

### Data Persistence Layer
- JSON files under `DATA_DIR`, written atomically
- Gzip compressed bincode archives of a user's logs
- CSV and XLSX export, PNG charts

## Modules

- **config**: Environment configuration
- **error**: Application error type and its HTTP mapping
- **extract**: JSON, query and path extractors that reject with `AppError`
- **store**: JSON file store
- **login**: User accounts, sessions and password management
- **mailer**: Password reset email
- **quiz**: Quiz definitions and the per-user queue
- **nutrition**: Estimation heuristic and image analysis pipeline
- **catalog**: Products, collections and access grants
- **diet**: Diet log and analytics
- **water**: Water intake tracking
- **graph**: Chart rendering
- **downloader**: Exports and archives
- **app**: Shared state, routing and server startup
*/

pub mod app;
pub mod catalog;
pub mod config;
pub mod diet;
pub mod downloader;
pub mod error;
pub mod extract;
pub mod graph;
pub mod login;
pub mod mailer;
pub mod nutrition;
pub mod quiz;
pub mod store;
pub mod water;

pub use app::{AppState, router};
pub use config::Config;
pub use error::AppError;
pub use store::Store;
