use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Extension,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::AppError;
use crate::extract::{Json, Path};
use crate::mailer::{Mailer, generate_reset_code};
use crate::quiz::QuizResult;
use crate::store::{Store, USERS_FILE};

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session";

const RESET_CODE_TTL_SECS: i64 = 60 * 60;

/// Access level of an account.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// User data structure representing a registered application user
///
/// Besides credentials it carries the per-account feature flags and the FIFO
/// queue of quizzes the user still has to take.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Username (unique identifier for the user)
    pub username: String,

    /// Email address (used for password recovery)
    pub email: String,

    /// Argon2 hash of the user's password
    pub password_hash: String,

    #[serde(default)]
    pub role: Role,

    /// Feature flags toggled by administrators
    #[serde(default)]
    pub features: BTreeMap<String, bool>,

    /// Quizzes waiting to be taken, front first
    #[serde(default)]
    pub pending_quizzes: VecDeque<Uuid>,

    #[serde(default)]
    pub quiz_results: Vec<QuizResult>,

    /// Password reset code (if a reset has been requested)
    #[serde(default)]
    pub reset_code: Option<String>,

    /// Expiration time for the reset code
    #[serde(default)]
    pub reset_code_expires: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// Public view of a [`User`], without secrets.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub features: BTreeMap<String, bool>,
    pub pending_quizzes: usize,
    pub quiz_results: Vec<QuizResult>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for Profile {
    fn from(user: &User) -> Self {
        Self {
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            features: user.features.clone(),
            pending_quizzes: user.pending_quizzes.len(),
            quiz_results: user.quiz_results.clone(),
            created_at: user.created_at,
        }
    }
}

/// Credential data for login and registration
#[derive(Debug, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,

    /// Email address (optional for login, required for registration)
    #[serde(default)]
    pub email: String,

    /// Password in plaintext (only transmitted, never stored)
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetConfirm {
    pub email: String,
    pub reset_code: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangeRequest {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: Profile,
}

#[derive(Debug, Deserialize)]
pub struct FeatureUpdate {
    pub features: BTreeMap<String, bool>,
}

/// User session data
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub expires_at: SystemTime,
}

/// Authenticated caller, inserted into request extensions by [`require_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub username: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("Administrator access required"))
        }
    }
}

lazy_static! {
    /// Active sessions keyed by session id.
    static ref SESSIONS: RwLock<HashMap<String, Session>> = RwLock::new(HashMap::new());
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_]{3,32}$").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub fn get_users(store: &Store) -> Result<HashMap<String, User>, AppError> {
    store.read(USERS_FILE)
}

pub fn get_user(store: &Store, username: &str) -> Result<User, AppError> {
    get_users(store)?
        .remove(username)
        .ok_or(AppError::NotFound("User"))
}

/// Applies `f` to one user record and saves the result.
pub fn update_user<R>(
    store: &Store,
    username: &str,
    f: impl FnOnce(&mut User) -> Result<R, AppError>,
) -> Result<R, AppError> {
    store.update(USERS_FILE, |users: &mut HashMap<String, User>| {
        let user = users.get_mut(username).ok_or(AppError::NotFound("User"))?;
        f(user)
    })
}

/// Register a new user
///
/// Creates a new account with a hashed password. Usernames double as directory
/// names in the store, so they are restricted to `[A-Za-z0-9_]{3,32}`.
///
/// # Errors
/// * `BadRequest` if a field is empty or malformed
/// * `Conflict` if the username or email is already in use
pub fn register_user(
    store: &Store,
    username: &str,
    email: &str,
    password: &str,
    role: Role,
) -> Result<User, AppError> {
    if username.is_empty() || password.is_empty() || email.is_empty() {
        return Err(AppError::bad_request(
            "Username, email and password cannot be empty",
        ));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(AppError::bad_request(
            "Username must be 3-32 letters, digits or underscores",
        ));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(AppError::bad_request("Invalid email address"));
    }

    let password_hash = hash_password(password)?;

    let user = store.update(USERS_FILE, |users: &mut HashMap<String, User>| {
        if users.contains_key(username) {
            return Err(AppError::Conflict("Username already exists".to_string()));
        }
        if users.values().any(|user| user.email.eq_ignore_ascii_case(email)) {
            return Err(AppError::Conflict(
                "Email address is already registered".to_string(),
            ));
        }

        let user = User {
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            role,
            features: BTreeMap::new(),
            pending_quizzes: VecDeque::new(),
            quiz_results: Vec::new(),
            reset_code: None,
            reset_code_expires: None,
            created_at: Utc::now(),
        };
        users.insert(username.to_string(), user.clone());
        Ok(user)
    })?;

    info!("Registered user {username}");
    Ok(user)
}

/// Returns the user when the credentials match, `None` otherwise.
pub fn verify_user(store: &Store, username: &str, password: &str) -> Result<Option<User>, AppError> {
    let users = get_users(store)?;

    match users.get(username) {
        Some(user) if verify_password(password, &user.password_hash)? => Ok(Some(user.clone())),
        _ => Ok(None),
    }
}

/// Hash a secret using Argon2id with a random salt.
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AppError::internal("Password hashing failed"))
}

/// Check a plaintext secret against a stored Argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|_| AppError::internal("Invalid password hash format"))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Create a new session and return its id.
pub fn create_session(username: &str, role: Role, ttl_secs: u64) -> String {
    let session_id = Uuid::new_v4().to_string();
    let session = Session {
        user_id: username.to_string(),
        role,
        expires_at: SystemTime::now() + Duration::from_secs(ttl_secs),
    };

    if let Ok(mut sessions) = SESSIONS.write() {
        sessions.retain(|_, s| s.expires_at > SystemTime::now());
        sessions.insert(session_id.clone(), session);
    }

    session_id
}

/// Checks that a session exists and has not expired.
pub fn validate_session(session_id: &str) -> Option<CurrentUser> {
    let sessions = SESSIONS.read().ok()?;

    sessions
        .get(session_id)
        .filter(|session| session.expires_at > SystemTime::now())
        .map(|session| CurrentUser {
            username: session.user_id.clone(),
            role: session.role,
        })
}

pub fn end_session(session_id: &str) {
    if let Ok(mut sessions) = SESSIONS.write() {
        sessions.remove(session_id);
    }
}

/// Generates a reset code for the account owning `email` and stores it with a
/// one hour expiry.
///
/// # Returns
/// The username and the code, for the reset mail.
///
/// # Errors
/// * `NotFound` if no account uses `email`
pub fn request_password_reset(store: &Store, email: &str) -> Result<(String, String), AppError> {
    store.update(USERS_FILE, |users: &mut HashMap<String, User>| {
        let user = users
            .values_mut()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .ok_or(AppError::NotFound("Email"))?;

        let code = generate_reset_code();
        user.reset_code = Some(code.clone());
        user.reset_code_expires = Some(Utc::now() + chrono::Duration::seconds(RESET_CODE_TTL_SECS));

        Ok((user.username.clone(), code))
    })
}

/// Sets a new password when `code` matches an unexpired reset code.
///
/// # Arguments
/// * `email` - Account email, compared case-insensitively
/// * `code` - Code from the reset mail
/// * `new_password` - Replacement password, hashed before storing
///
/// # Errors
/// * `NotFound` if no account uses `email`
/// * `BadRequest` if the password is empty or the code is missing, expired or wrong
pub fn reset_password(
    store: &Store,
    email: &str,
    code: &str,
    new_password: &str,
) -> Result<(), AppError> {
    if new_password.is_empty() {
        return Err(AppError::bad_request("Password cannot be empty"));
    }
    let hash = hash_password(new_password)?;

    store.update(USERS_FILE, |users: &mut HashMap<String, User>| {
        let user = users
            .values_mut()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .ok_or(AppError::NotFound("Email"))?;

        let (Some(stored), Some(expires)) = (&user.reset_code, user.reset_code_expires) else {
            return Err(AppError::bad_request("No reset code found"));
        };
        if Utc::now() > expires {
            return Err(AppError::bad_request("Reset code expired"));
        }
        if stored != code {
            return Err(AppError::bad_request("Invalid reset code"));
        }

        user.password_hash = hash;
        user.reset_code = None;
        user.reset_code_expires = None;
        Ok(())
    })
}

fn session_id_from(jar: &CookieJar, request: &axum::extract::Request) -> Option<String> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }

    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// Authentication middleware
///
/// Accepts the `session` cookie or an `Authorization: Bearer <session>` header
/// and inserts the [`CurrentUser`] into the request extensions.
pub async fn require_auth(
    jar: CookieJar,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    match session_id_from(&jar, &request).and_then(|id| validate_session(&id)) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => AppError::Unauthorized.into_response(),
    }
}

pub async fn handle_register(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<UserCredentials>,
) -> Result<Json<Profile>, AppError> {
    let user = register_user(
        &state.store,
        &credentials.username,
        &credentials.email,
        &credentials.password,
        Role::User,
    )?;

    Ok(Json(Profile::from(&user)))
}

/// Verifies credentials, opens a session and sets the session cookie.
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(credentials): Json<UserCredentials>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    let Some(user) = verify_user(&state.store, &credentials.username, &credentials.password)?
    else {
        warn!("Failed login for {}", credentials.username);
        return Err(AppError::BadRequest(
            "Invalid username or password".to_string(),
        ));
    };

    let token = create_session(&user.username, user.role, state.config.session_ttl_secs);
    let cookie = Cookie::build((SESSION_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .build();

    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            token,
            user: Profile::from(&user),
        }),
    ))
}

pub async fn handle_logout(jar: CookieJar) -> impl IntoResponse {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        end_session(cookie.value());
    }

    (
        jar.remove(Cookie::from(SESSION_COOKIE)),
        Json(serde_json::json!({ "message": "Logged out" })),
    )
}

pub async fn handle_me(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Profile>, AppError> {
    let user = get_user(&state.store, &current.username)?;
    Ok(Json(Profile::from(&user)))
}

/// Mails a reset code to the account's email address.
pub async fn handle_forgot_password(
    State(state): State<Arc<AppState>>,
    Json(reset_req): Json<PasswordResetRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let smtp = state
        .config
        .smtp
        .clone()
        .ok_or_else(|| AppError::internal("Mail delivery is not configured"))?;

    let (username, code) = request_password_reset(&state.store, &reset_req.email)?;
    let email = reset_req.email.clone();

    tokio::task::spawn_blocking(move || {
        Mailer::new(&smtp).and_then(|mailer| mailer.send_password_reset(&email, &code))
    })
    .await
    .map_err(AppError::internal)?
    .map_err(|e| {
        warn!("Failed to send reset mail for {username}: {e}");
        AppError::internal("Failed to send email")
    })?;

    Ok(Json(serde_json::json!({ "message": "Reset code sent" })))
}

pub async fn handle_reset_password(
    State(state): State<Arc<AppState>>,
    Json(reset_confirm): Json<PasswordResetConfirm>,
) -> Result<Json<serde_json::Value>, AppError> {
    reset_password(
        &state.store,
        &reset_confirm.email,
        &reset_confirm.reset_code,
        &reset_confirm.new_password,
    )?;

    Ok(Json(serde_json::json!({ "message": "Password reset successful" })))
}

pub async fn handle_change_password(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(change_req): Json<PasswordChangeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if change_req.new_password != change_req.confirm_password {
        return Err(AppError::bad_request("New passwords don't match"));
    }
    if change_req.new_password.is_empty() {
        return Err(AppError::bad_request("Password cannot be empty"));
    }

    let user = get_user(&state.store, &current.username)?;
    if !verify_password(&change_req.old_password, &user.password_hash)? {
        return Err(AppError::bad_request("Invalid old password"));
    }

    let hash = hash_password(&change_req.new_password)?;
    update_user(&state.store, &current.username, |user| {
        user.password_hash = hash;
        Ok(())
    })?;

    Ok(Json(serde_json::json!({ "message": "Password changed successfully" })))
}

/// Merges feature flags into a user's profile. Administrators only.
pub async fn handle_set_features(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(username): Path<String>,
    Json(update): Json<FeatureUpdate>,
) -> Result<Json<Profile>, AppError> {
    current.require_admin()?;

    let profile = update_user(&state.store, &username, |user| {
        user.features.extend(update.features);
        Ok(Profile::from(&*user))
    })?;

    Ok(Json(profile))
}
