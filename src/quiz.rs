//! Quizzes and the per-user pending queue.
//!
//! Assignments are appended to the back of a user's queue and consumed strictly
//! from the front: a quiz can only be completed while it is the next one.
use std::collections::HashMap;
use std::sync::Arc;

use axum::{Extension, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::AppError;
use crate::extract::{Json, Path};
use crate::login::{CurrentUser, User, update_user};
use crate::store::{QUIZZES_FILE, Store, USERS_FILE};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub prompt: String,
    pub options: Vec<String>,
    pub answer_index: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub questions: Vec<Question>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub quiz_id: Uuid,
    pub score: usize,
    pub total: usize,
    pub completed_at: DateTime<Utc>,
}

/// A quiz as shown to the person taking it, answers stripped.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QuizView {
    pub id: Uuid,
    pub title: String,
    pub questions: Vec<QuestionView>,
    pub remaining: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QuestionView {
    pub prompt: String,
    pub options: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewQuiz {
    pub title: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub usernames: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub answers: Vec<usize>,
}

pub fn create_quiz(store: &Store, new_quiz: NewQuiz) -> Result<Quiz, AppError> {
    if new_quiz.title.trim().is_empty() {
        return Err(AppError::bad_request("Quiz title is required"));
    }
    if new_quiz.questions.is_empty() {
        return Err(AppError::bad_request("A quiz needs at least one question"));
    }
    for (i, question) in new_quiz.questions.iter().enumerate() {
        if question.options.len() < 2 {
            return Err(AppError::bad_request(format!(
                "Question {} needs at least two options",
                i + 1
            )));
        }
        if question.answer_index >= question.options.len() {
            return Err(AppError::bad_request(format!(
                "Question {} has an out of range answer",
                i + 1
            )));
        }
    }

    let quiz = Quiz {
        id: Uuid::new_v4(),
        title: new_quiz.title.trim().to_string(),
        questions: new_quiz.questions,
        created_at: Utc::now(),
    };

    store.update(QUIZZES_FILE, |quizzes: &mut Vec<Quiz>| {
        quizzes.push(quiz.clone());
        Ok(())
    })?;

    Ok(quiz)
}

pub fn get_quiz(store: &Store, quiz_id: Uuid) -> Result<Quiz, AppError> {
    let quizzes: Vec<Quiz> = store.read(QUIZZES_FILE)?;
    quizzes
        .into_iter()
        .find(|quiz| quiz.id == quiz_id)
        .ok_or(AppError::NotFound("Quiz"))
}

/// Queues a quiz for each user. Users who already have it queued are skipped.
/// Returns how many queues actually grew.
pub fn assign_quiz(store: &Store, quiz_id: Uuid, usernames: &[String]) -> Result<usize, AppError> {
    get_quiz(store, quiz_id)?;

    let added = store.update(USERS_FILE, |users: &mut HashMap<String, User>| {
        if let Some(missing) = usernames.iter().find(|name| !users.contains_key(*name)) {
            return Err(AppError::bad_request(format!("Unknown user {missing}")));
        }

        let mut added = 0;
        for name in usernames {
            if let Some(user) = users.get_mut(name) {
                if !user.pending_quizzes.contains(&quiz_id) {
                    user.pending_quizzes.push_back(quiz_id);
                    added += 1;
                }
            }
        }
        Ok(added)
    })?;

    info!("Assigned quiz {quiz_id} to {added} users");
    Ok(added)
}

/// The quiz at the front of the user's queue, if any.
pub fn next_quiz(store: &Store, username: &str) -> Result<Option<QuizView>, AppError> {
    let users: HashMap<String, User> = store.read(USERS_FILE)?;
    let user = users.get(username).ok_or(AppError::NotFound("User"))?;

    let Some(front) = user.pending_quizzes.front() else {
        return Ok(None);
    };

    let quiz = get_quiz(store, *front)?;
    Ok(Some(QuizView {
        id: quiz.id,
        title: quiz.title,
        questions: quiz
            .questions
            .into_iter()
            .map(|q| QuestionView {
                prompt: q.prompt,
                options: q.options,
            })
            .collect(),
        remaining: user.pending_quizzes.len(),
    }))
}

/// Scores the answers and pops the quiz off the front of the queue.
///
/// # Arguments
/// * `quiz_id` - Must be the quiz at the front of the user's queue
/// * `answers` - One option index per question, in order
///
/// # Errors
/// * `NotFound` for an unknown quiz
/// * `BadRequest` when the answer count does not match the questions
/// * `Conflict` when the quiz is not next in the queue
pub fn complete_quiz(
    store: &Store,
    username: &str,
    quiz_id: Uuid,
    answers: &[usize],
) -> Result<QuizResult, AppError> {
    let quiz = get_quiz(store, quiz_id)?;
    if answers.len() != quiz.questions.len() {
        return Err(AppError::bad_request(format!(
            "Expected {} answers, got {}",
            quiz.questions.len(),
            answers.len()
        )));
    }

    let score = quiz
        .questions
        .iter()
        .zip(answers)
        .filter(|(question, answer)| question.answer_index == **answer)
        .count();

    update_user(store, username, |user| {
        if user.pending_quizzes.front() != Some(&quiz_id) {
            return Err(AppError::Conflict(
                "This quiz is not the next one in your queue".to_string(),
            ));
        }
        user.pending_quizzes.pop_front();

        let result = QuizResult {
            quiz_id,
            score,
            total: quiz.questions.len(),
            completed_at: Utc::now(),
        };
        user.quiz_results.push(result.clone());
        Ok(result)
    })
}

pub async fn handle_list_quizzes(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<Quiz>>, AppError> {
    current.require_admin()?;
    Ok(Json(state.store.read(QUIZZES_FILE)?))
}

pub async fn handle_create_quiz(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(new_quiz): Json<NewQuiz>,
) -> Result<Json<Quiz>, AppError> {
    current.require_admin()?;
    Ok(Json(create_quiz(&state.store, new_quiz)?))
}

pub async fn handle_assign_quiz(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(quiz_id): Path<Uuid>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    current.require_admin()?;
    let assigned = assign_quiz(&state.store, quiz_id, &request.usernames)?;
    Ok(Json(serde_json::json!({ "assigned": assigned })))
}

pub async fn handle_next_quiz(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<QuizView>, AppError> {
    next_quiz(&state.store, &current.username)?
        .map(Json)
        .ok_or(AppError::NotFound("Pending quiz"))
}

pub async fn handle_complete_quiz(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(quiz_id): Path<Uuid>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<QuizResult>, AppError> {
    Ok(Json(complete_quiz(
        &state.store,
        &current.username,
        quiz_id,
        &request.answers,
    )?))
}
