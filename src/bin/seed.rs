//! Seeds a data directory with an administrator, a demo user, a few quizzes
//! queued in order for the demo user and a small product catalog.
//!
//! Running it twice is harmless: existing users are kept and the quizzes and
//! catalog are only created when the store has none.
use std::env;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use nutrilog::catalog::{
    Collection, NewCollection, NewProduct, ProductKind, create_collection, create_product,
};
use nutrilog::config::Config;
use nutrilog::error::AppError;
use nutrilog::login::{CurrentUser, Role, register_user};
use nutrilog::nutrition::Nutrition;
use nutrilog::quiz::{NewQuiz, Question, Quiz, assign_quiz, create_quiz};
use nutrilog::store::{COLLECTIONS_FILE, QUIZZES_FILE, Store};

fn ensure_user(
    store: &Store,
    username: &str,
    email: &str,
    password: &str,
    role: Role,
) -> Result<(), AppError> {
    match register_user(store, username, email, password, role) {
        Ok(_) => Ok(()),
        Err(AppError::Conflict(_)) => {
            info!("User {username} already exists, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn question(prompt: &str, options: &[&str], answer_index: usize) -> Question {
    Question {
        prompt: prompt.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
        answer_index,
    }
}

fn seed_quizzes(store: &Store, demo: &str) -> Result<(), AppError> {
    let existing: Vec<Quiz> = store.read(QUIZZES_FILE)?;
    if !existing.is_empty() {
        info!("{} quizzes already present, skipping", existing.len());
        return Ok(());
    }

    let quizzes = [
        NewQuiz {
            title: "Hydration basics".to_string(),
            questions: vec![
                question(
                    "How many glasses of water is the default daily goal?",
                    &["4", "8", "12"],
                    1,
                ),
                question(
                    "Which drink counts best toward hydration?",
                    &["Water", "Espresso", "Energy drink"],
                    0,
                ),
            ],
        },
        NewQuiz {
            title: "Macronutrients".to_string(),
            questions: vec![
                question(
                    "Which macronutrient has the most calories per gram?",
                    &["Protein", "Carbohydrate", "Fat"],
                    2,
                ),
                question(
                    "Which food is richest in fiber?",
                    &["Lentils", "Chicken breast", "Butter"],
                    0,
                ),
            ],
        },
        NewQuiz {
            title: "Meal timing".to_string(),
            questions: vec![question(
                "Which meal is usually the largest in the day?",
                &["Breakfast", "Snack", "Dinner"],
                2,
            )],
        },
    ];

    // assigned one by one so the queue keeps creation order
    for new_quiz in quizzes {
        let quiz = create_quiz(store, new_quiz)?;
        assign_quiz(store, quiz.id, &[demo.to_string()])?;
        info!("Created and queued quiz {}", quiz.title);
    }
    Ok(())
}

fn seed_catalog(store: &Store, admin: &CurrentUser) -> Result<(), AppError> {
    let existing: Vec<Collection> = store.read(COLLECTIONS_FILE)?;
    if !existing.is_empty() {
        info!("{} collections already present, skipping", existing.len());
        return Ok(());
    }

    let staples = create_collection(
        store,
        admin,
        NewCollection {
            name: "Everyday staples".to_string(),
            description: Some("Common meals anyone can log".to_string()),
            parent_id: None,
            access_code: None,
        },
    )?;

    let access_code = env::var("SEED_ACCESS_CODE").unwrap_or_else(|_| "athlete".to_string());
    let athlete = create_collection(
        store,
        admin,
        NewCollection {
            name: "Athlete plan".to_string(),
            description: Some("Coached meals and workouts".to_string()),
            parent_id: None,
            access_code: Some(access_code),
        },
    )?;

    let products = [
        (
            "Oatmeal with banana",
            ProductKind::Meal,
            Nutrition::new(320.0, 9.0, 58.0, 6.0, 7.0),
            staples.id,
        ),
        (
            "Grilled chicken salad",
            ProductKind::Meal,
            Nutrition::new(410.0, 38.0, 14.0, 22.0, 5.0),
            staples.id,
        ),
        (
            "Salmon rice bowl",
            ProductKind::Meal,
            Nutrition::new(620.0, 40.0, 68.0, 18.0, 4.0),
            athlete.id,
        ),
        (
            "Interval run",
            ProductKind::Exercise,
            Nutrition::default(),
            athlete.id,
        ),
    ];

    let count = products.len();
    for (name, kind, nutrition, collection_id) in products {
        create_product(
            store,
            admin,
            NewProduct {
                name: name.to_string(),
                kind,
                description: None,
                nutrition,
                collection_ids: vec![collection_id],
            },
        )?;
    }

    info!("Created catalog with {count} products");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();
    let store = Store::open(&config.data_dir)?;
    info!("Seeding {}", store.root().display());

    let admin_password = env::var("SEED_ADMIN_PASSWORD").unwrap_or_else(|_| {
        warn!("SEED_ADMIN_PASSWORD not set, using the default");
        "admin-password".to_string()
    });
    let demo_password =
        env::var("SEED_DEMO_PASSWORD").unwrap_or_else(|_| "demo-password".to_string());

    ensure_user(&store, "admin", "admin@example.com", &admin_password, Role::Admin)?;
    ensure_user(&store, "demo", "demo@example.com", &demo_password, Role::User)?;

    let admin = CurrentUser {
        username: "admin".to_string(),
        role: Role::Admin,
    };

    seed_quizzes(&store, "demo")?;
    seed_catalog(&store, &admin)?;

    info!("Seeding finished");
    Ok(())
}
