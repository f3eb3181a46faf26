use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nutrilog::app::{AppState, router};
use nutrilog::config::Config;
use nutrilog::login::{Role, register_user};
use nutrilog::nutrition::{NutritionAnalyzer, RemoteAnalyzer};

struct TestApp {
    _dir: TempDir,
    state: Arc<AppState>,
    app: Router,
}

impl TestApp {
    fn new() -> Self {
        Self::with_analyzer(None)
    }

    fn with_analyzer(analyzer_url: Option<String>) -> Self {
        Self::with_config(analyzer_url, |_| {})
    }

    fn with_config(analyzer_url: Option<String>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_data_dir(dir.path());
        tweak(&mut config);
        let http = reqwest::Client::new();
        let analyzer = analyzer_url.map(|url| {
            Arc::new(RemoteAnalyzer::new(http.clone(), url, Some("test-key".to_string())))
                as Arc<dyn NutritionAnalyzer>
        });

        let state = AppState::with_analyzer(config, http, analyzer).unwrap();
        let app = router(state.clone());
        Self {
            _dir: dir,
            state,
            app,
        }
    }

    async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let (status, bytes) = self.send(request).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn signup(&self, username: &str) -> String {
        let (status, _) = self
            .request(
                "POST",
                "/api/auth/register",
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": "correct horse",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        self.login(username, "correct horse").await
    }

    async fn admin(&self) -> String {
        register_user(
            &self.state.store,
            "root",
            "root@example.com",
            "admin pass",
            Role::Admin,
        )
        .unwrap();
        self.login("root", "admin pass").await
    }

    async fn login(&self, username: &str, password: &str) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn login_sets_cookie_and_logout_ends_session() {
    let app = TestApp::new();
    app.signup("alice").await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "username": "alice", "password": "correct horse" }).to_string(),
        ))
        .unwrap();
    let response = app.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("session="));

    let me = Request::builder()
        .uri("/api/auth/me")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let response = app.app.clone().oneshot(me).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let logout = Request::builder()
        .method("POST")
        .uri("/api/auth/logout")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    app.app.clone().oneshot(logout).await.unwrap();

    let token = cookie.trim_start_matches("session=");
    let (status, _) = app.request("GET", "/api/auth/me", Some(token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rejects_bad_credentials_and_duplicates() {
    let app = TestApp::new();
    app.signup("bob").await;

    let (status, _) = app
        .request(
            "POST",
            "/api/auth/register",
            None,
            Some(json!({ "username": "bob", "email": "other@example.com", "password": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .request(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "username": "bob", "password": "wrong" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, _) = app.request("GET", "/api/diet", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn diet_entry_lifecycle() {
    let app = TestApp::new();
    let token = app.signup("carol").await;

    let (status, entry) = app
        .request(
            "POST",
            "/api/diet",
            Some(&token),
            Some(json!({
                "date": "2025-04-02",
                "mealType": "breakfast",
                "isCustomMeal": true,
                "customMealName": "Oatmeal",
                "items": [{ "name": "Oatmeal", "quantity": 1 }],
                "energyLevel": 4,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["calories"], json!(109.0));
    assert_eq!(entry["owner"], json!("carol"));
    let id = entry["id"].as_str().unwrap().to_string();

    let (_, listed) = app
        .request("GET", "/api/diet?mealType=breakfast", Some(&token), None)
        .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, listed) = app
        .request("GET", "/api/diet?mealType=dinner", Some(&token), None)
        .await;
    assert!(listed.as_array().unwrap().is_empty());

    let (status, _) = app
        .request(
            "PUT",
            &format!("/api/diet/{id}"),
            Some(&token),
            Some(json!({
                "mealType": "breakfast",
                "isCustomMeal": true,
                "customMealName": "Oatmeal",
                "energyLevel": 9,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let other = app.signup("dave").await;
    let (status, _) = app
        .request("GET", &format!("/api/diet/{id}"), Some(&other), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .request("DELETE", &format!("/api/diet/{id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app
        .request("GET", &format!("/api/diet/{id}"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .request("GET", "/api/diet/analytics?days=0", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn water_counter_never_goes_negative() {
    let app = TestApp::new();
    let token = app.signup("erin").await;

    let (_, today) = app
        .request("GET", "/api/water-tracking/today", Some(&token), None)
        .await;
    assert_eq!(today["glasses"], json!(0));
    assert_eq!(today["goal"], json!(8));

    let (_, day) = app
        .request(
            "POST",
            "/api/water-tracking/add",
            Some(&token),
            Some(json!({ "glasses": 3 })),
        )
        .await;
    assert_eq!(day["glasses"], json!(3));

    let (_, day) = app
        .request("POST", "/api/water-tracking/add", Some(&token), None)
        .await;
    assert_eq!(day["glasses"], json!(4));

    let (_, day) = app
        .request(
            "POST",
            "/api/water-tracking/remove",
            Some(&token),
            Some(json!({ "glasses": 10 })),
        )
        .await;
    assert_eq!(day["glasses"], json!(0));

    let (status, _) = app
        .request(
            "PUT",
            "/api/water-tracking/goal",
            Some(&token),
            Some(json!({ "goal": 31 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, day) = app
        .request(
            "PUT",
            "/api/water-tracking/goal",
            Some(&token),
            Some(json!({ "goal": 10 })),
        )
        .await;
    assert_eq!(day["goal"], json!(10));
}

#[tokio::test]
async fn gated_collection_needs_current_code() {
    let app = TestApp::new();
    let admin = app.admin().await;
    let user = app.signup("frank").await;

    let (status, collection) = app
        .request(
            "POST",
            "/api/collections",
            Some(&admin),
            Some(json!({ "name": "Coached", "accessCode": "letmein" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let collection_id = collection["id"].as_str().unwrap().to_string();

    let (status, product) = app
        .request(
            "POST",
            "/api/products",
            Some(&admin),
            Some(json!({
                "name": "Protein shake",
                "kind": "meal",
                "nutrition": { "calories": 250.0, "protein": 30.0, "carbs": 12.0, "fat": 4.0, "fiber": 1.0 },
                "collectionIds": [collection_id],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let product_id = product["id"].as_str().unwrap().to_string();

    let (_, products) = app.request("GET", "/api/products", Some(&user), None).await;
    assert!(products.as_array().unwrap().is_empty());

    let (status, body) = app
        .request("GET", &format!("/api/products/{product_id}"), Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["requiresCode"], json!(true));
    assert_eq!(body["collectionId"], json!(collection_id));

    let access = format!("/api/collections/{collection_id}/access");
    let (status, _) = app
        .request("POST", &access, Some(&user), Some(json!({ "code": "nope" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request("POST", &access, Some(&user), Some(json!({ "code": "letmein" })))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request("GET", &format!("/api/products/{product_id}"), Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    // rotating the code invalidates earlier grants
    let (status, _) = app
        .request(
            "PUT",
            &format!("/api/collections/{collection_id}"),
            Some(&admin),
            Some(json!({ "accessCode": "rotated" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request("GET", &format!("/api/products/{product_id}"), Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn quizzes_are_served_first_in_first_out() {
    let app = TestApp::new();
    let admin = app.admin().await;
    let user = app.signup("gina").await;

    let mut ids = Vec::new();
    for title in ["First", "Second"] {
        let (status, quiz) = app
            .request(
                "POST",
                "/api/quizzes",
                Some(&admin),
                Some(json!({
                    "title": title,
                    "questions": [{ "prompt": "2 + 2?", "options": ["3", "4"], "answerIndex": 1 }],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let id = quiz["id"].as_str().unwrap().to_string();

        let (_, assigned) = app
            .request(
                "POST",
                &format!("/api/quizzes/{id}/assign"),
                Some(&admin),
                Some(json!({ "usernames": ["gina"] })),
            )
            .await;
        assert_eq!(assigned["assigned"], json!(1));
        ids.push(id);
    }

    let (status, _) = app
        .request(
            "POST",
            "/api/quizzes",
            Some(&user),
            Some(json!({ "title": "Mine", "questions": [] })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, next) = app.request("GET", "/api/quizzes/next", Some(&user), None).await;
    assert_eq!(next["title"], json!("First"));
    assert_eq!(next["remaining"], json!(2));
    assert!(next["questions"][0].get("answerIndex").is_none());

    let (status, _) = app
        .request(
            "POST",
            &format!("/api/quizzes/{}/complete", ids[1]),
            Some(&user),
            Some(json!({ "answers": [1] })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, result) = app
        .request(
            "POST",
            &format!("/api/quizzes/{}/complete", ids[0]),
            Some(&user),
            Some(json!({ "answers": [1] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["score"], json!(1));

    let (_, next) = app.request("GET", "/api/quizzes/next", Some(&user), None).await;
    assert_eq!(next["title"], json!("Second"));
}

#[tokio::test]
async fn analyze_uses_remote_analyzer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .and(header_matcher("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "calories": 512.34,
            "protein": 20.04,
            "carbs": 60.0,
            "fat": 18.0,
            "confidence": 92,
            "description": "Pasta with tomato sauce",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_analyzer(Some(format!("{}/analyze", server.uri())));
    let token = app.signup("hank").await;

    let (status, analysis) = app
        .request(
            "POST",
            "/api/nutrition/analyze",
            Some(&token),
            Some(json!({ "image": "aGVsbG8=", "mealName": "pasta", "mealType": "dinner" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analysis["source"], json!("ai"));
    assert_eq!(analysis["nutrition"]["calories"], json!(512.0));
    assert_eq!(analysis["nutrition"]["protein"], json!(20.0));
    assert_eq!(analysis["confidence"], json!(92));
    assert!(analysis["fallbackReason"].is_null());
}

#[tokio::test]
async fn analyze_falls_back_when_analyzer_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let app = TestApp::with_analyzer(Some(server.uri()));
    let token = app.signup("ivy").await;

    let (status, analysis) = app
        .request(
            "POST",
            "/api/nutrition/analyze",
            Some(&token),
            Some(json!({ "image": "aGVsbG8=", "mealName": "chicken breast", "mealType": "lunch" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analysis["source"], json!("estimate"));
    assert_eq!(analysis["nutrition"]["calories"], json!(330.0));
    assert!(analysis["fallbackReason"].is_string());
}

#[tokio::test]
async fn analyze_without_analyzer_estimates() {
    let app = TestApp::new();
    let token = app.signup("jack").await;

    let (status, analysis) = app
        .request(
            "POST",
            "/api/nutrition/analyze",
            Some(&token),
            Some(json!({ "image": "aGVsbG8=", "mealName": "mystery stew", "mealType": "snack" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analysis["source"], json!("estimate"));
    assert_eq!(analysis["confidence"], json!(40));

    let (status, _) = app
        .request(
            "POST",
            "/api/nutrition/analyze",
            Some(&token),
            Some(json!({ "image": "  ", "mealName": "x", "mealType": "snack" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_input_gets_a_json_error() {
    let app = TestApp::new();
    let token = app.signup("kate").await;

    let (status, body) = app
        .request("POST", "/api/diet", Some(&token), Some(json!({ "mealType": "brunch" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, body) = app
        .request("GET", "/api/diet?date=yesterday", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, body) = app
        .request("GET", "/api/diet/not-a-uuid", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, body) = app
        .request(
            "POST",
            "/api/water-tracking/add",
            Some(&token),
            Some(json!({ "glasses": -5 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let (status, _) = app
        .request(
            "POST",
            "/api/water-tracking/remove",
            Some(&token),
            Some(json!({ "glasses": "lots" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, today) = app
        .request("GET", "/api/water-tracking/today", Some(&token), None)
        .await;
    assert_eq!(today["glasses"], json!(0));
}

#[tokio::test]
async fn product_meals_scale_with_quantity() {
    let app = TestApp::new();
    let admin = app.admin().await;
    let user = app.signup("liam").await;

    let (_, collection) = app
        .request(
            "POST",
            "/api/collections",
            Some(&admin),
            Some(json!({ "name": "Everyday" })),
        )
        .await;
    let (status, product) = app
        .request(
            "POST",
            "/api/products",
            Some(&admin),
            Some(json!({
                "name": "Protein shake",
                "kind": "meal",
                "nutrition": { "calories": 250.0, "protein": 30.0, "carbs": 12.0, "fat": 4.0, "fiber": 1.0 },
                "collectionIds": [collection["id"]],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, entry) = app
        .request(
            "POST",
            "/api/diet",
            Some(&user),
            Some(json!({
                "mealType": "lunch",
                "productId": product["id"],
                "items": [
                    { "name": "Protein shake", "quantity": 1 },
                    { "name": "Protein shake", "quantity": 1 },
                ],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["calories"], json!(500.0));
    assert_eq!(entry["protein"], json!(60.0));
}

#[tokio::test]
async fn admins_list_any_users_log() {
    let app = TestApp::new();
    let admin = app.admin().await;
    let user = app.signup("mona").await;

    let (status, _) = app
        .request(
            "POST",
            "/api/diet",
            Some(&user),
            Some(json!({ "mealType": "dinner", "calories": 640.0 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request("GET", "/api/diet/admin/mona", Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, entries) = app
        .request("GET", "/api/diet/admin/mona", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["owner"], json!("mona"));

    let (status, _) = app
        .request("GET", "/api/diet/admin/nobody", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn locked_parent_gates_child_collection() {
    let app = TestApp::new();
    let admin = app.admin().await;
    let user = app.signup("nina").await;

    let (_, parent) = app
        .request(
            "POST",
            "/api/collections",
            Some(&admin),
            Some(json!({ "name": "Program", "accessCode": "opensesame" })),
        )
        .await;
    let parent_id = parent["id"].as_str().unwrap().to_string();

    let (status, child) = app
        .request(
            "POST",
            "/api/collections",
            Some(&admin),
            Some(json!({ "name": "Week 1", "parentId": parent_id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let child_id = child["id"].as_str().unwrap().to_string();

    let (_, product) = app
        .request(
            "POST",
            "/api/products",
            Some(&admin),
            Some(json!({
                "name": "Overnight oats",
                "kind": "meal",
                "nutrition": { "calories": 300.0, "protein": 12.0, "carbs": 50.0, "fat": 6.0, "fiber": 7.0 },
                "collectionIds": [child_id],
            })),
        )
        .await;
    let product_url = format!("/api/products/{}", product["id"].as_str().unwrap());

    let (status, body) = app.request("GET", &product_url, Some(&user), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["requiresCode"], json!(true));
    assert_eq!(body["collectionId"], json!(parent_id));

    let (status, body) = app
        .request("GET", &format!("/api/collections/{child_id}"), Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["collectionId"], json!(parent_id));

    let (status, _) = app
        .request(
            "POST",
            &format!("/api/collections/{parent_id}/access"),
            Some(&user),
            Some(json!({ "code": "opensesame" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.request("GET", &product_url, Some(&user), None).await;
    assert_eq!(status, StatusCode::OK);
}

fn multipart_upload(token: &str, field: &str, data: &[u8]) -> Request<Body> {
    let boundary = "nutrilog-test-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"archive.bin.gz\"\r\nContent-Type: application/gzip\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/diet/archive")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn archive_upload_restores_into_another_account() {
    let app = TestApp::new();
    let source = app.signup("olga").await;
    let target = app.signup("pete").await;

    for calories in [320.0, 480.0] {
        let (status, _) = app
            .request(
                "POST",
                "/api/diet",
                Some(&source),
                Some(json!({ "mealType": "snack", "calories": calories })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    app.request("POST", "/api/water-tracking/add", Some(&source), None)
        .await;

    let download = Request::builder()
        .uri("/api/diet/archive")
        .header(header::AUTHORIZATION, format!("Bearer {source}"))
        .body(Body::empty())
        .unwrap();
    let (status, archive) = app.send(download).await;
    assert_eq!(status, StatusCode::OK);

    let (status, summary) = app.send(multipart_upload(&target, "archive", &archive)).await;
    assert_eq!(status, StatusCode::OK);
    let summary: Value = serde_json::from_slice(&summary).unwrap();
    assert_eq!(summary["dietEntries"], json!(2));
    assert_eq!(summary["waterDays"], json!(1));

    let (_, restored) = app.request("GET", "/api/diet", Some(&target), None).await;
    let restored = restored.as_array().unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|e| e["owner"] == json!("pete")));

    let (_, original) = app.request("GET", "/api/diet", Some(&source), None).await;
    let original_ids: Vec<&Value> = original
        .as_array()
        .unwrap()
        .iter()
        .map(|e| &e["id"])
        .collect();
    assert!(restored.iter().all(|e| !original_ids.contains(&&e["id"])));

    let (status, body) = app
        .send(multipart_upload(&target, "archive", b"definitely not gzip"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["message"].as_str().unwrap().contains("Invalid archive"));

    let (status, _) = app.send(multipart_upload(&target, "other", &archive)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn analyze_fetches_remote_photos() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/meal.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "calories": 700.0,
            "protein": 35.0,
            "carbs": 80.0,
            "fat": 25.0,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_analyzer(Some(format!("{}/analyze", server.uri())));
    let token = app.signup("quinn").await;

    let (status, analysis) = app
        .request(
            "POST",
            "/api/nutrition/analyze",
            Some(&token),
            Some(json!({
                "image": format!("{}/meal.png", server.uri()),
                "mealName": "burger",
                "mealType": "dinner",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analysis["source"], json!("ai"));
    assert_eq!(analysis["nutrition"]["calories"], json!(700.0));
    assert_eq!(analysis["confidence"], json!(85));

    let (status, analysis) = app
        .request(
            "POST",
            "/api/nutrition/analyze",
            Some(&token),
            Some(json!({
                "image": format!("{}/missing.png", server.uri()),
                "mealName": "chicken breast",
                "mealType": "lunch",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analysis["source"], json!("estimate"));
    assert!(analysis["fallbackReason"].as_str().unwrap().contains("fetch"));
}

#[tokio::test]
async fn oversized_images_fall_back_to_estimates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/huge.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "calories": 1.0 })))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::with_config(Some(format!("{}/analyze", server.uri())), |config| {
        config.image_max_bytes = 2;
    });
    let token = app.signup("rosa").await;

    for image in ["aGVsbG8=".to_string(), format!("{}/huge.png", server.uri())] {
        let (status, analysis) = app
            .request(
                "POST",
                "/api/nutrition/analyze",
                Some(&token),
                Some(json!({ "image": image, "mealName": "salmon", "mealType": "dinner" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(analysis["source"], json!("estimate"));
        assert!(analysis["fallbackReason"].as_str().unwrap().contains("too large"));
    }
}
