use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use chatty_api::app::services::{AppServices, build_services_with};
use chatty_api::services::{AuthUser, AuthUserRepository, InMemoryAuthUserRepository};
use chatty_queue::{InMemoryJobStore, JobQueue, JobStore, QueueConfig};

struct TestServer {
    base_url: String,
    services: AppServices,
    email_queue: JobQueue,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let services = build_services_with(
            store.clone(),
            QueueConfig::default(),
            Arc::new(InMemoryAuthUserRepository::new()),
        )
        .expect("failed to wire services");

        // A queue without processors, so its jobs stay visible on the board.
        let email_queue =
            JobQueue::new("emailQueue", store, &services.registry, QueueConfig::default())
                .expect("failed to create email queue");

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = chatty_api::app::build_app(services.registry.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            email_queue,
            handle,
        }
    }

    async fn get(&self, path: &str) -> (StatusCode, serde_json::Value) {
        let res = reqwest::get(format!("{}{}", self.base_url, path))
            .await
            .unwrap();
        let status = res.status();
        let body = res.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn user(username: &str) -> AuthUser {
    AuthUser {
        id: format!("auth-{username}"),
        u_id: "98765".into(),
        username: username.into(),
        email: format!("{username}@example.com"),
        password: "$2a$10$hash".into(),
        avatar_color: "blue".into(),
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn board_lists_every_registered_queue() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.get("/queues").await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body["queues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["authQueue", "emailQueue"]);
    assert_eq!(body["queues"][0]["processors"], json!(["addAuthUserToDB"]));
    assert_eq!(body["queues"][1]["processors"], json!([]));
}

#[tokio::test]
async fn board_shows_waiting_jobs_and_their_details() {
    let srv = TestServer::spawn().await;
    let first = srv
        .email_queue
        .submit("forgotPasswordEmail", &json!({"receiverEmail": "alice@example.com"}))
        .await
        .unwrap();
    srv.email_queue
        .submit("forgotPasswordEmail", &json!({"receiverEmail": "bob@example.com"}))
        .await
        .unwrap();

    let (status, body) = srv.get("/queues/emailQueue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "emailQueue");
    assert_eq!(body["counts"]["waiting"], 2);

    let (status, body) = srv.get("/queues/emailQueue/jobs?status=waiting&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["jobs"][0]["name"], "forgotPasswordEmail");

    let (status, body) = srv.get(&format!("/queues/emailQueue/jobs/{first}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["attempts_made"], 0);
    assert_eq!(body["policy"]["attempts"], 3);
    assert_eq!(body["policy"]["backoff"]["delay"], 5000);
    assert_eq!(body["payload"]["receiverEmail"], "alice@example.com");
}

#[tokio::test]
async fn board_errors_are_json() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.get("/queues/missingQueue").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "queue_not_found");

    let (status, body) = srv.get("/queues/emailQueue/jobs/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "job_not_found");

    let (status, body) = srv.get("/queues/emailQueue/jobs/abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_job_id");

    let (status, body) = srv.get("/queues/emailQueue/jobs?status=done").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_status");
}

#[tokio::test]
async fn auth_users_are_written_by_the_worker_and_evicted_from_the_board() {
    let srv = TestServer::spawn().await;
    let id = srv
        .services
        .auth_queue
        .add_auth_user_job(user("carol"))
        .await
        .unwrap();

    let mut stored = None;
    for _ in 0..100 {
        stored = srv.services.auth_users.find_by_username("carol").await.unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.map(|u| u.email), Some("carol@example.com".to_string()));

    // Completed jobs are deleted; poll until the completion is persisted.
    for _ in 0..100 {
        let (status, _) = srv.get(&format!("/queues/authQueue/jobs/{id}")).await;
        if status == StatusCode::NOT_FOUND {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("completed job was not removed");
}
