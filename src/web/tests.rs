use super::*;
use crate::clock::SystemClock;
use crate::config::RateLimitConfig;
use crate::db::{HealthStatus, Link};
use crate::health::testing::StubProber;
use crate::notify::testing::RecordingNotifier;
use crate::redirect::NoGeoLocation;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower::ServiceExt;

struct TestApp {
    _tmp: NamedTempFile,
    store: Arc<Store>,
    notifier: Arc<RecordingNotifier>,
    router: Router,
}

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl TestResponse {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

impl TestApp {
    fn new(prober: StubProber, max_requests: u32) -> Self {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hasher = PasswordHasher::new();

        let config = ServerConfig {
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(900),
                max_requests,
            },
            ..Default::default()
        };

        let checker = Arc::new(HealthChecker::new(
            store.clone(),
            Arc::new(prober),
            notifier.clone(),
            clock.clone(),
        ));
        let resolver = Arc::new(Resolver::new(
            store.clone(),
            clock.clone(),
            hasher.clone(),
            Arc::new(NoGeoLocation),
        ));

        let state = AppState {
            rate_limiter: build_rate_limiter(&config.rate_limit),
            config,
            store: store.clone(),
            resolver,
            checker,
            hasher,
            clock,
            started_at: Instant::now(),
        };

        Self {
            _tmp: tmp,
            store,
            notifier,
            router: Server::new(state).routes(),
        }
    }

    fn healthy() -> Self {
        Self::new(StubProber::Status(200, Duration::from_millis(20)), 0)
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.10")
            .header(header::USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0");
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        TestResponse {
            status,
            headers,
            body: String::from_utf8(bytes.to_vec()).unwrap(),
        }
    }

    async fn get(&self, uri: &str) -> TestResponse {
        self.send(Method::GET, uri, None).await
    }

    async fn create_user(&self) -> i64 {
        let res = self
            .send(
                Method::POST,
                "/api/v1/users",
                Some(json!({ "email": "owner@example.com", "name": "Owner" })),
            )
            .await;
        assert_eq!(res.status, StatusCode::CREATED);
        res.json()["id"].as_i64().unwrap()
    }

    async fn create_link(&self, body: Value) -> Value {
        let res = self.send(Method::POST, "/api/v1/links", Some(body)).await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
        res.json()
    }
}

#[tokio::test]
async fn test_max_clicks_one_end_to_end() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    let link = app
        .create_link(json!({
            "originalUrl": "https://example.com/landing",
            "maxClicks": 1,
            "userId": user_id,
        }))
        .await;
    let code = link["shortCode"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));

    let first = app.get(&format!("/{}", code)).await;
    assert_eq!(first.status, StatusCode::FOUND);
    assert_eq!(
        first.headers.get(header::LOCATION).unwrap(),
        "https://example.com/landing"
    );

    let second = app.get(&format!("/{}", code)).await;
    assert_eq!(second.status, StatusCode::GONE);
    assert!(second.body.contains("This link has reached its click limit"));

    let id = link["id"].as_i64().unwrap();
    let stored = app.store.get_link(id).unwrap();
    assert_eq!(stored.current_clicks, 1);
    assert_eq!(app.store.count_clicks(id).unwrap(), 1);
}

#[tokio::test]
async fn test_password_end_to_end() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    let link = app
        .create_link(json!({
            "originalUrl": "https://example.com/secret",
            "shortCode": "vault",
            "password": "abc",
            "userId": user_id,
        }))
        .await;
    assert_eq!(link["hasPassword"], true);
    assert!(link.get("passwordHash").is_none());

    let prompt = app.get("/vault").await;
    assert_eq!(prompt.status, StatusCode::FORBIDDEN);
    assert!(prompt.body.contains("Password Required"));
    assert!(prompt.body.contains(r#"action="/vault""#));
    assert!(!prompt.body.contains("Incorrect password"));

    let wrong = app.get("/vault?password=abd").await;
    assert_eq!(wrong.status, StatusCode::FORBIDDEN);
    assert!(wrong.body.contains("Incorrect password"));

    let right = app.get("/vault?password=abc").await;
    assert_eq!(right.status, StatusCode::FOUND);
    assert_eq!(
        right.headers.get(header::LOCATION).unwrap(),
        "https://example.com/secret"
    );

    let id = link["id"].as_i64().unwrap();
    assert_eq!(app.store.get_link(id).unwrap().current_clicks, 1);
}

#[tokio::test]
async fn test_unknown_code_is_json_not_found() {
    let app = TestApp::healthy();
    let res = app.get("/missing").await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(
        res.json(),
        json!({ "success": false, "error": { "message": "Link not found" } })
    );
}

#[tokio::test]
async fn test_preview_never_counts_clicks() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    let link = app
        .create_link(json!({
            "originalUrl": "https://example.com/peek",
            "shortCode": "peek",
            "title": "Peek",
            "maxClicks": 1,
            "userId": user_id,
        }))
        .await;

    for _ in 0..3 {
        let res = app.get("/peek/preview").await;
        assert_eq!(res.status, StatusCode::OK);
        let preview = res.json();
        assert_eq!(preview["originalUrl"], "https://example.com/peek");
        assert_eq!(preview["shortUrl"], "localhost:8080/peek");
        assert_eq!(preview["currentClicks"], 0);
        assert_eq!(preview["createdBy"], "Owner");
    }

    let id = link["id"].as_i64().unwrap();
    assert_eq!(app.store.get_link(id).unwrap().current_clicks, 0);
    assert_eq!(app.get("/peek").await.status, StatusCode::FOUND);
}

#[tokio::test]
async fn test_deactivated_link_renders_branded_page() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    let org = app
        .send(
            Method::POST,
            "/api/v1/organizations",
            Some(json!({
                "name": "Acme",
                "primaryColor": "#112233",
                "redirectTitle": "Acme <Links>",
            })),
        )
        .await;
    assert_eq!(org.status, StatusCode::CREATED);
    let org_id = org.json()["id"].as_i64().unwrap();

    let link = app
        .create_link(json!({
            "originalUrl": "https://example.com/promo",
            "shortCode": "promo",
            "userId": user_id,
            "organizationId": org_id,
        }))
        .await;
    let id = link["id"].as_i64().unwrap();

    let res = app
        .send(
            Method::PUT,
            &format!("/api/v1/links/{}", id),
            Some(json!({ "isActive": false })),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()["isActive"], false);

    let page = app.get("/promo").await;
    assert_eq!(page.status, StatusCode::GONE);
    assert!(page.body.contains("#112233"));
    assert!(page.body.contains("Acme &lt;Links&gt;"));
    assert!(page.body.contains("This link has been deactivated"));
}

#[tokio::test]
async fn test_rate_limit_exempts_health() {
    let app = TestApp::new(StubProber::Status(200, Duration::from_millis(20)), 2);

    assert_eq!(app.get("/nothing").await.status, StatusCode::NOT_FOUND);
    assert_eq!(app.get("/nothing").await.status, StatusCode::NOT_FOUND);

    let limited = app.get("/nothing").await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.json()["error"]["message"], "Rate limit exceeded");

    for _ in 0..5 {
        assert_eq!(app.get("/health").await.status, StatusCode::OK);
    }
    assert_eq!(app.get("/health/ready").await.json()["status"], "ready");

    let live = app.get("/health/live").await;
    assert_eq!(live.status, StatusCode::OK);
    assert_eq!(live.json()["status"], "alive");
    assert!(live.json()["uptime"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_on_demand_health_check() {
    let app = TestApp::new(StubProber::Status(503, Duration::from_millis(40)), 0);
    let user = app.store.add_user("owner@example.com", "Owner").unwrap();
    let mut link = Link {
        short_code: "down".to_string(),
        original_url: "https://example.com/down".to_string(),
        user_id: user.id,
        ..Default::default()
    };
    app.store.add_link(&mut link).unwrap();

    let res = app
        .send(Method::POST, &format!("/api/v1/links/{}/health", link.id), None)
        .await;
    assert_eq!(res.status, StatusCode::OK);
    let result = res.json();
    assert_eq!(result["status"], "ERROR");
    assert_eq!(result["statusCode"], 503);
    assert_eq!(result["responseTime"], 40);
    assert_eq!(result["error"], "HTTP 503");
    assert!(result["checkedAt"].is_string());

    let stored = app.store.get_link(link.id).unwrap();
    assert_eq!(stored.health_status, HealthStatus::Error);
    assert!(stored.last_health_check.is_some());
    assert_eq!(app.notifier.sent().len(), 1);

    let history = app
        .get(&format!("/api/v1/links/{}/health-checks", link.id))
        .await
        .json();
    assert_eq!(history.as_array().unwrap().len(), 1);

    let missing = app.send(Method::POST, "/api/v1/links/999/health", None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_link_validation() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;

    let cases = [
        json!({ "originalUrl": "ftp://example.com/file", "userId": user_id }),
        json!({ "originalUrl": "not a url", "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "shortCode": "a!", "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "maxClicks": 0, "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "expiresAt": "2001-01-01T00:00:00Z", "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "title": "t".repeat(201), "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "userId": 9999 }),
        json!({ "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "shortCode": "health", "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "shortCode": "Api", "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "tags": vec!["t"; 11], "userId": user_id }),
        json!({ "originalUrl": "https://example.com", "tags": ["x".repeat(51)], "userId": user_id }),
    ];
    for body in cases {
        let res = app.send(Method::POST, "/api/v1/links", Some(body.clone())).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST, "accepted {}", body);
        assert_eq!(res.json()["success"], false);
    }

    app.create_link(json!({
        "originalUrl": "https://example.com",
        "shortCode": "taken",
        "userId": user_id,
    }))
    .await;
    let duplicate = app
        .send(
            Method::POST,
            "/api/v1/links",
            Some(json!({ "originalUrl": "https://example.org", "shortCode": "taken", "userId": user_id })),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(duplicate.json()["error"]["message"], "Short code already exists");
}

#[tokio::test]
async fn test_list_and_update_links() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    for code in ["alpha", "beta", "gamma"] {
        app.create_link(json!({
            "originalUrl": format!("https://example.com/{}", code),
            "shortCode": code,
            "maxClicks": 5,
            "userId": user_id,
        }))
        .await;
    }

    let page = app
        .get(&format!("/api/v1/links?userId={}&limit=2", user_id))
        .await
        .json();
    assert_eq!(page["links"].as_array().unwrap().len(), 2);
    assert_eq!(page["pagination"]["total"], 3);
    assert_eq!(page["pagination"]["pages"], 2);

    let search = app.get("/api/v1/links?search=bet").await.json();
    assert_eq!(search["links"][0]["shortCode"], "beta");

    let bad_status = app.get("/api/v1/links?healthStatus=sideways").await;
    assert_eq!(bad_status.status, StatusCode::BAD_REQUEST);

    let beta_id = search["links"][0]["id"].as_i64().unwrap();
    let updated = app
        .send(
            Method::PUT,
            &format!("/api/v1/links/{}", beta_id),
            Some(json!({ "maxClicks": null, "title": "Beta" })),
        )
        .await
        .json();
    assert_eq!(updated["maxClicks"], Value::Null);
    assert_eq!(updated["title"], "Beta");
    assert_eq!(updated["originalUrl"], "https://example.com/beta");

    let tagged = app
        .send(
            Method::PUT,
            &format!("/api/v1/links/{}", beta_id),
            Some(json!({ "tags": ["docs", "launch"] })),
        )
        .await
        .json();
    assert_eq!(tagged["tags"], json!(["docs", "launch"]));
    assert_eq!(tagged["title"], "Beta");
}

#[tokio::test]
async fn test_page_far_past_the_end_is_empty() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    app.create_link(json!({ "originalUrl": "https://example.com", "userId": user_id }))
        .await;

    let res = app
        .get(&format!("/api/v1/links?page={}&limit=100", i64::MAX))
        .await;
    assert_eq!(res.status, StatusCode::OK, "{}", res.body);
    let body = res.json();
    assert!(body["links"].as_array().unwrap().is_empty());
    assert_eq!(body["pagination"]["total"], 1);
}

#[tokio::test]
async fn test_bulk_create_reports_each_item() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;

    let res = app
        .send(
            Method::POST,
            "/api/v1/links/bulk",
            Some(json!({
                "userId": user_id,
                "links": [
                    { "originalUrl": "https://example.com/one", "shortCode": "bulk1", "tags": ["q3"] },
                    { "originalUrl": "not a url" },
                    { "originalUrl": "https://example.com/two" },
                    { "originalUrl": "https://example.com/three", "shortCode": "bulk1" },
                    { "originalUrl": "https://example.com/four", "shortCode": "health" },
                ],
            })),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
    let body = res.json();

    assert_eq!(body["summary"], json!({ "total": 5, "successful": 2, "failed": 3 }));
    let created: Vec<i64> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["index"].as_i64().unwrap())
        .collect();
    assert_eq!(created, vec![0, 2]);
    assert_eq!(body["results"][0]["link"]["shortCode"], "bulk1");
    assert!(body["results"][0]["link"]["shortUrl"]
        .as_str()
        .unwrap()
        .ends_with("/bulk1"));

    let failed: Vec<i64> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["index"].as_i64().unwrap())
        .collect();
    assert_eq!(failed, vec![1, 3, 4]);
    assert_eq!(body["errors"][1]["error"], "Short code already exists");

    let stored = app.store.get_link_by_code("bulk1").unwrap().unwrap();
    assert_eq!(stored.user_id, user_id);
    assert_eq!(stored.tags, vec!["q3"]);
    let (_, total) = app
        .store
        .get_links(&crate::db::LinkFilter { user_id: Some(user_id), ..Default::default() })
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_bulk_create_rejects_empty_and_oversized_batches() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;

    let empty = app
        .send(
            Method::POST,
            "/api/v1/links/bulk",
            Some(json!({ "userId": user_id, "links": [] })),
        )
        .await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);

    let items: Vec<Value> = (0..101)
        .map(|i| json!({ "originalUrl": format!("https://example.com/{}", i) }))
        .collect();
    let oversized = app
        .send(
            Method::POST,
            "/api/v1/links/bulk",
            Some(json!({ "userId": user_id, "links": items })),
        )
        .await;
    assert_eq!(oversized.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.get_links(&Default::default()).unwrap().1, 0);
}

#[tokio::test]
async fn test_delete_link_removes_history() {
    let app = TestApp::healthy();
    let user = app.store.add_user("owner@example.com", "Owner").unwrap();
    let mut link = Link {
        short_code: "gone".to_string(),
        original_url: "https://example.com/gone".to_string(),
        user_id: user.id,
        ..Default::default()
    };
    let id = app.store.add_link(&mut link).unwrap();

    assert_eq!(app.get("/gone").await.status, StatusCode::FOUND);
    app.send(Method::POST, &format!("/api/v1/links/{}/health", id), None)
        .await;
    assert_eq!(app.store.count_clicks(id).unwrap(), 1);

    let res = app
        .send(Method::DELETE, &format!("/api/v1/links/{}", id), None)
        .await;
    assert_eq!(res.status, StatusCode::NO_CONTENT);

    assert_eq!(
        app.get(&format!("/api/v1/links/{}", id)).await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(app.get("/gone").await.status, StatusCode::NOT_FOUND);
    assert_eq!(app.store.count_clicks(id).unwrap(), 0);
    assert!(app.store.get_health_checks(id, 10).unwrap().is_empty());

    let again = app
        .send(Method::DELETE, &format!("/api/v1/links/{}", id), None)
        .await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_membership_endpoints() {
    let app = TestApp::healthy();
    let user_id = app.create_user().await;
    let org_id = app
        .send(Method::POST, "/api/v1/organizations", Some(json!({ "name": "Acme" })))
        .await
        .json()["id"]
        .as_i64()
        .unwrap();

    let added = app
        .send(
            Method::POST,
            &format!("/api/v1/organizations/{}/members", org_id),
            Some(json!({ "userId": user_id, "role": "ADMIN" })),
        )
        .await;
    assert_eq!(added.status, StatusCode::CREATED);
    assert_eq!(added.json()["role"], "ADMIN");

    let bad_role = app
        .send(
            Method::POST,
            &format!("/api/v1/organizations/{}/members", org_id),
            Some(json!({ "userId": user_id, "role": "OVERLORD" })),
        )
        .await;
    assert_eq!(bad_role.status, StatusCode::BAD_REQUEST);

    let removed = app
        .send(
            Method::DELETE,
            &format!("/api/v1/organizations/{}/members/{}", org_id, user_id),
            None,
        )
        .await;
    assert_eq!(removed.status, StatusCode::NO_CONTENT);

    let bad_color = app
        .send(
            Method::POST,
            "/api/v1/organizations",
            Some(json!({ "name": "Evil", "primaryColor": "red;}</style>" })),
        )
        .await;
    assert_eq!(bad_color.status, StatusCode::BAD_REQUEST);

    let notifications = app
        .get(&format!("/api/v1/users/{}/notifications", user_id))
        .await;
    assert_eq!(notifications.status, StatusCode::OK);
    assert_eq!(notifications.json(), json!([]));
}
