//! End-to-end router tests: the mirror in front of a fake upstream site.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use common::{FakeResolver, FakeTool};
use std::io::Cursor;
use std::sync::Arc;
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use workshop_mirror::acquisition::pipeline::AcquisitionPipeline;
use workshop_mirror::proxy::Upstream;
use workshop_mirror::rest::{router, AppState};

struct Mirror {
    _scratch: tempfile::TempDir,
    app: Router,
}

fn mirror(upstream: &MockServer) -> Mirror {
    let scratch = tempfile::tempdir().unwrap();
    let archives = scratch.path().join("archives");
    std::fs::create_dir_all(&archives).unwrap();
    let pipeline = AcquisitionPipeline::new(
        Arc::new(FakeTool::new(scratch.path().join("content"))),
        Arc::new(FakeResolver::default().with_item(20, "Cool Map")),
        archives,
    );
    let upstream = Upstream::new(Url::parse(&upstream.uri()).unwrap()).unwrap();
    Mirror {
        _scratch: scratch,
        app: router(Arc::new(AppState { pipeline, upstream })),
    }
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "localhost:8080")
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_html_page_is_rewritten() {
    let server = MockServer::start().await;
    let page = format!(
        r#"<html><head><title>Steam Community :: Workshop</title></head><body>
        <div><div><a onclick="SubscribeItem('123','4000');">Subscribe</a></div></div>
        <a id="home" href="{}/workshop/browse/?appid=4000">Browse</a>
        <img src="https://akamai.steamstatic.com/icon.png">
        </body></html>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/workshop/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(page, "text/html; charset=utf-8")
                .insert_header("Content-Security-Policy", "default-src 'self'")
                .insert_header("X-Frame-Options", "DENY"),
        )
        .mount(&server)
        .await;
    let m = mirror(&server);

    let resp = send(&m.app, get("/workshop/")).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("content-security-policy").is_none());
    assert!(resp.headers().get("x-frame-options").is_none());
    let declared: usize = resp.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = String::from_utf8(body_bytes(resp).await).unwrap();
    assert_eq!(declared, body.len());
    assert!(body.contains("<title>Workshop Mirror :: Workshop</title>"));
    assert!(body.contains(r#"href="/api/workshop/4000/123""#));
    assert!(body.contains(r#"href="/workshop/browse/?appid=4000""#));
    assert!(body.contains(r#"src="/icon.png""#));
}

#[tokio::test]
async fn test_redirect_location_stays_on_mirror() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app/4000"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "https://steamcommunity.com/app/4000/workshop/"),
        )
        .mount(&server)
        .await;
    let m = mirror(&server);

    let resp = send(&m.app, get("/app/4000")).await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[header::LOCATION], "/app/4000/workshop/");
}

#[tokio::test]
async fn test_non_html_ajax_endpoint_is_made_relative() {
    let server = MockServer::start().await;
    let script = format!(
        "var url = '{}/workshop/ajaxfindworkshops';",
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/public/javascript/workshop.js"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(script, "application/javascript"))
        .mount(&server)
        .await;
    let m = mirror(&server);

    let resp = send(&m.app, get("/public/javascript/workshop.js")).await;

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_bytes(resp).await;
    assert_eq!(body, b"var url = '/workshop/ajaxfindworkshops';");
}

#[tokio::test]
async fn test_outbound_request_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/workshop/browse/"))
        .and(query_param("appid", "4000"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("ok", "text/plain"))
        .expect(1)
        .mount(&server)
        .await;
    let m = mirror(&server);

    let req = Request::builder()
        .uri("/workshop/browse/?appid=4000")
        .header(header::HOST, "localhost:8080")
        .header(header::ACCEPT_ENCODING, "gzip, deflate, br")
        .header(header::REFERER, "http://localhost:8080/workshop/")
        .header(header::COOKIE, "timezoneOffset=0")
        .body(Body::empty())
        .unwrap();
    let resp = send(&m.app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let headers = &received[0].headers;
    assert!(headers.get("accept-encoding").is_none());
    assert_eq!(
        headers.get("referer").unwrap().to_str().unwrap(),
        format!("{}/workshop/", server.uri())
    );
    assert_eq!(headers.get("cookie").unwrap(), "timezoneOffset=0");
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sharedfiles/voteup"))
        .and(body_string("id=123&sessionid=x"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"success":1}"#, "application/json"))
        .expect(1)
        .mount(&server)
        .await;
    let m = mirror(&server);

    let req = Request::builder()
        .method("POST")
        .uri("/sharedfiles/voteup")
        .header(header::HOST, "localhost:8080")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("id=123&sessionid=x"))
        .unwrap();
    let resp = send(&m.app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, br#"{"success":1}"#);
}

#[tokio::test]
async fn test_item_download_streams_archive() {
    let server = MockServer::start().await;
    let m = mirror(&server);

    let resp = send(&m.app, get("/api/workshop/4000/20")).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/zip");
    assert_eq!(
        resp.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"20_Cool Map.zip\""
    );
    let declared: usize = resp.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = body_bytes(resp).await;
    assert_eq!(declared, body.len());

    let mut archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
    assert!(archive.by_name("20_Cool Map/20.txt").is_ok());

    // Served from the cache the second time.
    let again = send(&m.app, get("/api/workshop/4000/20")).await;
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unresolvable_item_is_not_found() {
    let server = MockServer::start().await;
    let m = mirror(&server);

    let resp = send(&m.app, get("/api/workshop/4000/77")).await;

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = String::from_utf8(body_bytes(resp).await).unwrap();
    assert!(!body.contains('/'));
}
