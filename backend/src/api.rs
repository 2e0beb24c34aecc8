use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{
    get,
    http::header,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use common::req::{HealthResponse, OkResponse, WifiCredentials};
use log::{debug, info};

use crate::{config::Config, error::BridgeError, relay::Relay};

pub const API_KEY_HEADER: &str = "x-api-key";

#[get("/")]
async fn hello() -> impl Responder {
    HttpResponse::Ok().body("mqtt-bridge")
}

#[get("/health")]
async fn health(relay: web::Data<Relay>) -> impl Responder {
    web::Json(HealthResponse {
        ok: true,
        broker_connected: relay.broker_connected(),
    })
}

#[derive(serde::Deserialize, Debug)]
struct KeyQuery {
    api_key: Option<String>,
}

/// Header first, then the `api_key` query parameter.
fn api_key(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from);

    from_header.or_else(|| {
        web::Query::<KeyQuery>::from_query(req.query_string())
            .ok()
            .and_then(|q| q.into_inner().api_key)
    })
}

/// The identifier is unvalidated path input, so it is logged escaped.
fn rejection(mac: &str, reason: impl std::fmt::Display) -> String {
    format!("Rejected config push for {mac:?}: {reason}")
}

// key is checked before the body is parsed
async fn device_config(
    req: HttpRequest,
    mac: web::Path<String>,
    body: web::Bytes,
    relay: web::Data<Relay>,
) -> Result<HttpResponse, BridgeError> {
    if let Err(e) = relay.authorize(api_key(&req).as_deref()) {
        debug!("{}", rejection(&mac, "bad or missing key"));
        return Err(e);
    }

    let mac = mac.into_inner();
    if mac.trim().is_empty() {
        return Err(BridgeError::Validation("Missing mac in path".to_string()));
    }

    let creds: WifiCredentials = serde_json::from_slice(&body).map_err(|e| {
        debug!("{}", rejection(&mac, e));
        BridgeError::Validation("ssid and password are required".to_string())
    })?;

    relay.push_credentials(&mac, &creds).await?;
    Ok(HttpResponse::Ok().json(OkResponse::OK))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(hello)
        .service(health)
        // `[^/]*` lets an empty identifier reach the handler and get a 400
        .route("/device/{mac:[^/]*}/config", web::post().to(device_config))
        .route("/api/device/{mac:[^/]*}/config", web::post().to(device_config));
}

fn cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
        .allowed_header(API_KEY_HEADER)
        .max_age(3600);

    if origins.is_empty() {
        cors.allow_any_origin()
    } else {
        origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

pub async fn new_http_server(relay: Arc<Relay>, config: &Config) -> std::io::Result<()> {
    let origins = config.cors_origins.clone();
    let relay = Data::from(relay);

    info!(
        "MQTT bridge listening on http://{}:{}",
        config.bind_addr, config.port
    );
    info!("Use X-API-KEY header to authenticate requests");

    HttpServer::new(move || {
        App::new()
            .app_data(relay.clone())
            .configure(configure)
            .wrap(cors(&origins))
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use actix_web::{
        http::StatusCode,
        test::{self, TestRequest},
    };
    use serde_json::json;

    use super::*;
    use crate::{
        mqtt::testing::{Published, RecordingPublisher},
        mqtt::QoS,
        relay::RetryPolicy,
    };

    const KEY: &str = "test-key";

    fn relay_with(publisher: Arc<RecordingPublisher>) -> Data<Relay> {
        Data::new(Relay::new(
            publisher,
            KEY,
            Duration::from_millis(200),
            RetryPolicy::NONE,
        ))
    }

    macro_rules! app {
        ($publisher:expr) => {
            test::init_service(
                App::new()
                    .app_data(relay_with($publisher.clone()))
                    .configure(configure),
            )
            .await
        };
    }

    fn push(uri: &str, body: serde_json::Value) -> TestRequest {
        TestRequest::post()
            .uri(uri)
            .insert_header((API_KEY_HEADER, KEY))
            .set_json(body)
    }

    #[actix_web::test]
    async fn forwards_credentials_to_device_topic() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);

        let req = push(
            "/device/AA:BB:CC/config",
            json!({"ssid": "home", "password": "pw123"}),
        );
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"ok": true}));

        assert_eq!(
            publisher.published(),
            vec![Published {
                topic: "devices/AA:BB:CC/config".to_string(),
                payload: br#"{"ssid":"home","password":"pw123"}"#.to_vec(),
                qos: QoS::AtLeastOnce,
            }]
        );
    }

    #[actix_web::test]
    async fn dashboard_path_and_field_names() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);

        let req = push(
            "/api/device/AA:BB:CC/config",
            json!({"wifi_ssid": "home", "wifi_password": ""}),
        );
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, br#"{"ssid":"home","password":""}"#);
    }

    #[actix_web::test]
    async fn key_in_query_string() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);

        let req = TestRequest::post()
            .uri(&format!("/device/AA/config?api_key={KEY}"))
            .set_json(json!({"ssid": "home", "password": "pw"}));
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(publisher.published().len(), 1);
    }

    #[actix_web::test]
    async fn missing_or_wrong_key_is_401_whatever_the_body() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);

        let requests = vec![
            TestRequest::post()
                .uri("/device/AA/config")
                .set_json(json!({"ssid": "home", "password": "pw"})),
            TestRequest::post()
                .uri("/device/AA/config")
                .set_payload("not json"),
            TestRequest::post()
                .uri("/device/AA/config?api_key=nope")
                .insert_header((API_KEY_HEADER, "wrong"))
                .set_json(json!({"ssid": "home", "password": "pw"})),
            TestRequest::post()
                .uri("/device/%20/config")
                .set_json(json!({})),
        ];

        for req in requests {
            let resp = test::call_service(&app, req.to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            let body: serde_json::Value = test::read_body_json(resp).await;
            assert_eq!(body, json!({"error": "Unauthorized"}));
        }
        assert!(publisher.published().is_empty());
    }

    #[actix_web::test]
    async fn malformed_body_is_400_before_broker() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);

        let bodies = vec![
            json!({"ssid": "home"}),
            json!({"password": "pw"}),
            json!({"ssid": 42, "password": "pw"}),
            json!({"ssid": "home", "password": null}),
            json!(["home", "pw"]),
        ];
        for body in bodies {
            let resp = test::call_service(&app, push("/device/AA/config", body).to_request()).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            let body: serde_json::Value = test::read_body_json(resp).await;
            assert_eq!(body, json!({"error": "ssid and password are required"}));
        }

        let req = TestRequest::post()
            .uri("/device/AA/config")
            .insert_header((API_KEY_HEADER, KEY))
            .set_payload("{broken");
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(publisher.published().is_empty());
    }

    #[actix_web::test]
    async fn blank_or_wildcard_identifier_is_400() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);
        let creds = json!({"ssid": "home", "password": "pw"});

        let resp = test::call_service(
            &app,
            push("/device/%20/config", creds.clone()).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"error": "Missing mac in path"}));

        let resp = test::call_service(&app, push("/device/%23/config", creds).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(publisher.published().is_empty());
    }

    #[actix_web::test]
    async fn publish_failure_is_500() {
        let publisher = Arc::new(RecordingPublisher::failing(1));
        let app = app!(publisher);

        let req = push("/device/AA/config", json!({"ssid": "home", "password": "pw"}));
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"error": "Failed to publish"}));
    }

    #[actix_web::test]
    async fn unacknowledged_publish_is_500() {
        let publisher = Arc::new(RecordingPublisher::stalled());
        let app = app!(publisher);

        let req = push("/device/AA/config", json!({"ssid": "home", "password": "pw"}));
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn concurrent_pushes_do_not_cross() {
        let publisher = Arc::new(RecordingPublisher::delayed(Duration::from_millis(20)));
        let app = app!(publisher);

        let first = push(
            "/device/AA:AA/config",
            json!({"ssid": "first", "password": "one"}),
        )
        .to_request();
        let second = push(
            "/device/BB:BB/config",
            json!({"ssid": "second", "password": "two"}),
        )
        .to_request();

        let (a, b) = tokio::join!(
            test::call_service(&app, first),
            test::call_service(&app, second)
        );
        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);

        let mut published = publisher.published();
        published.sort_by(|x, y| x.topic.cmp(&y.topic));
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "devices/AA:AA/config");
        assert_eq!(published[0].payload, br#"{"ssid":"first","password":"one"}"#);
        assert_eq!(published[1].topic, "devices/BB:BB/config");
        assert_eq!(published[1].payload, br#"{"ssid":"second","password":"two"}"#);
    }

    #[actix_web::test]
    async fn health_reports_broker_state() {
        let publisher = Arc::new(RecordingPublisher::new());
        let app = app!(publisher);

        let resp = test::call_service(&app, TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: HealthResponse = test::read_body_json(resp).await;
        assert_eq!(
            body,
            HealthResponse {
                ok: true,
                broker_connected: true
            }
        );
    }

    #[test]
    fn header_beats_query() {
        let req = TestRequest::post()
            .uri("/device/AA/config?api_key=from-query")
            .insert_header((API_KEY_HEADER, "from-header"))
            .to_http_request();
        assert_eq!(api_key(&req).as_deref(), Some("from-header"));

        let req = TestRequest::post()
            .uri("/device/AA/config?api_key=from-query")
            .insert_header((API_KEY_HEADER, ""))
            .to_http_request();
        assert_eq!(api_key(&req).as_deref(), Some("from-query"));

        let req = TestRequest::post().uri("/device/AA/config").to_http_request();
        assert_eq!(api_key(&req), None);
    }

    #[test]
    fn rejections_escape_the_identifier() {
        let line = rejection("AA\nforged entry\u{1b}[31m", "bad or missing key");
        assert_eq!(
            line,
            r#"Rejected config push for "AA\nforged entry\u{1b}[31m": bad or missing key"#
        );
        assert!(!line.contains('\n'));
    }
}
