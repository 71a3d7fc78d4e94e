use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use berth_api::{app, AppState, MonitorConfig, PaymentMonitor};
use berth_core::telemetry::FanoutSink;
use berth_core::{EventSink, Package, PaymentStatus, Provider, ProviderRegistry, RefundPolicy};
use berth_gateway::{MockBehavior, MockPaymentAdapter};
use berth_order::{Ledgers, OrchestratorConfig, PaymentOrchestrator, WebhookReconciler};
use berth_store::InMemoryStore;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const PRICE: i64 = 50_000;

struct Harness {
    app: Router,
    global: Arc<MockPaymentAdapter>,
    package: Package,
}

fn harness(max_guests: u32) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let package = Package {
        id: Uuid::new_v4(),
        name: "Sunset Cruise".to_string(),
        max_guests,
        price_per_guest: PRICE,
        currency: "USD".to_string(),
        refund_policy: RefundPolicy::default(),
    };
    store.insert_package(package.clone());

    let global = Arc::new(MockPaymentAdapter::new(Provider::Global));
    let regional = Arc::new(MockPaymentAdapter::new(Provider::Regional));
    let registry = ProviderRegistry::new(global.clone(), regional, vec!["NGN".to_string()]);

    let monitor = Arc::new(PaymentMonitor::new(MonitorConfig::default()).unwrap());
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(vec![monitor.clone() as Arc<dyn EventSink>]));
    let ledgers = Ledgers::from_store(store.clone());

    let state = AppState {
        orchestrator: Arc::new(PaymentOrchestrator::new(
            ledgers.clone(),
            registry.clone(),
            sink.clone(),
            OrchestratorConfig::default(),
        )),
        reconciler: Arc::new(WebhookReconciler::new(ledgers, registry, sink)),
        review: store,
        monitor,
        rate_limit: None,
    };

    Harness {
        app: app(state),
        global,
        package,
    }
}

fn date_in(days: i64) -> String {
    (Utc::now().date_naive() + ChronoDuration::days(days)).to_string()
}

fn initiate_body(h: &Harness, guests: u32, days_ahead: i64) -> Value {
    json!({
        "packageId": h.package.id,
        "date": date_in(days_ahead),
        "guestCount": guests,
        "currency": "USD",
        "customer": { "email": "guest@example.com", "name": "Ada" }
    })
}

async fn send_raw(h: &Harness, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = h.app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send(h: &Harness, req: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send_raw(h, req).await;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn webhook(h: &Harness, payload: &Value) -> Request<Body> {
    let raw = payload.to_string();
    Request::builder()
        .method("POST")
        .uri("/webhooks/global")
        .header("content-type", "application/json")
        .header(Provider::Global.signature_header(), h.global.sign(raw.as_bytes()))
        .body(Body::from(raw))
        .unwrap()
}

async fn initiate(h: &Harness, guests: u32, days_ahead: i64) -> Value {
    let (status, body) = send(h, post_json("/bookings/initiate", &initiate_body(h, guests, days_ahead))).await;
    assert_eq!(status, StatusCode::OK, "initiate failed: {}", body);
    body
}

/// Initiate and settle through a success webhook
async fn confirmed_booking(h: &Harness, guests: u32, days_ahead: i64) -> Value {
    let session = initiate(h, guests, days_ahead).await;
    let (status, ack) = send(
        h,
        webhook(
            h,
            &json!({
                "id": format!("evt_{}", Uuid::new_v4().simple()),
                "type": "payment.succeeded",
                "attemptId": session["attemptId"],
                "amount": PRICE * i64::from(guests),
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "APPLIED");
    session
}

#[tokio::test]
async fn test_health_is_plain_ok() {
    let h = harness(5);
    let (status, body) = send_raw(&h, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_initiate_returns_payment_session() {
    let h = harness(5);
    let session = initiate(&h, 2, 30).await;

    assert_eq!(session["provider"], "GLOBAL");
    assert_eq!(session["status"], "PROCESSING");
    assert_eq!(session["attemptNumber"], 1);
    assert!(session["bookingId"].is_string());
    assert_eq!(
        session["reference"],
        MockPaymentAdapter::reference_for(session["attemptId"].as_str().unwrap().parse().unwrap())
    );
}

#[tokio::test]
async fn test_sold_out_reports_remaining_spots() {
    let h = harness(3);
    initiate(&h, 2, 30).await;

    let (status, body) = send(&h, post_json("/bookings/initiate", &initiate_body(&h, 2, 30))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SOLD_OUT");
    assert_eq!(body["remainingSpots"], 1);
}

#[tokio::test]
async fn test_bad_requests_use_the_error_shape() {
    let h = harness(3);

    let (status, body) = send(&h, post_json("/bookings/initiate", &json!({ "guestCount": 2 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let mut zero_guests = initiate_body(&h, 1, 30);
    zero_guests["guestCount"] = json!(0);
    let (status, body) = send(&h, post_json("/bookings/initiate", &zero_guests)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = send(&h, get("/bookings/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_unknown_package_and_booking_are_404() {
    let h = harness(3);
    let mut body = initiate_body(&h, 1, 30);
    body["packageId"] = json!(Uuid::new_v4());

    let (status, err) = send(&h, post_json("/bookings/initiate", &body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "NOT_FOUND");

    let (status, _) = send(&h, get(&format!("/bookings/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_decline_is_402_and_transport_is_502() {
    let h = harness(3);

    h.global.set_behavior(MockBehavior::Decline("card declined".to_string()));
    let (status, body) = send(&h, post_json("/bookings/initiate", &initiate_body(&h, 1, 30))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_DECLINED");
    assert!(body["message"].as_str().unwrap().contains("card declined"));

    h.global.set_behavior(MockBehavior::Transport);
    let (status, body) = send(&h, post_json("/bookings/initiate", &initiate_body(&h, 1, 30))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "PROVIDER_UNAVAILABLE");
}

#[tokio::test]
async fn test_success_webhook_confirms_once() {
    let h = harness(5);
    let session = initiate(&h, 2, 30).await;
    let event = json!({
        "id": "evt_success_1",
        "type": "payment.succeeded",
        "attemptId": session["attemptId"],
        "amount": PRICE * 2,
    });

    let (status, ack) = send(&h, webhook(&h, &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "APPLIED");

    let (status, ack) = send(&h, webhook(&h, &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "DUPLICATE");

    let (_, view) = send(&h, get(&format!("/bookings/{}", session["bookingId"].as_str().unwrap()))).await;
    assert_eq!(view["booking"]["status"], "CONFIRMED");
    assert_eq!(view["attempts"][0]["status"], "SUCCEEDED");

    let (_, metrics) = send_raw(&h, get("/metrics")).await;
    let metrics = String::from_utf8(metrics).unwrap();
    assert!(metrics.contains("berth_payments_succeeded_total 1"));
}

#[tokio::test]
async fn test_webhook_signature_and_provider_checks() {
    let h = harness(5);
    let raw = json!({ "id": "evt_forged", "type": "payment.succeeded" }).to_string();

    let forged = Request::builder()
        .method("POST")
        .uri("/webhooks/global")
        .header(Provider::Global.signature_header(), "deadbeef")
        .body(Body::from(raw.clone()))
        .unwrap();
    let (status, body) = send(&h, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "INVALID_SIGNATURE");

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/global")
        .body(Body::from(raw.clone()))
        .unwrap();
    let (status, _) = send(&h, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&h, post_json("/webhooks/paypal", &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (_, metrics) = send_raw(&h, get("/metrics")).await;
    assert!(String::from_utf8(metrics)
        .unwrap()
        .contains("berth_payments_webhooks_rejected_total 2"));
}

#[tokio::test]
async fn test_dispute_is_parked_for_review() {
    let h = harness(5);
    let session = confirmed_booking(&h, 1, 30).await;

    let (status, ack) = send(
        &h,
        webhook(
            &h,
            &json!({ "id": "evt_dispute", "type": "dispute.opened", "attemptId": session["attemptId"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "PARKED");

    let (status, items) = send(&h, get("/admin/reconciliation")).await;
    assert_eq!(status, StatusCode::OK);
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["externalEventId"], "evt_dispute");
    assert_eq!(items[0]["attemptId"], session["attemptId"]);
}

#[tokio::test]
async fn test_retry_after_failed_payment() {
    let h = harness(5);
    let session = initiate(&h, 2, 30).await;
    let booking_id = session["bookingId"].as_str().unwrap().to_string();

    let (_, ack) = send(
        &h,
        webhook(
            &h,
            &json!({ "id": "evt_fail", "type": "payment.failed", "attemptId": session["attemptId"] }),
        ),
    )
    .await;
    assert_eq!(ack["status"], "APPLIED");

    let (status, retried) = send(&h, post_json(&format!("/bookings/{}/retry", booking_id), &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["attemptNumber"], 2);
    assert_eq!(retried["bookingId"], booking_id.as_str());
    assert_ne!(retried["attemptId"], session["attemptId"]);

    // A live attempt blocks another retry
    let (status, body) = send(&h, post_json(&format!("/bookings/{}/retry", booking_id), &json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "RETRY_NOT_ALLOWED");
}

#[tokio::test]
async fn test_confirm_settles_from_provider_status() {
    let h = harness(5);
    let session = initiate(&h, 1, 30).await;
    h.global.set_verify_status(PaymentStatus::Succeeded);

    let (status, outcome) = send(
        &h,
        post_json(
            &format!("/payments/{}/confirm", session["attemptId"].as_str().unwrap()),
            &json!({}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["attempt"]["status"], "SUCCEEDED");
    assert_eq!(outcome["bookingStatus"], "CONFIRMED");
}

#[tokio::test]
async fn test_partial_refund_for_half_the_guests() {
    let h = harness(10);
    let session = confirmed_booking(&h, 4, 3).await;

    let (status, outcome) = send(
        &h,
        post_json(
            &format!("/bookings/{}/refund", session["bookingId"].as_str().unwrap()),
            &json!({ "guestCount": 2 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", outcome);
    assert_eq!(outcome["decision"]["tier"], "PARTIAL");
    assert_eq!(outcome["decision"]["amount"], 50_000);
    assert_eq!(outcome["remainingGuests"], 2);
    assert_eq!(outcome["attemptStatus"], "PARTIALLY_REFUNDED");
    assert_eq!(outcome["bookingStatus"], "CONFIRMED");
}

#[tokio::test]
async fn test_refund_errors() {
    let h = harness(10);

    let late = confirmed_booking(&h, 1, 1).await;
    let (status, body) = send(
        &h,
        Request::builder()
            .method("POST")
            .uri(format!("/bookings/{}/refund", late["bookingId"].as_str().unwrap()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "REFUND_WINDOW_CLOSED");

    let unpaid = initiate(&h, 1, 30).await;
    let (status, body) = send(
        &h,
        post_json(
            &format!("/bookings/{}/refund", unpaid["bookingId"].as_str().unwrap()),
            &json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NO_REFUNDABLE_PAYMENT");
}
