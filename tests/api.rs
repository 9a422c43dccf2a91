use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use sharecgt::engine::Engine;
use sharecgt::server::app_router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app() -> Router {
    app_router(Arc::new(Engine::in_memory()), Duration::from_secs(30))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

async fn seed(app: &Router) {
    let (status, _) = send(
        app,
        Method::POST,
        "/api/vestings",
        Some(json!({
            "date": "2024-05-01",
            "shares_vested": 100,
            "price_usd": 50,
            "exchange_rate": 1.25
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, sale) = send(
        app,
        Method::POST,
        "/api/sales",
        Some(json!({
            "date": "2024-09-01",
            "shares_sold": 40,
            "sale_price_usd": 60,
            "exchange_rate": 1.25
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sale["id"], 2);
}

#[tokio::test]
async fn summary_after_ledger_changes() {
    let app = app();
    seed(&app).await;

    let (status, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["tax_year"], "2024/25");
    assert_eq!(summary["total_proceeds"], 1920.0);
    assert_eq!(summary["total_cost"], 1600.0);
    assert_eq!(summary["net_gain"], 320.0);
    assert_eq!(summary["cgt_allowance_gbp"], 3000.0);
    assert_eq!(summary["estimated_cgt"], 0.0);
    assert_eq!(summary["effective_rate_percent"], 0.0);
}

#[tokio::test]
async fn transactions_and_trace() {
    let app = app();
    seed(&app).await;

    let (status, body) = send(&app, Method::GET, "/api/transactions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let item = &body["items"][0];
    assert_eq!(item["matching_type"], "Section 104");
    assert_eq!(item["fragment_index"], 1);
    assert_eq!(item["gain_gbp"], 320.0);
    assert_eq!(item["pool_rsu_pct"], 100.0);

    let id = item["disposal_id"].as_u64().unwrap();
    let (status, detail) = send(&app, Method::GET, &format!("/api/transaction/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!detail["calculation"]["equations"].as_array().unwrap().is_empty());
    assert!(!detail["steps"].as_array().unwrap().is_empty());

    let (status, body) = send(&app, Method::GET, "/api/transaction/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn recalc_is_idempotent() {
    let app = app();
    seed(&app).await;

    let req = json!({ "tax_year": 2024 });
    let (status, first) = send(&app, Method::POST, "/api/recalc", Some(req.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = send(&app, Method::POST, "/api/recalc", Some(req)).await;
    assert_eq!(first, second);
    assert_eq!(first["net_gain"], 320.0);

    let (_, steps) = send(&app, Method::GET, "/api/calculation-steps?tax_year=2024&sale_id=2", None).await;
    let steps = steps.as_array().unwrap();
    assert!(!steps.is_empty());
    assert!(steps.iter().all(|s| s["sale_input_id"] == 2));

    let (status, cleared) = send(&app, Method::DELETE, "/api/calculation-steps", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(cleared["removed"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn validation_rejected_without_mutation() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/espp",
        Some(json!({
            "date": "2024-05-01",
            "shares_retained": 10,
            "purchase_price_usd": 8.49,
            "market_price_usd": 10,
            "exchange_rate": 1.25,
            "qualifying": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let (_, list) = send(&app, Method::GET, "/api/espp", None).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn oversell_is_a_conflict() {
    let app = app();
    seed(&app).await;
    send(
        &app,
        Method::POST,
        "/api/sales",
        Some(json!({
            "date": "2024-10-01",
            "shares_sold": 500,
            "sale_price_usd": 60,
            "exchange_rate": 1.25
        })),
    )
    .await;

    let (status, body) = send(&app, Method::POST, "/api/recalc", Some(json!({ "tax_year": 2024 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);

    // previous result still served
    let (status, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["net_gain"], 320.0);
}

#[tokio::test]
async fn missing_rate_is_unavailable() {
    let app = app();
    send(
        &app,
        Method::POST,
        "/api/vestings",
        Some(json!({ "date": "2024-05-01", "shares_vested": 100, "price_usd": 50 })),
    )
    .await;
    send(
        &app,
        Method::POST,
        "/api/sales",
        Some(json!({ "date": "2024-09-01", "shares_sold": 40, "sale_price_usd": 60 })),
    )
    .await;

    let (status, _) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/rates",
        Some(json!({ "date": "2024-04-30", "usd_gbp": 1.25 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["net_gain"], 320.0);
}

#[tokio::test]
async fn rates_upload_and_delete() {
    let app = app();
    let csv = "Date,XUDLUSS\n02 Jan 24,1.2714\n03 Jan 24,1.2620\nbad,row\n";
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/rates/upload")
        .header(header::CONTENT_TYPE, "text/csv")
        .body(Body::from(csv))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let summary: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(summary["inserted"], 2);
    assert_eq!(summary["skipped"], 1);

    let (status, _) = send(&app, Method::DELETE, "/api/rates/2024-01-02", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, rates) = send(&app, Method::GET, "/api/rates", None).await;
    assert_eq!(rates.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, "/api/rates/2024-01-02", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::DELETE, "/api/rates/yesterday", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn settings_drive_band_split() {
    let app = app();
    send(
        &app,
        Method::POST,
        "/api/vestings",
        Some(json!({ "date": "2024-05-01", "shares_vested": 1000, "price_usd": 50, "exchange_rate": 1.25 })),
    )
    .await;
    send(
        &app,
        Method::POST,
        "/api/sales",
        Some(json!({ "date": "2024-09-01", "shares_sold": 1000, "sale_price_usd": 75, "exchange_rate": 1.25 })),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/settings",
        Some(json!({ "key": "NonSavingsIncome", "value": 30700 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(summary["basic_taxable_gain"], 7000.0);
    assert_eq!(summary["higher_taxable_gain"], 10000.0);
    assert_eq!(summary["estimated_cgt"], 2700.0);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/settings",
        Some(json!({ "key": "Bogus", "value": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/carry-forward",
        Some(json!({ "tax_year": 2024, "amount": 2000 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(summary["carry_forward_used_gbp"], 2000.0);
    assert_eq!(summary["net_gain_after_losses"], 18000.0);
}

#[tokio::test]
async fn sa108_export() {
    let app = app();
    let (status, _) = send(&app, Method::GET, "/api/export/sa108/2024", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    seed(&app).await;
    let (status, export) = send(&app, Method::GET, "/api/export/sa108/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["total_proceeds"], 1920.0);
    assert_eq!(export["total_gains"], 320.0);
    assert_eq!(export["disposals"][0]["description"], "Shares disposal (match: Section 104)");

    let (status, snapshot) = send(&app, Method::GET, "/api/snapshot/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["total_shares"], 60.0);
    assert_eq!(snapshot["sales"][0]["pool_after"][0]["entry"], "V:1");

    let (_, years) = send(&app, Method::GET, "/api/tax_years", None).await;
    assert_eq!(years, json!([2024]));
}

#[tokio::test]
async fn ledger_crud() {
    let app = app();
    seed(&app).await;

    let (status, updated) = send(
        &app,
        Method::PUT,
        "/api/sales/2",
        Some(json!({
            "date": "2024-09-01",
            "shares_sold": 50,
            "sale_price_usd": 60,
            "exchange_rate": 1.25
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["id"], 2);

    let (_, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(summary["net_gain"], 400.0);

    // id 2 is a sale, not a vesting
    let (status, _) = send(&app, Method::GET, "/api/vestings/2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::DELETE, "/api/sales/2", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, sales) = send(&app, Method::GET, "/api/sales", None).await;
    assert_eq!(sales, json!([]));
}

#[tokio::test]
async fn pool_and_summary_csv_downloads() {
    let app = app();
    seed(&app).await;

    let (status, body) = send(&app, Method::GET, "/api/export/pool/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    let csv = body.as_str().unwrap();
    assert!(csv.starts_with("tax_year,point,date"));
    assert!(csv.contains("2024/25,sale,2024-09-01,2,60,2400.00,40.00,V:1=60"));
    assert!(csv.contains("2024/25,year end,2025-04-05,,60,2400.00,40.00,V:1=60"));

    let (status, body) = send(&app, Method::GET, "/api/export/summary/2024", None).await;
    assert_eq!(status, StatusCode::OK);
    let mut lines = body.as_str().unwrap().lines();
    assert!(lines.next().unwrap().starts_with("tax_year,start,end"));
    assert!(lines
        .next()
        .unwrap()
        .starts_with("2024/25,2024-04-06,2025-04-05,3000.00,0.00,1,1920.00,1600.00,320.00,320.00"));
    assert!(lines.next().is_none());
}

#[tokio::test]
async fn out_of_range_year_is_bad_request() {
    let app = app();
    seed(&app).await;

    let (status, body) = send(&app, Method::GET, "/api/summary/300000", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let (status, _) = send(&app, Method::GET, "/api/export/pool/-5", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::POST, "/api/recalc", Some(json!({ "tax_year": 2147483647 }))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn espp_paye_flag_defaults_on() {
    let app = app();
    let (status, purchase) = send(
        &app,
        Method::POST,
        "/api/espp",
        Some(json!({
            "date": "2024-06-28",
            "shares_retained": 20,
            "purchase_price_usd": 42.5,
            "market_price_usd": 50,
            "exchange_rate": 1.25,
            "paye_tax_gbp": 30
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(purchase["discount_taxed_paye"], true);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sales",
        Some(json!({
            "date": "2024-09-01",
            "shares_sold": 20,
            "sale_price_usd": 60,
            "exchange_rate": 1.25
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // cost is 20 x $42.50 / 1.25 plus the £30 PAYE charge
    let (_, summary) = send(&app, Method::GET, "/api/summary/2024", None).await;
    assert_eq!(summary["total_cost"], 710.0);
    assert_eq!(summary["net_gain"], 250.0);
}

#[tokio::test]
async fn disposal_ids_unique_across_stale_year() {
    let app = app();
    let entries = [
        ("/api/vestings", json!({ "date": "2023-05-01", "shares_vested": 100, "price_usd": 50, "exchange_rate": 1.25 })),
        ("/api/sales", json!({ "date": "2023-06-01", "shares_sold": 10, "sale_price_usd": 60, "exchange_rate": 1.25 })),
        ("/api/sales", json!({ "date": "2024-06-01", "shares_sold": 10, "sale_price_usd": 60, "exchange_rate": 1.25 })),
    ];
    for (uri, body) in entries {
        let (status, _) = send(&app, Method::POST, uri, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    for year in [2023, 2024] {
        let (status, _) = send(&app, Method::POST, "/api/recalc", Some(json!({ "tax_year": year }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    // 2024 can no longer be matched and keeps its last result
    let oversell = json!({ "date": "2024-07-01", "shares_sold": 1000, "sale_price_usd": 60, "exchange_rate": 1.25 });
    let (status, _) = send(&app, Method::POST, "/api/sales", Some(oversell)).await;
    assert_eq!(status, StatusCode::CREATED);
    let earlier = json!({ "date": "2023-07-01", "shares_sold": 10, "sale_price_usd": 60, "exchange_rate": 1.25 });
    let (status, _) = send(&app, Method::POST, "/api/sales", Some(earlier)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, Method::POST, "/api/recalc", Some(json!({ "tax_year": 2023 }))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, Method::GET, "/api/transactions", None).await;
    let ids: Vec<u64> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["disposal_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);
    let unique: std::collections::BTreeSet<u64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());

    let (_, detail) = send(&app, Method::GET, "/api/transaction/3001", None).await;
    assert_eq!(detail["sale_input_id"], 3);
}
