use super::dto::{
    money, CarryForwardRequest, RecalcRequest, RecalcResponse, Sa108Response, SettingRequest,
    SettingsResponse, SnapshotResponse, StepsQuery, SummaryResponse, TransactionDetail,
    TransactionItem, TransactionsQuery, TransactionsResponse,
};
use super::error::{ApiError, ApiResult};
use crate::core::sa108::{write_disposals_csv, write_pool_csv, write_summary_csv};
use crate::core::{
    CalculationStep, EngineError, EntryId, EntryKind, EsppPurchase, ExchangeRate, ImportSummary,
    LedgerEntry, Sale, TaxYear, Vesting,
};
use crate::engine::Engine;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

/// Run engine work off the async runtime. Recalculation holds locks and can
/// take a while on a large ledger.
async fn blocking<T, F>(engine: &Arc<Engine>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
{
    let engine = engine.clone();
    Ok(task::spawn_blocking(move || f(&engine)).await??)
}

fn tax_year(year: i32) -> ApiResult<TaxYear> {
    Ok(TaxYear::new(year).map_err(EngineError::from)?)
}

fn parse_date(s: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| ApiError::BadRequest(format!("invalid date {:?}: {}", s, e)))
}

// ---- derived results ----

async fn list_transactions(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<TransactionsQuery>,
) -> ApiResult<Json<TransactionsResponse>> {
    let items = blocking(&engine, move |e| Ok(q.apply(&e.all_fragments()))).await?;
    Ok(Json(TransactionsResponse {
        count: items.len(),
        items,
    }))
}

async fn get_transaction(
    Path(id): Path<u64>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<TransactionDetail>> {
    let (fragment, steps) = blocking(&engine, move |e| {
        let fragment = e.fragment(id)?;
        let steps = e.steps(Some(fragment.tax_year), Some(fragment.sale_input_id));
        Ok((fragment, steps))
    })
    .await?;
    Ok(Json(TransactionDetail {
        item: TransactionItem::from(&fragment),
        calculation: fragment.trace,
        steps,
    }))
}

async fn get_snapshot(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<SnapshotResponse>> {
    let year = tax_year(year)?;
    let response = blocking(&engine, move |e| {
        let sales = e.snapshots(year)?;
        let result = e.result(year)?;
        Ok(SnapshotResponse::new(year, &sales, result.year_end.as_ref()))
    })
    .await?;
    Ok(Json(response))
}

async fn get_summary(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<SummaryResponse>> {
    let year = tax_year(year)?;
    let summary = blocking(&engine, move |e| e.summary(year)).await?;
    Ok(Json(SummaryResponse::from(&summary)))
}

async fn recalc(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<RecalcRequest>,
) -> ApiResult<Json<RecalcResponse>> {
    let result = blocking(&engine, move |e| e.recalculate(req.tax_year)).await?;
    Ok(Json(RecalcResponse {
        tax_year: result.tax_year,
        ledger_version: result.ledger_version,
        fragments: result.fragments.len(),
        net_gain: money(result.summary.net_gain),
    }))
}

async fn list_steps(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<StepsQuery>,
) -> ApiResult<Json<Vec<CalculationStep>>> {
    let steps = blocking(&engine, move |e| Ok(e.steps(q.tax_year, q.sale_id))).await?;
    Ok(Json(steps))
}

async fn clear_steps(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<StepsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = blocking(&engine, move |e| e.clear_steps(q.tax_year)).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn export_sa108(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<Sa108Response>> {
    let year = tax_year(year)?;
    let export = blocking(&engine, move |e| e.sa108(year)).await?;
    Ok(Json(Sa108Response::from(&export)))
}

fn csv_response(
    write: impl FnOnce(&mut Vec<u8>) -> csv::Result<()>,
) -> ApiResult<impl IntoResponse> {
    let mut body = Vec::new();
    write(&mut body).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/csv")], body))
}

async fn export_disposals(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<impl IntoResponse> {
    let year = tax_year(year)?;
    let result = blocking(&engine, move |e| e.result(year)).await?;
    csv_response(move |out| write_disposals_csv(out, &result.fragments))
}

async fn export_pool(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<impl IntoResponse> {
    let year = tax_year(year)?;
    let result = blocking(&engine, move |e| e.result(year)).await?;
    csv_response(move |out| write_pool_csv(out, year, &result.snapshots, result.year_end.as_ref()))
}

async fn export_summary(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<impl IntoResponse> {
    let year = tax_year(year)?;
    let summary = blocking(&engine, move |e| e.summary(year)).await?;
    csv_response(move |out| write_summary_csv(out, &summary))
}

async fn list_tax_years(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Vec<TaxYear>>> {
    Ok(Json(blocking(&engine, |e| Ok(e.tax_years())).await?))
}

// ---- ledger ----

/// A ledger record as posted to its own collection
trait Record: Serialize + DeserializeOwned + Send + 'static {
    const KIND: EntryKind;
    fn into_entry(self) -> LedgerEntry;
    fn from_entry(entry: LedgerEntry) -> Option<Self>;
}

impl Record for Vesting {
    const KIND: EntryKind = EntryKind::Vesting;
    fn into_entry(self) -> LedgerEntry {
        LedgerEntry::Vesting(self)
    }
    fn from_entry(entry: LedgerEntry) -> Option<Self> {
        match entry {
            LedgerEntry::Vesting(v) => Some(v),
            _ => None,
        }
    }
}

impl Record for EsppPurchase {
    const KIND: EntryKind = EntryKind::Espp;
    fn into_entry(self) -> LedgerEntry {
        LedgerEntry::Espp(self)
    }
    fn from_entry(entry: LedgerEntry) -> Option<Self> {
        match entry {
            LedgerEntry::Espp(p) => Some(p),
            _ => None,
        }
    }
}

impl Record for Sale {
    const KIND: EntryKind = EntryKind::Sale;
    fn into_entry(self) -> LedgerEntry {
        LedgerEntry::Sale(self)
    }
    fn from_entry(entry: LedgerEntry) -> Option<Self> {
        match entry {
            LedgerEntry::Sale(s) => Some(s),
            _ => None,
        }
    }
}

fn expect_record<R: Record>(entry: LedgerEntry) -> ApiResult<R> {
    let id = entry.id();
    R::from_entry(entry).ok_or(ApiError::Engine(EngineError::EntryNotFound { kind: R::KIND, id }))
}

async fn list_records<R: Record>(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Vec<R>>> {
    let entries = blocking(&engine, |e| Ok(e.entries(R::KIND))).await?;
    Ok(Json(entries.into_iter().filter_map(R::from_entry).collect()))
}

async fn get_record<R: Record>(
    Path(id): Path<EntryId>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<R>> {
    let entry = blocking(&engine, move |e| e.entry(R::KIND, id)).await?;
    Ok(Json(expect_record(entry)?))
}

async fn create_record<R: Record>(
    State(engine): State<Arc<Engine>>,
    Json(record): Json<R>,
) -> ApiResult<(StatusCode, Json<R>)> {
    let entry = blocking(&engine, move |e| e.add_entry(record.into_entry())).await?;
    Ok((StatusCode::CREATED, Json(expect_record(entry)?)))
}

async fn update_record<R: Record>(
    Path(id): Path<EntryId>,
    State(engine): State<Arc<Engine>>,
    Json(record): Json<R>,
) -> ApiResult<Json<R>> {
    let entry = blocking(&engine, move |e| e.update_entry(id, record.into_entry())).await?;
    Ok(Json(expect_record(entry)?))
}

async fn delete_record<R: Record>(
    Path(id): Path<EntryId>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<StatusCode> {
    blocking(&engine, move |e| e.remove_entry(R::KIND, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn record_routes<R: Record>(collection: &str) -> Router<Arc<Engine>> {
    Router::new()
        .route(collection, get(list_records::<R>).post(create_record::<R>))
        .route(
            &format!("{}/{{id}}", collection),
            get(get_record::<R>)
                .put(update_record::<R>)
                .delete(delete_record::<R>),
        )
}

// ---- rates ----

async fn list_rates(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Vec<ExchangeRate>>> {
    Ok(Json(blocking(&engine, |e| Ok(e.rates())).await?))
}

async fn add_rate(
    State(engine): State<Arc<Engine>>,
    Json(rate): Json<ExchangeRate>,
) -> ApiResult<(StatusCode, Json<ExchangeRate>)> {
    let added = rate.clone();
    blocking(&engine, move |e| e.add_rate(rate)).await?;
    Ok((StatusCode::CREATED, Json(added)))
}

async fn delete_rate(
    Path(date): Path<String>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<ExchangeRate>> {
    let date = parse_date(&date)?;
    let removed = blocking(&engine, move |e| e.remove_rate(date)).await?;
    Ok(Json(removed))
}

/// CSV body, Bank of England export or `date,rate` rows
async fn upload_rates(
    State(engine): State<Arc<Engine>>,
    body: String,
) -> ApiResult<Json<ImportSummary>> {
    let summary = blocking(&engine, move |e| e.import_rates(body.as_bytes())).await?;
    log::info!(
        "Rate upload: {} inserted, {} existing, {} skipped",
        summary.inserted,
        summary.existing,
        summary.skipped
    );
    Ok(Json(summary))
}

// ---- settings ----

async fn get_settings(State(engine): State<Arc<Engine>>) -> ApiResult<Json<SettingsResponse>> {
    let settings = blocking(&engine, |e| Ok(e.settings())).await?;
    Ok(Json(SettingsResponse::from(&settings)))
}

async fn update_setting(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SettingRequest>,
) -> ApiResult<Json<SettingsResponse>> {
    let settings = blocking(&engine, move |e| {
        e.apply_setting(&req.key, req.value)?;
        Ok(e.settings())
    })
    .await?;
    Ok(Json(SettingsResponse::from(&settings)))
}

async fn list_carry_forward(
    State(engine): State<Arc<Engine>>,
) -> ApiResult<Json<BTreeMap<TaxYear, f64>>> {
    let settings = blocking(&engine, |e| Ok(e.settings())).await?;
    Ok(Json(SettingsResponse::from(&settings).carry_forward_losses))
}

async fn set_carry_forward(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CarryForwardRequest>,
) -> ApiResult<StatusCode> {
    blocking(&engine, move |e| e.set_carry_forward(req.tax_year, req.amount)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_carry_forward(
    Path(year): Path<i32>,
    State(engine): State<Arc<Engine>>,
) -> ApiResult<StatusCode> {
    let year = tax_year(year)?;
    blocking(&engine, move |e| e.remove_carry_forward(year)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Requests running past the limit answer 408
fn timeout_layer(request_timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout)
}

pub fn app_router(engine: Arc<Engine>, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/transactions", get(list_transactions))
        .route("/transaction/{id}", get(get_transaction))
        .route("/snapshot/{year}", get(get_snapshot))
        .route("/summary/{year}", get(get_summary))
        .route("/recalc", post(recalc))
        .route("/calculation-steps", get(list_steps).delete(clear_steps))
        .route("/export/sa108/{year}", get(export_sa108))
        .route("/export/disposals/{year}", get(export_disposals))
        .route("/export/pool/{year}", get(export_pool))
        .route("/export/summary/{year}", get(export_summary))
        .route("/tax_years", get(list_tax_years))
        .merge(record_routes::<Vesting>("/vestings"))
        .merge(record_routes::<EsppPurchase>("/espp"))
        .merge(record_routes::<Sale>("/sales"))
        .route("/rates", get(list_rates).post(add_rate))
        .route("/rates/upload", post(upload_rates))
        .route("/rates/{date}", delete(delete_rate))
        .route("/settings", get(get_settings).post(update_setting))
        .route(
            "/carry-forward",
            get(list_carry_forward).post(set_carry_forward),
        )
        .route("/carry-forward/{year}", delete(delete_carry_forward));

    Router::new()
        .nest("/api", api)
        .with_state(engine)
        .layer(cors)
        .layer(timeout_layer(request_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn slow_request_times_out_with_408() {
        let app: Router = Router::new()
            .route("/slow", get(|| std::future::pending::<()>()))
            .layer(timeout_layer(Duration::from_millis(20)));
        let response = app
            .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn year_path_outside_range_is_bad_request() {
        assert!(tax_year(2024).is_ok());
        assert!(matches!(
            tax_year(1899),
            Err(ApiError::Engine(EngineError::Validation(_)))
        ));
    }
}
