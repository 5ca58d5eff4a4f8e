use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use gastos_core::{Money, PayPeriod, Transaction, TransactionFilter};
use gastos_engine::intake::{self, NewInstallmentPurchase, NewRecurring};
use gastos_engine::{
    mark_as_settled, reconciliation_stats, Categorization, FollowUp, GenerationReport,
    MatchSuggestion, NewExpense, NewIncome, ReconciliationStats,
};
use gastos_storage::{list_backups, verify_backup, BackupInfo};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};
use crate::main_lib::{now, AppState};
use crate::notifier::{spawn_delivery, NotifyError};
use crate::scheduler::{backup_now, run_generator};
use crate::telegram::{self, Update, SECRET_HEADER};

const SUGGESTION_LIMIT: usize = 8;

/// Delivers a notification off the request path.
fn spawn_notify<F>(what: &'static str, delivery: F)
where
    F: Future<Output = Result<(), NotifyError>> + Send + 'static,
{
    spawn_delivery(what, delivery);
}

async fn health() -> Json<Value> {
    Json(json!({
        "message": "Expense Management Backend",
        "status": "running",
        "timestamp": now(),
    }))
}

// ── Expenses ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ExpenseResponse {
    success: bool,
    gasto: Transaction,
    auto_categorized: bool,
    confidence: f64,
    categorization: Categorization,
    follow_up: FollowUp,
}

async fn create_gasto(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewExpense>,
) -> ApiResult<Json<ExpenseResponse>> {
    let outcome = intake::ingest_expense(&*state.store, &state.categorizer, new, now()).await?;

    let notifier = state.notifier.clone();
    let tx = outcome.transaction.clone();
    match outcome.follow_up.clone() {
        FollowUp::Categorize { hint } => {
            let options = state
                .categorizer
                .category_suggestions(&tx.descripcion, SUGGESTION_LIMIT);
            spawn_notify("category prompt", async move {
                notifier.notify_categorization(&tx, &hint, &options).await
            });
        }
        FollowUp::Confirm { confidence } => {
            spawn_notify("confirmation prompt", async move {
                notifier.notify_confirmation(&tx, confidence).await
            });
        }
        FollowUp::Share => {
            spawn_notify("sharing prompt", async move {
                notifier.notify_sharing_prompt(&tx).await
            });
        }
    }

    Ok(Json(ExpenseResponse {
        success: true,
        auto_categorized: outcome.auto_categorized(),
        confidence: outcome.categorization.confidence,
        gasto: outcome.transaction,
        categorization: outcome.categorization,
        follow_up: outcome.follow_up,
    }))
}

async fn get_pendientes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let pendientes = intake::list_pendientes(&*state.store).await?;
    Ok(Json(json!({
        "success": true,
        "count": pendientes.len(),
        "pendientes": pendientes,
    })))
}

async fn delete_gasto(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<StatusCode> {
    intake::delete_transaction(&*state.store, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CategoryUpdate {
    gasto_id: String,
    categoria: String,
    #[serde(default)]
    subcategoria: String,
}

async fn update_category(
    State(state): State<Arc<AppState>>,
    Json(update): Json<CategoryUpdate>,
) -> ApiResult<Json<Value>> {
    let gasto = intake::update_category(
        &*state.store,
        &update.gasto_id,
        &update.categoria,
        &update.subcategoria,
    )
    .await?;
    Ok(Json(json!({ "success": true, "gasto": gasto })))
}

#[derive(Deserialize)]
struct ShareUpdate {
    gasto_id: String,
    #[serde(default)]
    compartido_con: String,
    porcentaje_compartido: Decimal,
}

async fn update_share(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ShareUpdate>,
) -> ApiResult<Json<Value>> {
    if update.porcentaje_compartido > Decimal::ZERO && update.compartido_con.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "compartido_con is required when porcentaje_compartido > 0".into(),
        ));
    }
    let gasto = intake::update_sharing(
        &*state.store,
        &update.gasto_id,
        &update.compartido_con,
        update.porcentaje_compartido,
    )
    .await?;
    Ok(Json(json!({ "success": true, "gasto": gasto })))
}

#[derive(Serialize)]
struct SuggestionsResponse {
    success: bool,
    categorization: Categorization,
    suggestions: Vec<String>,
}

async fn get_suggestions(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SuggestionsResponse>> {
    let tx = state.store.require(&id).await?;
    Ok(Json(SuggestionsResponse {
        success: true,
        categorization: state.categorizer.categorize_one(&tx.descripcion),
        suggestions: state
            .categorizer
            .category_suggestions(&tx.descripcion, SUGGESTION_LIMIT),
    }))
}

#[derive(Deserialize)]
struct MerchantIn {
    merchant: String,
    categoria: String,
    #[serde(default)]
    subcategoria: String,
}

async fn add_merchant(
    State(state): State<Arc<AppState>>,
    Json(alias): Json<MerchantIn>,
) -> ApiResult<Json<Value>> {
    if alias.categoria.trim().is_empty() {
        return Err(ApiError::BadRequest("categoria must not be empty".into()));
    }
    let categorizer = state.categorizer.clone();
    let key = tokio::task::spawn_blocking(move || {
        categorizer.add_merchant_alias(&alias.merchant, &alias.categoria, &alias.subcategoria)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    let key = key.ok_or_else(|| ApiError::BadRequest("merchant has no usable text".into()))?;
    Ok(Json(json!({ "success": true, "merchant": key })))
}

// ── Incomes and reconciliation ────────────────────────────────────────────────

#[derive(Serialize)]
struct IncomeResponse {
    success: bool,
    ingreso: Transaction,
    auto_matched: bool,
    matched_expense: Option<Transaction>,
    suggestions: Vec<MatchSuggestion>,
}

async fn create_ingreso(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewIncome>,
) -> ApiResult<Json<IncomeResponse>> {
    let outcome = intake::ingest_income(&*state.store, &state.matcher, new, now()).await?;

    if let Some(expense) = outcome.matched_expense.clone() {
        let notifier = state.notifier.clone();
        let income = outcome.income.clone();
        spawn_notify("match notification", async move {
            notifier.notify_match(&income, &expense, true).await
        });
    }

    Ok(Json(IncomeResponse {
        success: true,
        auto_matched: outcome.auto_matched(),
        ingreso: outcome.income,
        matched_expense: outcome.matched_expense,
        suggestions: outcome.suggestions,
    }))
}

#[derive(Deserialize)]
struct MatchIn {
    expense_id: String,
    income_id: String,
}

async fn manual_match(
    State(state): State<Arc<AppState>>,
    Json(pair): Json<MatchIn>,
) -> ApiResult<Json<Value>> {
    let settlement =
        mark_as_settled(&*state.store, &pair.expense_id, &pair.income_id, now()).await?;

    let notifier = state.notifier.clone();
    let (income, expense) = (settlement.income.clone(), settlement.expense.clone());
    spawn_notify("match notification", async move {
        notifier.notify_match(&income, &expense, false).await
    });

    Ok(Json(json!({
        "success": true,
        "message": "Expenses matched successfully",
        "expense": settlement.expense,
        "income": settlement.income,
    })))
}

async fn get_receivables(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let (receivables, total) = intake::list_receivables(&*state.store).await?;
    Ok(Json(json!({
        "success": true,
        "count": receivables.len(),
        "total_amount": total,
        "receivables": receivables,
    })))
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct GeneralStats {
    total_transactions: usize,
    total_expenses: usize,
    total_income: usize,
    categories_count: usize,
    period_expenses: usize,
    period_spent: Money,
}

impl GeneralStats {
    fn from_transactions(all: &[Transaction], period: Option<PayPeriod>) -> Self {
        let mut stats = GeneralStats {
            total_transactions: all.len(),
            ..GeneralStats::default()
        };
        let mut categories: Vec<&str> = Vec::new();
        for tx in all {
            if tx.tipo.is_income() {
                stats.total_income += 1;
                continue;
            }
            if tx.tipo.is_template() {
                continue;
            }
            stats.total_expenses += 1;
            if !tx.categoria.is_empty() && !categories.contains(&tx.categoria.as_str()) {
                categories.push(&tx.categoria);
            }
            if period.is_some_and(|p| p.range.contains(tx.fecha.date())) {
                stats.period_expenses += 1;
                stats.period_spent = stats.period_spent + tx.monto_tu_parte;
            }
        }
        stats.categories_count = categories.len();
        stats
    }
}

#[derive(Serialize)]
struct StatsResponse {
    success: bool,
    reconciliation: ReconciliationStats,
    general: GeneralStats,
}

async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    let reconciliation = reconciliation_stats(&*state.store).await?;
    let all = state.store.list(&TransactionFilter::All).await?;
    let period = PayPeriod::containing(now().date(), state.pay_day);
    Ok(Json(StatsResponse {
        success: true,
        reconciliation,
        general: GeneralStats::from_transactions(&all, period),
    }))
}

// ── Templates and generator ───────────────────────────────────────────────────

async fn create_recurring(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewRecurring>,
) -> ApiResult<Json<Value>> {
    let template = intake::create_recurring_template(&*state.store, new).await?;
    Ok(Json(json!({ "success": true, "template": template })))
}

async fn create_installments(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewInstallmentPurchase>,
) -> ApiResult<Json<Value>> {
    let purchase = intake::create_installment_purchase(&*state.store, new).await?;
    Ok(Json(json!({ "success": true, "purchase": purchase })))
}

#[derive(Deserialize)]
struct RunParams {
    /// Overrides the clock, mostly for backfilling.
    #[serde(default)]
    at: Option<NaiveDateTime>,
}

async fn run_recurring(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> ApiResult<Json<GenerationReport>> {
    let report = run_generator(&state, params.at.unwrap_or_else(now)).await?;
    Ok(Json(report))
}

// ── Pay period ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PeriodParams {
    #[serde(default)]
    date: Option<NaiveDate>,
}

#[derive(Serialize)]
struct PeriodResponse {
    start: NaiveDate,
    end: NaiveDate,
    label: String,
    pay_day: u32,
    next_pay_date: Option<NaiveDate>,
    days_until_pay: i64,
}

async fn get_period(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PeriodParams>,
) -> ApiResult<Json<PeriodResponse>> {
    let date = params.date.unwrap_or_else(|| now().date());
    let period = PayPeriod::containing(date, state.pay_day).ok_or_else(|| {
        ApiError::Internal(format!("pay_day {} is not a day of the month", state.pay_day))
    })?;
    Ok(Json(PeriodResponse {
        start: period.range.start,
        end: period.range.end,
        label: period.label(),
        pay_day: period.pay_day,
        next_pay_date: period.next_pay_date(),
        days_until_pay: period.days_until_pay(date),
    }))
}

// ── Backups ───────────────────────────────────────────────────────────────────

async fn get_backups(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BackupInfo>>> {
    let dir = state.backups.dir.clone();
    let backups = tokio::task::spawn_blocking(move || list_backups(&dir))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(backups))
}

async fn create_manual_backup(State(state): State<Arc<AppState>>) -> ApiResult<Json<BackupInfo>> {
    let info = backup_now(&state, "manual", now())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::BadRequest("ledger is in memory, nothing to back up".into()))?;
    let path = info.path.clone();
    tokio::task::spawn_blocking(move || verify_backup(&path))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(info))
}

// ── Telegram ──────────────────────────────────────────────────────────────────

async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> ApiResult<Json<Value>> {
    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !telegram::secret_matches(state.webhook_secret.as_deref(), provided) {
        tracing::warn!("Rejected webhook call with a bad secret token");
        return Err(ApiError::Unauthorized);
    }
    // Replies keep going in the background after the webhook answers.
    drop(telegram::handle_update(&state, update).await);
    Ok(Json(json!({ "ok": true })))
}

pub fn app_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let cors = if config.cors_allow.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins = config
            .cors_allow
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect::<Vec<_>>();
        CorsLayer::new().allow_origin(origins)
    };

    let api = Router::new()
        .route("/gasto", post(create_gasto))
        .route("/gasto/{id}", delete(delete_gasto))
        .route("/pendientes", get(get_pendientes))
        .route("/ingreso", post(create_ingreso))
        .route("/reembolso/match", post(manual_match))
        .route("/receivables", get(get_receivables))
        .route("/stats", get(get_stats))
        .route("/category/update", post(update_category))
        .route("/share/update", post(update_share))
        .route("/merchant", post(add_merchant))
        .route("/suggestions/{id}", get(get_suggestions))
        .route("/recurring", post(create_recurring))
        .route("/recurring/run", post(run_recurring))
        .route("/installments", post(create_installments))
        .route("/period", get(get_period))
        .route("/backups", get(get_backups).post(create_manual_backup));

    Router::new()
        .route("/", get(health))
        .nest("/api", api)
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
