//! API Routes
//!
//! HTTP endpoint definitions.

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{
    Account, AccountKind, CreditCard, Currency, LedgerEntry, LedgerError, Money, OperationContext,
    OwnerType, Quantity, Routing, Symbol,
};
use crate::engine::{
    CardCharge, CardRepayment, CryptoBuy, CryptoSell, Deposit, OperationReceipt, ReverseEntry,
    Transfer, Withdrawal,
};
use crate::error::AppError;
use crate::query::{Pagination, PortfolioValuation};

use super::AppState;

// =========================================================================
// Request types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub owner_id: Uuid,
    pub kind: AccountKind,
    pub owner_type: OwnerType,
    pub display_name: String,
    pub currency: String,
    #[serde(default)]
    pub routing: Option<Routing>,
}

#[derive(Debug, Deserialize)]
pub struct IssueCardRequest {
    pub owner_id: Uuid,
    pub display_name: String,
    /// Credit limit in major units, e.g. "1000.00".
    pub limit: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub account_id: Uuid,
    pub amount: String,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    pub account_id: Uuid,
    pub amount: String,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: String,
    pub currency: String,
    #[serde(default)]
    pub memo: Option<String>,
}

/// Rate shown to the buyer at submission time, recorded for audit.
#[derive(Debug, Deserialize)]
pub struct QuotedRate {
    pub rate: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct CryptoBuyRequest {
    pub account_id: Uuid,
    pub symbol: String,
    pub quantity: String,
    #[serde(default)]
    pub quoted: Option<QuotedRate>,
}

#[derive(Debug, Deserialize)]
pub struct CryptoSellRequest {
    pub account_id: Uuid,
    pub symbol: String,
    pub quantity: String,
}

#[derive(Debug, Deserialize)]
pub struct CardChargeRequest {
    pub amount: String,
    pub currency: String,
    pub merchant: String,
}

#[derive(Debug, Deserialize)]
pub struct CardRepaymentRequest {
    pub account_id: Uuid,
    pub amount: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    crate::query::DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize)]
pub struct PortfolioQuery {
    #[serde(default)]
    pub currency: Option<String>,
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        // Account lifecycle
        .route("/accounts", post(open_account))
        .route("/accounts/:account_id", get(get_account))
        .route("/accounts/:account_id/close", post(close_account))
        .route("/accounts/:account_id/entries", get(list_entries))
        .route("/owners/:owner_id/accounts", get(list_owner_accounts))
        .route("/owners/:owner_id/portfolio", get(get_portfolio))
        // Cards
        .route("/cards", post(issue_card))
        .route("/cards/:card_id", get(get_card))
        .route("/cards/:card_id/charges", post(card_charge))
        .route("/cards/:card_id/repayments", post(card_repayment))
        // Money movement
        .route("/deposits", post(deposit))
        .route("/withdrawals", post(withdraw))
        .route("/transfers", post(transfer))
        .route("/crypto/buy", post(crypto_buy))
        .route("/crypto/sell", post(crypto_sell))
        // Audit
        .route("/entries/:entry_id/reverse", post(reverse_entry))
}

// =========================================================================
// Shared helpers
// =========================================================================

/// Every money-moving endpoint requires an `Idempotency-Key` uuid header.
fn require_idempotency_key(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let raw = headers
        .get("Idempotency-Key")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::MissingHeader("Idempotency-Key".to_string()))?;
    Uuid::parse_str(raw)
        .map_err(|_| AppError::InvalidRequest("Idempotency-Key must be a uuid".to_string()))
}

fn parse_money(amount: &str, currency: &str) -> Result<Money, AppError> {
    let currency = Currency::new(currency).map_err(LedgerError::from)?;
    Ok(Money::parse(amount, currency).map_err(LedgerError::from)?)
}

fn parse_symbol(symbol: &str) -> Result<Symbol, AppError> {
    Ok(Symbol::new(symbol).map_err(LedgerError::from)?)
}

fn parse_quantity(quantity: &str) -> Result<Quantity, AppError> {
    Ok(quantity.parse::<Quantity>().map_err(LedgerError::from)?)
}

// =========================================================================
// POST /accounts
// =========================================================================

/// Open a new account
async fn open_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let currency = Currency::new(&request.currency).map_err(LedgerError::from)?;
    let account = state
        .engine
        .open_account(
            request.owner_id,
            request.kind,
            request.owner_type,
            request.display_name,
            currency,
            request.routing,
            &context,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

// =========================================================================
// GET /accounts/:account_id
// =========================================================================

/// Get account by ID
async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<Account>, AppError> {
    let account = state.query.get_account(account_id).await?;
    Ok(Json(account))
}

// =========================================================================
// POST /accounts/:account_id/close
// =========================================================================

/// Close an account holding neither funds nor positions
async fn close_account(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<Account>, AppError> {
    let closed = state.engine.close_account(account_id, &context).await?;
    Ok(Json(closed))
}

// =========================================================================
// GET /accounts/:account_id/entries
// =========================================================================

/// Ledger entries for an account, newest first
async fn list_entries(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    let page = Pagination {
        limit: query.limit,
        offset: query.offset,
    };
    let entries = state.query.list_entries(account_id, page).await?;
    Ok(Json(entries))
}

// =========================================================================
// GET /owners/:owner_id/accounts
// =========================================================================

/// All accounts belonging to an owner
async fn list_owner_accounts(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<Vec<Account>>, AppError> {
    let accounts = state.query.list_accounts_for_owner(owner_id).await?;
    Ok(Json(accounts))
}

// =========================================================================
// GET /owners/:owner_id/portfolio
// =========================================================================

/// Value an owner's holdings at current oracle rates
async fn get_portfolio(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Query(query): Query<PortfolioQuery>,
) -> Result<Json<PortfolioValuation>, AppError> {
    let code = query.currency.as_deref().unwrap_or("AUD");
    let currency = Currency::new(code).map_err(LedgerError::from)?;
    let valuation = state.query.portfolio_valuation(owner_id, currency).await?;
    Ok(Json(valuation))
}

// =========================================================================
// POST /cards
// =========================================================================

/// Issue a credit card
async fn issue_card(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<IssueCardRequest>,
) -> Result<(StatusCode, Json<CreditCard>), AppError> {
    let limit = parse_money(&request.limit, &request.currency)?;
    let card = state
        .engine
        .issue_card(request.owner_id, request.display_name, limit, &context)
        .await?;
    Ok((StatusCode::CREATED, Json(card)))
}

// =========================================================================
// GET /cards/:card_id
// =========================================================================

/// Get card by ID
async fn get_card(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> Result<Json<CreditCard>, AppError> {
    let card = state.query.get_card(card_id).await?;
    Ok(Json(card))
}

// =========================================================================
// POST /deposits
// =========================================================================

/// Deposit external funds
async fn deposit(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<DepositRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let amount = parse_money(&request.amount, &request.currency)?;
    let op = Deposit {
        account_id: request.account_id,
        amount,
        description: request.description.unwrap_or_else(|| "Deposit".to_string()),
    };
    let receipt = state.engine.deposit(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /withdrawals
// =========================================================================

/// Withdraw funds
async fn withdraw(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let amount = parse_money(&request.amount, &request.currency)?;
    let op = Withdrawal {
        account_id: request.account_id,
        amount,
        description: request
            .description
            .unwrap_or_else(|| "Withdrawal".to_string()),
    };
    let receipt = state.engine.withdraw(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /transfers
// =========================================================================

/// Transfer between two accounts
async fn transfer(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let amount = parse_money(&request.amount, &request.currency)?;
    let op = Transfer {
        from_account_id: request.from_account_id,
        to_account_id: request.to_account_id,
        amount,
        memo: request.memo.unwrap_or_else(|| "Transfer".to_string()),
    };
    let receipt = state.engine.transfer(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /crypto/buy
// =========================================================================

/// Buy crypto with fiat from an account
async fn crypto_buy(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<CryptoBuyRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let quoted_rate = match request.quoted {
        Some(quoted) => Some(parse_money(&quoted.rate, &quoted.currency)?),
        None => None,
    };
    let op = CryptoBuy {
        account_id: request.account_id,
        symbol: parse_symbol(&request.symbol)?,
        quantity: parse_quantity(&request.quantity)?,
        quoted_rate,
    };
    let receipt = state.engine.crypto_buy(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /crypto/sell
// =========================================================================

/// Sell held crypto back into fiat
async fn crypto_sell(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    headers: HeaderMap,
    Json(request): Json<CryptoSellRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let op = CryptoSell {
        account_id: request.account_id,
        symbol: parse_symbol(&request.symbol)?,
        quantity: parse_quantity(&request.quantity)?,
    };
    let receipt = state.engine.crypto_sell(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /cards/:card_id/charges
// =========================================================================

/// Charge a purchase to a card
async fn card_charge(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(card_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CardChargeRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let amount = parse_money(&request.amount, &request.currency)?;
    let op = CardCharge {
        card_id,
        amount,
        merchant: request.merchant,
    };
    let receipt = state.engine.card_charge(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /cards/:card_id/repayments
// =========================================================================

/// Repay a card from an account
async fn card_repayment(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(card_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CardRepaymentRequest>,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let amount = parse_money(&request.amount, &request.currency)?;
    let op = CardRepayment {
        card_id,
        account_id: request.account_id,
        amount,
    };
    let receipt = state.engine.card_repayment(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// =========================================================================
// POST /entries/:entry_id/reverse
// =========================================================================

/// Reverse a completed entry (operator only)
async fn reverse_entry(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Path(entry_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<OperationReceipt>), AppError> {
    let key = require_idempotency_key(&headers)?;
    let op = ReverseEntry { entry_id };
    let receipt = state.engine.reverse_entry(op, key, &context).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
