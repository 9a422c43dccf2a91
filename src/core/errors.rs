use super::ledger::{EntryId, EntryKind};
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Bad input, rejected before anything is mutated
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: Decimal },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: Decimal },
    #[error("shares withheld ({withheld}) must be less than shares vested ({vested})")]
    WithheldNotBelowVested { vested: Decimal, withheld: Decimal },
    #[error("purchase price {purchase} exceeds market price {market}")]
    PurchaseAboveMarket { purchase: Decimal, market: Decimal },
    #[error("qualifying ESPP discount of {discount}% exceeds the 15% limit")]
    DiscountTooLarge { discount: Decimal },
    #[error("lot {lot} has non-positive quantity {quantity}")]
    NonPositiveLot { lot: String, quantity: Decimal },
    #[error("unknown setting: {0}")]
    UnknownSetting(String),
    #[error("invalid csv: {0}")]
    InvalidCsv(String),
    #[error("tax year {year} is outside {first}..={last}")]
    TaxYearOutOfRange { year: i32, first: i32, last: i32 },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RateError {
    #[error("no USD/GBP rate on or before {0}")]
    NoRateOnOrBefore(NaiveDate),
}

/// Matching produced numbers that do not add up
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error(
        "sale {sale_id} on {date}: {requested} shares needed from the pool but only {available} held"
    )]
    PoolExhausted {
        sale_id: EntryId,
        date: NaiveDate,
        requested: Decimal,
        available: Decimal,
    },
    #[error("sale {sale_id}: fragments match {matched} shares, sale is {sold}")]
    FragmentMismatch {
        sale_id: EntryId,
        matched: Decimal,
        sold: Decimal,
    },
    #[error("sale {sale_id}: {fragments} fragments is more than one sale can be split into")]
    TooManyFragments { sale_id: EntryId, fragments: usize },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
    #[error("exchange rate unavailable: {0}")]
    ExternalUnavailable(#[from] RateError),
    #[error("{kind} {id} not found")]
    EntryNotFound { kind: EntryKind, id: EntryId },
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}
