pub mod audit;
pub mod bands;
pub mod errors;
pub mod ledger;
pub mod matcher;
pub mod pool;
pub mod rates;
pub mod rounding;
pub mod sa108;
pub mod schema;
pub mod settings;
pub mod uk;

// Flat public surface for domain types and functions.
pub use audit::{AuditLog, CalculationStep, FragmentTrace};
pub use bands::{loss_brought_forward, summarise, BandInputs, CgtSummary};
pub use errors::{EngineError, RateError, ReconciliationError, ValidationError};
pub use ledger::{EntryId, EntryKind, EsppPurchase, Ledger, LedgerEntry, Mutation, Sale, Vesting};
pub use matcher::{
    match_disposals, DisposalFragment, MatchOutcome, MatchType, SaleSnapshot, YearEndPool,
};
pub use pool::{acquisitions, Acquisition, LotId, LotSource, SharePool};
pub use rates::{ExchangeRate, ExchangeRateTable, ImportSummary};
pub use sa108::Sa108Export;
pub use settings::{SettingKey, Settings};
pub use uk::{TaxBand, TaxYear};
