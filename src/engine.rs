//! Recalculation service
//!
//! Owns the source records and the committed per-year projections. A tax year
//! is recomputed from scratch and swapped in whole, so readers only ever see the
//! last committed result. Recalculations of the same year are serialised;
//! different years run independently.

use crate::core::{
    loss_brought_forward, match_disposals, summarise, AuditLog, CalculationStep, CgtSummary,
    DisposalFragment, EngineError, EntryId, EntryKind, ExchangeRate, ImportSummary, LedgerEntry,
    Mutation, Sa108Export, SaleSnapshot, SettingKey, Settings, TaxYear, YearEndPool,
};
use crate::store::{Sources, Store, StoreDocument};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::sync::Arc;

/// Derived state for one tax year, keyed by the ledger version it was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearResult {
    pub tax_year: TaxYear,
    pub ledger_version: u64,
    pub revision: u64,
    pub fragments: Vec<DisposalFragment>,
    pub snapshots: Vec<SaleSnapshot>,
    pub year_end: Option<YearEndPool>,
    pub summary: CgtSummary,
    pub computed_at: DateTime<Utc>,
}

pub struct Engine {
    sources: RwLock<Sources>,
    audit: Mutex<AuditLog>,
    committed: RwLock<BTreeMap<TaxYear, Arc<YearResult>>>,
    year_locks: Mutex<HashMap<TaxYear, Arc<Mutex<()>>>>,
    store: Option<Store>,
}

impl Engine {
    /// Engine without persistence
    pub fn in_memory() -> Self {
        Self::from_document(StoreDocument::default(), None)
    }

    pub fn open(store: Store) -> Result<Self, EngineError> {
        let doc = store.load()?;
        Ok(Self::from_document(doc, Some(store)))
    }

    fn from_document(doc: StoreDocument, store: Option<Store>) -> Self {
        let committed = doc
            .results
            .into_iter()
            .map(|r| (r.tax_year, Arc::new(r)))
            .collect();
        Engine {
            sources: RwLock::new(doc.sources),
            audit: Mutex::new(doc.audit),
            committed: RwLock::new(committed),
            year_locks: Mutex::new(HashMap::new()),
            store,
        }
    }

    // ---- reads ----

    pub fn entries(&self, kind: EntryKind) -> Vec<LedgerEntry> {
        self.sources
            .read()
            .ledger
            .entries()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn entry(&self, kind: EntryKind, id: EntryId) -> Result<LedgerEntry, EngineError> {
        self.sources
            .read()
            .ledger
            .get(kind, id)
            .cloned()
            .ok_or(EngineError::EntryNotFound { kind, id })
    }

    pub fn ledger_version(&self) -> u64 {
        self.sources.read().ledger.version()
    }

    pub fn rates(&self) -> Vec<ExchangeRate> {
        self.sources.read().rates.iter().cloned().collect()
    }

    pub fn settings(&self) -> Settings {
        self.sources.read().settings.clone()
    }

    /// Last committed result, without computing
    pub fn committed(&self, year: TaxYear) -> Option<Arc<YearResult>> {
        self.committed.read().get(&year).cloned()
    }

    /// Committed result, computing it first if the year has never been calculated
    pub fn result(&self, year: TaxYear) -> Result<Arc<YearResult>, EngineError> {
        match self.committed(year) {
            Some(result) => Ok(result),
            None => self.recalculate(year),
        }
    }

    pub fn summary(&self, year: TaxYear) -> Result<CgtSummary, EngineError> {
        Ok(self.result(year)?.summary.clone())
    }

    /// Fragments of every committed year, in disposal order
    pub fn all_fragments(&self) -> Vec<DisposalFragment> {
        let mut fragments: Vec<DisposalFragment> = self
            .committed
            .read()
            .values()
            .flat_map(|r| r.fragments.iter().cloned())
            .collect();
        fragments.sort_by_key(|f| f.disposal_id);
        fragments
    }

    pub fn fragment(&self, disposal_id: u64) -> Result<DisposalFragment, EngineError> {
        self.committed
            .read()
            .values()
            .flat_map(|r| r.fragments.iter())
            .find(|f| f.disposal_id == disposal_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("disposal {}", disposal_id)))
    }

    pub fn snapshots(&self, year: TaxYear) -> Result<Vec<SaleSnapshot>, EngineError> {
        let result = self.result(year)?;
        if result.snapshots.is_empty() {
            return Err(EngineError::NotFound(format!("snapshot for {}", year)));
        }
        Ok(result.snapshots.clone())
    }

    pub fn sa108(&self, year: TaxYear) -> Result<Sa108Export, EngineError> {
        let result = self.result(year)?;
        if result.fragments.is_empty() {
            return Err(EngineError::NotFound(format!("disposals in {}", year)));
        }
        Ok(Sa108Export::new(&result.summary, &result.fragments))
    }

    /// Years holding a sale or a committed result
    pub fn tax_years(&self) -> Vec<TaxYear> {
        let mut years: BTreeSet<TaxYear> = self.sources.read().ledger.sale_years();
        years.extend(self.committed.read().keys().copied());
        years.into_iter().collect()
    }

    pub fn steps(&self, tax_year: Option<TaxYear>, sale_id: Option<EntryId>) -> Vec<CalculationStep> {
        self.audit
            .lock()
            .query(tax_year, sale_id)
            .cloned()
            .collect()
    }

    pub fn clear_steps(&self, tax_year: Option<TaxYear>) -> Result<usize, EngineError> {
        let removed = self.audit.lock().clear(tax_year);
        log::info!("Cleared {} calculation steps", removed);
        self.persist()?;
        Ok(removed)
    }

    // ---- recalculation ----

    /// Recompute a tax year from the ledger and commit it. On failure the
    /// previously committed result is left untouched.
    pub fn recalculate(&self, year: TaxYear) -> Result<Arc<YearResult>, EngineError> {
        year.validate()?;
        let lock = self.year_lock(year);
        let _guard = lock.lock();

        let (outcome, settings, ledger_version, revision) = {
            let sources = self.sources.read();
            (
                match_disposals(&sources.ledger, &sources.rates),
                sources.settings.clone(),
                sources.ledger.version(),
                sources.revision,
            )
        };

        if let Some(error) = outcome.failure_for(year) {
            log::warn!("Recalculation of {} failed: {}", year, error);
            return Err(error.clone());
        }

        let brought_forward =
            loss_brought_forward(year, &outcome.fragments, &settings.carry_forward_losses);
        let fragments: Vec<DisposalFragment> = outcome.fragments_for(year).cloned().collect();
        let summary = summarise(year, &fragments, &settings.band_inputs(year, brought_forward));
        let result = Arc::new(YearResult {
            tax_year: year,
            ledger_version,
            revision,
            snapshots: outcome.snapshots_for(year).cloned().collect(),
            year_end: outcome.year_end_for(year).cloned(),
            fragments,
            summary,
            computed_at: Utc::now(),
        });

        {
            let mut committed = self.committed.write();
            if let Some(newer) = committed.get(&year).filter(|r| r.revision > revision) {
                return Ok(newer.clone());
            }
            committed.insert(year, result.clone());
        }
        let run_id = self
            .audit
            .lock()
            .append_run(year, outcome.steps_for(year).cloned().collect());
        log::info!(
            "Recalculated {} (ledger v{}, run {}): {} fragments, net gain £{:.2}",
            year,
            ledger_version,
            run_id,
            result.fragments.len(),
            result.summary.net_gain
        );

        if let Err(e) = self.persist() {
            log::warn!("Could not save recalculated {}: {}", year, e);
        }
        Ok(result)
    }

    fn year_lock(&self, year: TaxYear) -> Arc<Mutex<()>> {
        self.year_locks.lock().entry(year).or_default().clone()
    }

    /// Recompute every known year from `from` on. Failures keep the previous result.
    fn refresh(&self, from: Option<TaxYear>) {
        let years: Vec<TaxYear> = self
            .tax_years()
            .into_iter()
            .filter(|y| from.map_or(true, |f| *y >= f))
            .collect();
        for year in years {
            if let Err(e) = self.recalculate(year) {
                log::warn!("{} keeps its previous result: {}", year, e);
            }
        }
    }

    // ---- mutations ----

    pub fn add_entry(&self, entry: LedgerEntry) -> Result<LedgerEntry, EngineError> {
        let mutation = self.mutate(|s| Ok(s.ledger.insert(entry)?))?;
        self.after_ledger_change(&mutation)
    }

    pub fn update_entry(&self, id: EntryId, entry: LedgerEntry) -> Result<LedgerEntry, EngineError> {
        let mutation = self.mutate(|s| s.ledger.update(id, entry))?;
        self.after_ledger_change(&mutation)
    }

    pub fn remove_entry(&self, kind: EntryKind, id: EntryId) -> Result<(), EngineError> {
        let mutation = self.mutate(|s| s.ledger.remove(kind, id))?;
        self.refresh(Some(affected_from(mutation.earliest_date)));
        Ok(())
    }

    pub fn add_rate(&self, rate: ExchangeRate) -> Result<(), EngineError> {
        let date = rate.date;
        self.mutate(|s| Ok(s.rates.insert(rate)?))?;
        self.refresh(Some(affected_from(date)));
        Ok(())
    }

    pub fn remove_rate(&self, date: NaiveDate) -> Result<ExchangeRate, EngineError> {
        let removed = self.mutate(|s| {
            s.rates
                .remove(date)
                .ok_or_else(|| EngineError::NotFound(format!("rate for {}", date)))
        })?;
        self.refresh(Some(affected_from(date)));
        Ok(removed)
    }

    pub fn import_rates<R: Read>(&self, reader: R) -> Result<ImportSummary, EngineError> {
        let summary = self.mutate(|s| Ok(s.rates.import_csv(reader)?))?;
        if summary.inserted > 0 {
            self.refresh(None);
        }
        Ok(summary)
    }

    pub fn apply_setting(&self, key: &str, value: Decimal) -> Result<SettingKey, EngineError> {
        let key = self.mutate(|s| Ok(s.settings.apply(key, value)?))?;
        log::info!("Setting {} = {}", key.as_str(), value);
        self.refresh(None);
        Ok(key)
    }

    pub fn set_carry_forward(&self, year: TaxYear, amount: Decimal) -> Result<(), EngineError> {
        year.validate()?;
        self.mutate(|s| Ok(s.settings.set_carry_forward(year, amount)?))?;
        self.refresh(Some(year));
        Ok(())
    }

    pub fn remove_carry_forward(&self, year: TaxYear) -> Result<(), EngineError> {
        self.mutate(|s| {
            s.settings
                .remove_carry_forward(year)
                .map(|_| ())
                .ok_or_else(|| EngineError::NotFound(format!("carry-forward loss for {}", year)))
        })?;
        self.refresh(Some(year));
        Ok(())
    }

    /// Apply a change to a copy of the sources and swap it in once saved.
    /// Nothing is changed when `f` or the save fails.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Sources) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut sources = self.sources.write();
        let mut next = sources.clone();
        let value = f(&mut next)?;
        next.revision += 1;
        self.save(&next)?;
        *sources = next;
        Ok(value)
    }

    fn after_ledger_change(&self, mutation: &Mutation) -> Result<LedgerEntry, EngineError> {
        self.refresh(Some(affected_from(mutation.earliest_date)));
        self.entry(mutation.kind, mutation.id)
    }

    fn persist(&self) -> Result<(), EngineError> {
        let sources = self.sources.read();
        self.save(&sources)
    }

    /// Write `sources` with the current audit log and committed results.
    /// Lock order is sources, audit, committed.
    fn save(&self, sources: &Sources) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let doc = StoreDocument {
            sources: sources.clone(),
            audit: self.audit.lock().clone(),
            results: self
                .committed
                .read()
                .values()
                .map(|r| r.as_ref().clone())
                .collect(),
        };
        store.save(&doc)
    }
}

/// First tax year a change on `date` can affect. An acquisition can be matched
/// to a sale up to thirty days earlier, possibly in the previous tax year.
fn affected_from(date: NaiveDate) -> TaxYear {
    TaxYear::from_date(date - Duration::days(crate::core::matcher::THIRTY_DAY_WINDOW))
}
