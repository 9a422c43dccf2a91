//! Calculation audit trail

use super::ledger::EntryId;
use super::uk::TaxYear;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How one fragment's numbers were derived
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentTrace {
    pub inputs: BTreeMap<String, String>,
    pub equations: Vec<String>,
    pub numeric: BTreeMap<String, Decimal>,
}

impl FragmentTrace {
    pub fn input(&mut self, key: &str, value: impl ToString) {
        self.inputs.insert(key.to_string(), value.to_string());
    }

    pub fn equation(&mut self, text: String) {
        self.equations.push(text);
    }

    pub fn value(&mut self, key: &str, value: Decimal) {
        self.numeric.insert(key.to_string(), value);
    }
}

/// Narrative line produced by the matcher, not yet part of the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDraft {
    pub date: NaiveDate,
    pub sale_input_id: Option<EntryId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationStep {
    pub id: u64,
    pub run_id: u64,
    pub tax_year: TaxYear,
    pub sale_input_id: Option<EntryId>,
    pub step_order: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of recalculation narratives. Earlier runs stay until
/// explicitly cleared so successive recalculations can be compared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    next_id: u64,
    next_run: u64,
    steps: Vec<CalculationStep>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one run's steps; returns the run id
    pub fn append_run(&mut self, tax_year: TaxYear, drafts: Vec<StepDraft>) -> u64 {
        self.next_run += 1;
        let run_id = self.next_run;
        let timestamp = Utc::now();
        for (order, draft) in drafts.into_iter().enumerate() {
            self.next_id += 1;
            self.steps.push(CalculationStep {
                id: self.next_id,
                run_id,
                tax_year,
                sale_input_id: draft.sale_input_id,
                step_order: order as u32 + 1,
                message: draft.message,
                timestamp,
            });
        }
        run_id
    }

    pub fn query(
        &self,
        tax_year: Option<TaxYear>,
        sale_id: Option<EntryId>,
    ) -> impl Iterator<Item = &CalculationStep> {
        self.steps.iter().filter(move |s| {
            tax_year.map_or(true, |y| s.tax_year == y)
                && sale_id.map_or(true, |id| s.sale_input_id == Some(id))
        })
    }

    /// Drop steps (optionally only one year's); returns how many went
    pub fn clear(&mut self, tax_year: Option<TaxYear>) -> usize {
        let before = self.steps.len();
        self.steps
            .retain(|s| tax_year.is_some_and(|y| s.tax_year != y));
        before - self.steps.len()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
