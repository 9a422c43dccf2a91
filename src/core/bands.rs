//! Annual CGT computation: losses, allowance and the basic/higher band split

use super::matcher::DisposalFragment;
use super::uk::{TaxBand, TaxYear};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-year settings feeding the band split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandInputs {
    pub non_savings_income: Decimal,
    pub basic_threshold: Decimal,
    pub allowance: Decimal,
    /// Losses brought forward from earlier years
    pub carry_forward_loss: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CgtSummary {
    pub tax_year: TaxYear,
    pub tax_year_start: NaiveDate,
    pub tax_year_end: NaiveDate,
    pub cgt_allowance_gbp: Decimal,
    pub carry_forward_loss_gbp: Decimal,
    pub non_savings_income: Decimal,
    pub basic_threshold: Decimal,
    pub basic_band_available: Decimal,
    pub total_disposals: usize,
    pub total_proceeds: Decimal,
    pub total_cost: Decimal,
    pub total_gain: Decimal,
    /// Sum of gains on fragments that made a gain
    pub pos: Decimal,
    /// Sum of losses, as a negative number
    pub neg: Decimal,
    pub net_gain: Decimal,
    pub carry_forward_used: Decimal,
    pub net_gain_after_losses: Decimal,
    /// Brought-forward losses left over plus this year's unabsorbed loss
    pub loss_carried_out: Decimal,
    pub allowance_used: Decimal,
    pub taxable_after_allowance: Decimal,
    pub basic_taxable_gain: Decimal,
    pub higher_taxable_gain: Decimal,
    pub estimated_cgt: Decimal,
    pub effective_rate_percent: Decimal,
}

/// Aggregate one year's fragments. Fragments from other years are ignored.
pub fn summarise(year: TaxYear, fragments: &[DisposalFragment], inputs: &BandInputs) -> CgtSummary {
    let fragments: Vec<&DisposalFragment> =
        fragments.iter().filter(|f| f.tax_year == year).collect();

    let total_proceeds: Decimal = fragments.iter().map(|f| f.proceeds_gbp).sum();
    let total_cost: Decimal = fragments.iter().map(|f| f.cost_basis_gbp).sum();
    let pos: Decimal = fragments
        .iter()
        .map(|f| f.gain_gbp)
        .filter(|g| *g > Decimal::ZERO)
        .sum();
    let neg: Decimal = fragments
        .iter()
        .map(|f| f.gain_gbp)
        .filter(|g| *g < Decimal::ZERO)
        .sum();
    let net_gain = pos + neg;

    let carry_forward = inputs.carry_forward_loss.max(Decimal::ZERO);
    let carry_forward_used = carry_forward.min(net_gain.max(Decimal::ZERO));
    let net_gain_after_losses = (net_gain - carry_forward).max(Decimal::ZERO);
    let loss_carried_out = (carry_forward - carry_forward_used) + (-net_gain).max(Decimal::ZERO);

    let allowance = inputs.allowance.max(Decimal::ZERO);
    let allowance_used = allowance.min(net_gain_after_losses);
    let taxable_after_allowance = net_gain_after_losses - allowance_used;

    let basic_band_available = (inputs.basic_threshold - inputs.non_savings_income).max(Decimal::ZERO);
    let basic_taxable_gain = taxable_after_allowance.min(basic_band_available);
    let higher_taxable_gain = taxable_after_allowance - basic_taxable_gain;

    let estimated_cgt = basic_taxable_gain * year.cgt_rate(TaxBand::Basic)
        + higher_taxable_gain * year.cgt_rate(TaxBand::Higher);
    let effective_rate_percent = if net_gain_after_losses > Decimal::ZERO {
        estimated_cgt / net_gain_after_losses * dec!(100)
    } else {
        Decimal::ZERO
    };

    CgtSummary {
        tax_year: year,
        tax_year_start: year.start_date(),
        tax_year_end: year.end_date(),
        cgt_allowance_gbp: inputs.allowance,
        carry_forward_loss_gbp: carry_forward,
        non_savings_income: inputs.non_savings_income,
        basic_threshold: inputs.basic_threshold,
        basic_band_available,
        total_disposals: fragments.len(),
        total_proceeds,
        total_cost,
        total_gain: total_proceeds - total_cost,
        pos,
        neg,
        net_gain,
        carry_forward_used,
        net_gain_after_losses,
        loss_carried_out,
        allowance_used,
        taxable_after_allowance,
        basic_taxable_gain,
        higher_taxable_gain,
        estimated_cgt,
        effective_rate_percent,
    }
}

/// Loss available to `year`: the year's manual entry plus whatever the previous
/// year carried out. The chain starts at the earliest year with a fragment or a
/// manual entry.
pub fn loss_brought_forward(
    year: TaxYear,
    fragments: &[DisposalFragment],
    manual: &BTreeMap<TaxYear, Decimal>,
) -> Decimal {
    let manual_for = |y: TaxYear| manual.get(&y).copied().unwrap_or_default();
    let first = fragments
        .iter()
        .map(|f| f.tax_year)
        .chain(manual.keys().copied())
        .min();
    let Some(first) = first.filter(|f| *f < year) else {
        return manual_for(year);
    };

    let mut carried = Decimal::ZERO;
    let mut y = first;
    while y < year {
        let net: Decimal = fragments
            .iter()
            .filter(|f| f.tax_year == y)
            .map(|f| f.gain_gbp)
            .sum();
        let available = manual_for(y) + carried;
        let used = available.min(net.max(Decimal::ZERO));
        carried = (available - used) + (-net).max(Decimal::ZERO);
        y = y.next();
    }
    manual_for(year) + carried
}
