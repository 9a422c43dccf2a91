//! Taxpayer settings used by the band calculation

use super::bands::BandInputs;
use super::errors::ValidationError;
use super::uk::TaxYear;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

pub const DEFAULT_BASIC_THRESHOLD: Decimal = dec!(37700);

/// Keys accepted by `POST /settings`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    NonSavingsIncome,
    BasicBandThreshold,
    /// Zero means "use the statutory exempt amount"
    CgtAllowance,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::NonSavingsIncome,
        SettingKey::BasicBandThreshold,
        SettingKey::CgtAllowance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::NonSavingsIncome => "NonSavingsIncome",
            SettingKey::BasicBandThreshold => "BasicBandThreshold",
            SettingKey::CgtAllowance => "CGT_Allowance",
        }
    }
}

impl FromStr for SettingKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownSetting(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub non_savings_income_gbp: Decimal,
    pub basic_threshold_gbp: Decimal,
    pub cgt_allowance_override_gbp: Option<Decimal>,
    /// Losses entered by hand, by the year they are brought into
    #[serde(default)]
    pub carry_forward_losses: BTreeMap<TaxYear, Decimal>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            non_savings_income_gbp: Decimal::ZERO,
            basic_threshold_gbp: DEFAULT_BASIC_THRESHOLD,
            cgt_allowance_override_gbp: None,
            carry_forward_losses: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn apply(&mut self, key: &str, value: Decimal) -> Result<SettingKey, ValidationError> {
        let key = SettingKey::from_str(key)?;
        if value < Decimal::ZERO {
            return Err(ValidationError::Negative {
                field: key.as_str(),
                value,
            });
        }
        match key {
            SettingKey::NonSavingsIncome => self.non_savings_income_gbp = value,
            SettingKey::BasicBandThreshold => self.basic_threshold_gbp = value,
            SettingKey::CgtAllowance => {
                self.cgt_allowance_override_gbp = Some(value).filter(|v| !v.is_zero())
            }
        }
        Ok(key)
    }

    pub fn get(&self, key: SettingKey) -> Decimal {
        match key {
            SettingKey::NonSavingsIncome => self.non_savings_income_gbp,
            SettingKey::BasicBandThreshold => self.basic_threshold_gbp,
            SettingKey::CgtAllowance => self.cgt_allowance_override_gbp.unwrap_or_default(),
        }
    }

    pub fn allowance_for(&self, year: TaxYear) -> Decimal {
        self.cgt_allowance_override_gbp
            .unwrap_or_else(|| year.cgt_exempt_amount())
    }

    pub fn band_inputs(&self, year: TaxYear, carry_forward_loss: Decimal) -> BandInputs {
        BandInputs {
            non_savings_income: self.non_savings_income_gbp,
            basic_threshold: self.basic_threshold_gbp,
            allowance: self.allowance_for(year),
            carry_forward_loss,
        }
    }

    /// Zero removes the entry
    pub fn set_carry_forward(&mut self, year: TaxYear, amount: Decimal) -> Result<(), ValidationError> {
        if amount < Decimal::ZERO {
            return Err(ValidationError::Negative {
                field: "carry_forward_loss",
                value: amount,
            });
        }
        if amount.is_zero() {
            self.carry_forward_losses.remove(&year);
        } else {
            self.carry_forward_losses.insert(year, amount);
        }
        Ok(())
    }

    pub fn remove_carry_forward(&mut self, year: TaxYear) -> Option<Decimal> {
        self.carry_forward_losses.remove(&year)
    }
}
