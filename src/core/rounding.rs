//! Presentation rounding. Computation keeps full precision; these are applied
//! only when a figure is displayed or exported.

use rust_decimal::{Decimal, RoundingStrategy};

pub const MONEY_DP: u32 = 2;
pub const SHARES_DP: u32 = 6;

/// Half-up to the penny
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_shares(quantity: Decimal) -> Decimal {
    quantity.round_dp_with_strategy(SHARES_DP, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn half_up() {
        assert_eq!(round_money(dec!(200.005)), dec!(200.01));
        assert_eq!(round_money(dec!(-200.005)), dec!(-200.01));
        assert_eq!(round_money(dec!(200.0049)), dec!(200.00));
        assert_eq!(round_shares(dec!(1.0000005)), dec!(1.000001));
    }
}
