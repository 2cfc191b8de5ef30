//! Interest accrual and redemption fee collaborators.

use bytemuck::{Pod, Zeroable};

use super::wide::{mul_div, DECIMAL_PRECISION, U128};
use super::{EngineError, Position, Result, BPS_DENOMINATOR, SLOTS_PER_YEAR};

// ============================================================================
// Interest
// ============================================================================

/// Source of debt growth applied when a position is touched.
///
/// Both amounts cover the slots since `position.last_touch_slot` and are
/// added to the position's debt.
pub trait InterestAccrual {
    /// Interest owed on the position's recorded debt.
    fn accrued_interest(&self, position: &Position, now_slot: u64) -> Result<u128>;

    /// Management fee owed on top of interest.
    fn accrued_management_fee(&self, position: &Position, now_slot: u64) -> Result<u128>;
}

/// Debt never grows (for testing)
pub struct NoAccrual;

impl InterestAccrual for NoAccrual {
    fn accrued_interest(&self, _position: &Position, _now_slot: u64) -> Result<u128> {
        Ok(0)
    }

    fn accrued_management_fee(&self, _position: &Position, _now_slot: u64) -> Result<u128> {
        Ok(0)
    }
}

/// Simple (non-compounding between touches) interest at the position's own
/// annual rate, which is its `rank_key` in bps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimpleInterest {
    pub management_fee_bps: u64,
}

impl SimpleInterest {
    fn annualized(debt: u128, rate_bps: u64, elapsed: u64) -> Result<u128> {
        if debt == 0 || rate_bps == 0 || elapsed == 0 {
            return Ok(0);
        }
        let rate_time = rate_bps as u128 * elapsed as u128;
        mul_div(debt, rate_time, BPS_DENOMINATOR * SLOTS_PER_YEAR as u128)
    }
}

impl InterestAccrual for SimpleInterest {
    fn accrued_interest(&self, position: &Position, now_slot: u64) -> Result<u128> {
        let elapsed = now_slot.saturating_sub(position.last_touch_slot);
        Self::annualized(position.debt.get(), position.rank_key, elapsed)
    }

    fn accrued_management_fee(&self, position: &Position, now_slot: u64) -> Result<u128> {
        let elapsed = now_slot.saturating_sub(position.last_touch_slot);
        Self::annualized(position.debt.get(), self.management_fee_bps, elapsed)
    }
}

// ============================================================================
// Redemption fee
// ============================================================================

/// Prices redemptions.
pub trait RedemptionFeeModel {
    /// Fee rate (wad) for redeeming `amount` out of `total_debt`.
    fn redemption_rate(&self, amount: u128, total_debt: u128, now_slot: u64) -> Result<u128>;

    /// Record a completed redemption.
    fn record_redemption(&mut self, redeemed: u128, total_debt: u128, now_slot: u64) -> Result<()>;
}

/// Constant rate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlatRedemptionFee(pub u128);

impl RedemptionFeeModel for FlatRedemptionFee {
    fn redemption_rate(&self, _amount: u128, _total_debt: u128, _now_slot: u64) -> Result<u128> {
        Ok(self.0.min(DECIMAL_PRECISION))
    }

    fn record_redemption(&mut self, _redeemed: u128, _total_debt: u128, _now_slot: u64) -> Result<()> {
        Ok(())
    }
}

/// Decay factor per fee period: half-life of 12h at one period per minute.
pub const BASE_RATE_DECAY_FACTOR: u128 = 999_037_758_833_783_000;

/// One minute of ~400ms slots.
pub const SLOTS_PER_FEE_PERIOD: u64 = 150;

/// Each redemption raises the base rate by `redeemed / total / BETA`.
pub const BETA: u128 = 2;

/// Periods past this decay the base rate to zero anyway.
const MAX_DECAY_PERIODS: u64 = 525_600_000;

/// Base rate that jumps on redemptions and decays over time.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BaseRateFee {
    pub base_rate: U128,
    pub floor: U128,
    pub last_fee_op_slot: u64,
}

impl BaseRateFee {
    pub fn new(floor: u128) -> Self {
        Self {
            base_rate: U128::ZERO,
            floor: U128::new(floor),
            last_fee_op_slot: 0,
        }
    }

    fn periods_passed(&self, now_slot: u64) -> u64 {
        now_slot.saturating_sub(self.last_fee_op_slot) / SLOTS_PER_FEE_PERIOD
    }

    /// Base rate after decaying to `now_slot`.
    pub fn decayed_base_rate(&self, now_slot: u64) -> Result<u128> {
        let factor = dec_pow(BASE_RATE_DECAY_FACTOR, self.periods_passed(now_slot))?;
        mul_div(self.base_rate.get(), factor, DECIMAL_PRECISION)
    }

    fn bumped_base_rate(&self, amount: u128, total_debt: u128, now_slot: u64) -> Result<u128> {
        let decayed = self.decayed_base_rate(now_slot)?;
        if total_debt == 0 {
            return Ok(decayed);
        }
        let fraction = mul_div(amount, DECIMAL_PRECISION, total_debt)?;
        Ok(decayed.saturating_add(fraction / BETA).min(DECIMAL_PRECISION))
    }
}

impl RedemptionFeeModel for BaseRateFee {
    fn redemption_rate(&self, amount: u128, total_debt: u128, now_slot: u64) -> Result<u128> {
        let base = self.bumped_base_rate(amount, total_debt, now_slot)?;
        Ok(self.floor.get().saturating_add(base).min(DECIMAL_PRECISION))
    }

    fn record_redemption(&mut self, redeemed: u128, total_debt: u128, now_slot: u64) -> Result<()> {
        let new_base = self.bumped_base_rate(redeemed, total_debt, now_slot)?;
        // Advance by whole periods so partial periods are not lost.
        let periods = self.periods_passed(now_slot);
        self.last_fee_op_slot = self.last_fee_op_slot.saturating_add(periods * SLOTS_PER_FEE_PERIOD);
        self.base_rate.set(new_base);
        Ok(())
    }
}

/// Wad multiply, rounding half up.
fn dec_mul(x: u128, y: u128) -> Result<u128> {
    let prod = x.checked_mul(y).ok_or(EngineError::Overflow)?;
    Ok((prod + DECIMAL_PRECISION / 2) / DECIMAL_PRECISION)
}

/// `base ^ n` in wad by exponentiation by squaring. `base` must be <= 1e18.
pub fn dec_pow(base: u128, n: u64) -> Result<u128> {
    let mut n = n.min(MAX_DECAY_PERIODS);
    if n == 0 {
        return Ok(DECIMAL_PRECISION);
    }
    let mut x = base;
    let mut y = DECIMAL_PRECISION;
    while n > 1 {
        if n % 2 == 1 {
            y = dec_mul(x, y)?;
        }
        x = dec_mul(x, x)?;
        n /= 2;
    }
    dec_mul(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: u128 = DECIMAL_PRECISION;

    fn position(debt: u128, rate_bps: u64, last_touch: u64) -> Position {
        let mut p = Position::zeroed();
        p.debt = U128::new(debt);
        p.rank_key = rate_bps;
        p.last_touch_slot = last_touch;
        p
    }

    #[test]
    fn simple_interest_one_year() {
        let model = SimpleInterest { management_fee_bps: 100 };
        let p = position(10_000 * ONE, 500, 1_000);
        let now = 1_000 + SLOTS_PER_YEAR;
        assert_eq!(model.accrued_interest(&p, now).unwrap(), 500 * ONE);
        assert_eq!(model.accrued_management_fee(&p, now).unwrap(), 100 * ONE);
        // Clock behind the last touch accrues nothing.
        assert_eq!(model.accrued_interest(&p, 10).unwrap(), 0);
        assert_eq!(NoAccrual.accrued_interest(&p, now).unwrap(), 0);
    }

    #[test]
    fn dec_pow_matches_half_life() {
        assert_eq!(dec_pow(BASE_RATE_DECAY_FACTOR, 0).unwrap(), ONE);
        assert_eq!(dec_pow(BASE_RATE_DECAY_FACTOR, 1).unwrap(), BASE_RATE_DECAY_FACTOR);
        // 720 minutes is one half-life.
        let half = dec_pow(BASE_RATE_DECAY_FACTOR, 720).unwrap();
        assert!(half > ONE / 2 - ONE / 1_000 && half < ONE / 2 + ONE / 1_000);
        assert_eq!(dec_pow(BASE_RATE_DECAY_FACTOR, u64::MAX).unwrap(), 0);
    }

    #[test]
    fn base_rate_bumps_and_decays() {
        let floor = 5 * ONE / 1_000;
        let mut fee = BaseRateFee::new(floor);
        assert_eq!(fee.redemption_rate(0, 1_000 * ONE, 0).unwrap(), floor);

        // Redeeming 10% raises the base rate by 5%.
        let quote = fee.redemption_rate(100 * ONE, 1_000 * ONE, 0).unwrap();
        assert_eq!(quote, floor + ONE / 20);
        fee.record_redemption(100 * ONE, 1_000 * ONE, 0).unwrap();
        assert_eq!(fee.base_rate.get(), ONE / 20);

        let later = 720 * SLOTS_PER_FEE_PERIOD;
        let decayed = fee.decayed_base_rate(later).unwrap();
        assert!(decayed < ONE / 39 && decayed > ONE / 41);
    }

    #[test]
    fn rate_is_capped_at_one() {
        let fee = BaseRateFee::new(5 * ONE / 1_000);
        assert_eq!(fee.redemption_rate(10_000 * ONE, 1_000 * ONE, 0).unwrap(), ONE);
        assert_eq!(FlatRedemptionFee(2 * ONE).redemption_rate(1, 1, 0).unwrap(), ONE);
    }

    #[test]
    fn record_advances_by_whole_periods() {
        let mut fee = BaseRateFee::new(0);
        fee.record_redemption(ONE, 100 * ONE, 2 * SLOTS_PER_FEE_PERIOD + 7).unwrap();
        assert_eq!(fee.last_fee_op_slot, 2 * SLOTS_PER_FEE_PERIOD);
    }
}
