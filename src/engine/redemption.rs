//! Redemption sweep: stablecoin in, collateral out at par, lowest interest
//! rate first.

use super::fees::{InterestAccrual, RedemptionFeeModel};
use super::wide::{compute_cr, mul_div, DECIMAL_PRECISION, U128};
use super::{Engine, EngineError, PositionStatus, Result, MANAGER, NIL};

/// Totals of one redemption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedemptionOutcome {
    /// Debt cancelled (stablecoin the caller burns)
    pub redeemed: u128,
    /// Collateral paid to the caller, net of the fee
    pub coll_drawn: u128,
    /// Collateral fee kept in the redeemed positions
    pub coll_fee: u128,
    pub fee_rate: u128,
    /// Positions whose net debt was fully cleared
    pub positions_cleared: u32,
    pub positions_partial: u32,
    /// Positions visited, including the ones stepped over
    pub visited: u32,
}

impl Engine {
    /// Redeem up to `amount` of stablecoin against positions from the
    /// lowest-rank end of the registry.
    ///
    /// `max_iterations` bounds the positions visited (0 = unlimited).
    #[allow(clippy::too_many_arguments)]
    pub fn redeem<F: RedemptionFeeModel, A: InterestAccrual>(
        &mut self,
        fee_model: &mut F,
        accrual: &A,
        caller_balance: u128,
        amount: u128,
        max_iterations: u16,
        max_fee: u128,
        price: u128,
        now_slot: u64,
    ) -> Result<RedemptionOutcome> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        if max_fee < self.params.redemption_fee_floor.get() || max_fee > DECIMAL_PRECISION {
            return Err(EngineError::FeeOutOfBand);
        }
        if amount > caller_balance {
            return Err(EngineError::InsufficientBalance);
        }
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        if self.tcr(price) < self.params.mcr.get() {
            return Err(EngineError::TcrBelowMcr);
        }
        let total_debt = self.entire_system_debt();
        let fee_rate = fee_model.redemption_rate(amount, total_debt, now_slot)?;
        if fee_rate > max_fee {
            return Err(EngineError::FeeExceedsMax);
        }

        let reserve = self.params.liquidation_reserve.get();
        let mut out = RedemptionOutcome { fee_rate, ..Default::default() };
        let mut remaining = amount;
        let mut cur = self.registry.last();

        while cur != NIL && remaining > 0 {
            if max_iterations != 0 && out.visited >= max_iterations as u32 {
                break;
            }
            out.visited += 1;
            let idx = cur;
            // Walk toward higher ranks.
            cur = self.registry.prev(idx);

            let ps = self.pending_state(accrual, idx, now_slot)?;
            if compute_cr(ps.coll, ps.debt, price) < DECIMAL_PRECISION {
                continue;
            }
            let net_debt = ps.debt.saturating_sub(reserve);
            let lot = remaining.min(net_debt);
            if lot == 0 {
                continue;
            }
            let coll_lot = mul_div(lot, DECIMAL_PRECISION, price)?;
            let fee = mul_div(coll_lot, fee_rate, DECIMAL_PRECISION)?;
            let drawn = coll_lot - fee;

            self.commit_touch(idx, &ps, now_slot)?;
            {
                let p = &mut self.positions[idx as usize];
                p.debt.try_sub(lot)?;
                p.collateral.try_sub(drawn)?;
            }
            self.totals.active_debt.try_sub(lot)?;
            self.totals.active_coll.try_sub(drawn)?;

            if lot == net_debt {
                self.retire_redeemed(idx)?;
                out.positions_cleared += 1;
            } else {
                out.positions_partial += 1;
            }

            remaining -= lot;
            out.redeemed += lot;
            out.coll_drawn += drawn;
            out.coll_fee += fee;
        }

        if out.redeemed == 0 {
            return Err(EngineError::NothingToRedeem);
        }
        fee_model.record_redemption(out.redeemed, total_debt, now_slot)?;
        self.lifetime_redemptions = self.lifetime_redemptions.saturating_add(1);
        Ok(out)
    }

    /// Position redeemed down to its reserve: drop it from the registry and
    /// the stake pool, and move its collateral to the owner's surplus.
    fn retire_redeemed(&mut self, idx: u16) -> Result<()> {
        let stake = self.positions[idx as usize].stake.get();
        let surplus = self.positions[idx as usize].collateral.get();
        self.totals.total_stakes.try_sub(stake)?;
        self.registry.remove(&MANAGER, idx)?;
        self.remove_active(idx);
        self.totals.active_coll.try_sub(surplus)?;
        self.totals.surplus_coll.try_add(surplus)?;

        let p = &mut self.positions[idx as usize];
        p.stake = U128::ZERO;
        p.collateral = U128::ZERO;
        p.surplus = U128::new(surplus);
        p.status = PositionStatus::Unredeemable as u8;
        Ok(())
    }
}
