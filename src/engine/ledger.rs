//! Position lifecycle and the lazy reward pull.
//!
//! Every entry point computes the touched state virtually first
//! (`pending_state`), validates against it, and only then commits, so a
//! rejected call leaves the engine untouched.

use super::fees::InterestAccrual;
use super::wide::{compute_cr, mul_div, DECIMAL_PRECISION, U128};
use super::{
    Engine, EngineError, Position, PositionStatus, Result, BORROWER, BPS_DENOMINATOR, MANAGER, MAX_POSITIONS, NIL,
};

/// A position as it would look after a touch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct PendingState {
    pub coll: u128,
    pub debt: u128,
    pub coll_reward: u128,
    pub debt_reward: u128,
    pub interest: u128,
    pub management_fee: u128,
}

impl PendingState {
    #[inline]
    pub fn debt_growth(&self) -> u128 {
        self.interest.saturating_add(self.management_fee)
    }
}

/// Result of `open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOutcome {
    pub slot: u16,
    pub position_id: u64,
    /// Debt handed to the borrower
    pub borrowed: u128,
    /// Reserve added on top of the borrowed amount
    pub reserve: u128,
    pub stake: u128,
}

/// Requested change to a position. At most one side of each pair may be set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PositionAdjustment {
    pub coll_in: u128,
    pub coll_out: u128,
    pub debt_in: u128,
    pub debt_out: u128,
}

impl PositionAdjustment {
    fn validate(&self) -> Result<()> {
        let coll_both = self.coll_in > 0 && self.coll_out > 0;
        let debt_both = self.debt_in > 0 && self.debt_out > 0;
        let none = self.coll_in == 0 && self.coll_out == 0 && self.debt_in == 0 && self.debt_out == 0;
        if coll_both || debt_both || none {
            return Err(EngineError::InvalidAdjustment);
        }
        Ok(())
    }

    #[inline]
    fn changes_debt(&self) -> bool {
        self.debt_in > 0 || self.debt_out > 0
    }
}

/// Result of `adjust_position`: the position after the change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustOutcome {
    pub collateral: u128,
    pub debt: u128,
    pub stake: u128,
}

/// Result of `close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseOutcome {
    pub coll_returned: u128,
    /// Debt the owner repays (excludes the reserve)
    pub debt_repaid: u128,
    /// Reserve burned from the stable vault
    pub reserve_burned: u128,
}

/// Result of `claim_surplus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub coll_paid: u128,
    /// Reserve burned from the stable vault (redeemed positions only)
    pub reserve_burned: u128,
}

impl Engine {
    // ========================================
    // Rewards and touch
    // ========================================

    fn pending_rewards(&self, p: &Position) -> Result<(u128, u128)> {
        if !p.is_active() || p.stake.is_zero() {
            return Ok((0, 0));
        }
        let stake = p.stake.get();
        let d_coll = self
            .totals
            .l_coll
            .get()
            .checked_sub(p.snapshot_l_coll.get())
            .ok_or(EngineError::Overflow)?;
        let d_debt = self
            .totals
            .l_debt
            .get()
            .checked_sub(p.snapshot_l_debt.get())
            .ok_or(EngineError::Overflow)?;
        Ok((mul_div(stake, d_coll, DECIMAL_PRECISION)?, mul_div(stake, d_debt, DECIMAL_PRECISION)?))
    }

    pub(super) fn pending_state<A: InterestAccrual>(&self, accrual: &A, idx: u16, now_slot: u64) -> Result<PendingState> {
        let p = &self.positions[idx as usize];
        let (coll_reward, debt_reward) = self.pending_rewards(p)?;
        let interest = accrual.accrued_interest(p, now_slot)?;
        let management_fee = accrual.accrued_management_fee(p, now_slot)?;
        let coll = p.collateral.get().checked_add(coll_reward).ok_or(EngineError::Overflow)?;
        let debt = p
            .debt
            .get()
            .checked_add(debt_reward)
            .and_then(|d| d.checked_add(interest))
            .and_then(|d| d.checked_add(management_fee))
            .ok_or(EngineError::Overflow)?;
        Ok(PendingState { coll, debt, coll_reward, debt_reward, interest, management_fee })
    }

    /// Move pending redistribution rewards from the default pool into the
    /// position and refresh its snapshot.
    fn pull_rewards(&mut self, idx: u16, coll_reward: u128, debt_reward: u128) -> Result<()> {
        let (l_coll, l_debt) = (self.totals.l_coll, self.totals.l_debt);
        let p = &mut self.positions[idx as usize];
        p.collateral.try_add(coll_reward)?;
        p.debt.try_add(debt_reward)?;
        p.snapshot_l_coll = l_coll;
        p.snapshot_l_debt = l_debt;

        if coll_reward > 0 || debt_reward > 0 {
            self.totals.default_coll.try_sub(coll_reward)?;
            self.totals.default_debt.try_sub(debt_reward)?;
            self.totals.active_coll.try_add(coll_reward)?;
            self.totals.active_debt.try_add(debt_reward)?;
        }
        Ok(())
    }

    pub(super) fn commit_touch(&mut self, idx: u16, ps: &PendingState, now_slot: u64) -> Result<()> {
        self.pull_rewards(idx, ps.coll_reward, ps.debt_reward)?;

        let growth = ps.debt_growth();
        if growth > 0 {
            self.positions[idx as usize].debt.try_add(growth)?;
            self.totals.active_debt.try_add(growth)?;
            self.totals.pending_mint.try_add(growth)?;

            let to_buffer = mul_div(ps.interest, self.params.yield_split_bps as u128, BPS_DENOMINATOR)?;
            self.buffer.credit_yield(&MANAGER, to_buffer)?;
            self.totals.protocol_fees.try_add(growth - to_buffer)?;
        }

        let p = &mut self.positions[idx as usize];
        if now_slot > p.last_touch_slot {
            p.last_touch_slot = now_slot;
        }
        self.observe_slot(now_slot);
        Ok(())
    }

    /// Pull pending redistribution rewards into an active position.
    /// Idempotent.
    pub fn apply_pending_rewards(&mut self, idx: u16) -> Result<()> {
        self.require_active(idx)?;
        let (coll_reward, debt_reward) = self.pending_rewards(&self.positions[idx as usize])?;
        self.pull_rewards(idx, coll_reward, debt_reward)
    }

    /// Apply pending rewards and accrued interest.
    pub fn touch<A: InterestAccrual>(&mut self, accrual: &A, idx: u16, now_slot: u64) -> Result<()> {
        self.require_active(idx)?;
        let ps = self.pending_state(accrual, idx, now_slot)?;
        self.commit_touch(idx, &ps, now_slot)
    }

    /// ICR of an active position with pending rewards and accrued interest
    /// applied virtually, i.e. the ratio liquidation would judge it by.
    pub fn get_current_icr<A: InterestAccrual>(&self, accrual: &A, idx: u16, price: u128, now_slot: u64) -> Result<u128> {
        self.require_active(idx)?;
        let ps = self.pending_state(accrual, idx, now_slot)?;
        Ok(compute_cr(ps.coll, ps.debt, price))
    }

    /// (debt, collateral) including pending rewards and interest.
    pub fn get_entire_debt_and_coll<A: InterestAccrual>(&self, accrual: &A, idx: u16, now_slot: u64) -> Result<(u128, u128)> {
        self.require_active(idx)?;
        let ps = self.pending_state(accrual, idx, now_slot)?;
        Ok((ps.debt, ps.coll))
    }

    /// Stake for `coll` at the system ratio of the last liquidation.
    fn compute_new_stake(&self, coll: u128) -> Result<u128> {
        let coll_snapshot = self.totals.total_collateral_snapshot.get();
        let stakes_snapshot = self.totals.total_stakes_snapshot.get();
        if coll_snapshot == 0 || stakes_snapshot == 0 {
            return Ok(coll);
        }
        mul_div(coll, stakes_snapshot, coll_snapshot)
    }

    fn replace_stake(&mut self, idx: u16, new_coll: u128) -> Result<u128> {
        let new_stake = self.compute_new_stake(new_coll)?;
        let old_stake = self.positions[idx as usize].stake.get();
        self.totals.total_stakes.try_sub(old_stake)?;
        self.totals.total_stakes.try_add(new_stake)?;
        self.positions[idx as usize].stake.set(new_stake);
        Ok(new_stake)
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Open a position with `collateral` and `debt` drawn (excluding the
    /// reserve).
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        owner: [u8; 32],
        collateral: u128,
        debt: u128,
        rank_key: u64,
        hint_prev: u16,
        hint_next: u16,
        price: u128,
        now_slot: u64,
    ) -> Result<OpenOutcome> {
        if collateral == 0 {
            return Err(EngineError::ZeroAmount);
        }
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        if debt < self.params.min_net_debt.get() {
            return Err(EngineError::BelowMinimumDebt);
        }
        let reserve = self.params.liquidation_reserve.get();
        let composite = debt.checked_add(reserve).ok_or(EngineError::Overflow)?;

        let icr = compute_cr(collateral, composite, price);
        let ccr = self.params.ccr.get();
        if self.is_recovery_mode(price) {
            if icr < ccr {
                return Err(EngineError::BelowCcr);
            }
        } else {
            if icr < self.params.mcr.get() {
                return Err(EngineError::BelowMcr);
            }
            let new_tcr = compute_cr(
                self.entire_system_coll().saturating_add(collateral),
                self.entire_system_debt().saturating_add(composite),
                price,
            );
            if new_tcr < ccr {
                return Err(EngineError::BelowCcr);
            }
        }

        let stake = self.compute_new_stake(collateral)?;
        let idx = self.alloc_slot()?;
        let position_id = self.next_position_id;
        self.next_position_id = self.next_position_id.saturating_add(1);

        self.positions[idx as usize] = Position {
            position_id,
            owner,
            collateral: U128::new(collateral),
            debt: U128::new(composite),
            stake: U128::new(stake),
            snapshot_l_coll: self.totals.l_coll,
            snapshot_l_debt: self.totals.l_debt,
            surplus: U128::ZERO,
            rank_key,
            last_touch_slot: now_slot,
            array_index: 0,
            status: PositionStatus::Active as u8,
            _padding: [0; 5],
        };
        self.registry.insert(&BORROWER, idx, rank_key, hint_prev, hint_next)?;
        self.push_active(idx);

        self.totals.total_stakes.try_add(stake)?;
        self.totals.active_coll.try_add(collateral)?;
        self.totals.active_debt.try_add(composite)?;
        self.observe_slot(now_slot);

        Ok(OpenOutcome { slot: idx, position_id, borrowed: debt, reserve, stake })
    }

    /// Add or withdraw collateral and draw or repay debt.
    pub fn adjust_position<A: InterestAccrual>(
        &mut self,
        accrual: &A,
        idx: u16,
        owner: &[u8; 32],
        adj: PositionAdjustment,
        price: u128,
        now_slot: u64,
    ) -> Result<AdjustOutcome> {
        self.require_active(idx)?;
        self.require_owner(idx, owner)?;
        adj.validate()?;
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }

        let ps = self.pending_state(accrual, idx, now_slot)?;
        if adj.coll_out > ps.coll {
            return Err(EngineError::InsufficientBalance);
        }
        if adj.debt_out > self.net_debt(ps.debt) {
            return Err(EngineError::InvalidAdjustment);
        }
        let new_coll = (ps.coll - adj.coll_out).checked_add(adj.coll_in).ok_or(EngineError::Overflow)?;
        let new_debt = (ps.debt - adj.debt_out).checked_add(adj.debt_in).ok_or(EngineError::Overflow)?;
        if adj.changes_debt() && self.net_debt(new_debt) < self.params.min_net_debt.get() {
            return Err(EngineError::BelowMinimumDebt);
        }

        let old_icr = compute_cr(ps.coll, ps.debt, price);
        let new_icr = compute_cr(new_coll, new_debt, price);
        if self.is_recovery_mode(price) {
            if adj.coll_out > 0 {
                return Err(EngineError::RecoveryModeRestricted);
            }
            if adj.debt_in > 0 {
                if new_icr < self.params.ccr.get() {
                    return Err(EngineError::BelowCcr);
                }
                if new_icr < old_icr {
                    return Err(EngineError::RecoveryModeRestricted);
                }
            }
        } else {
            if new_icr < self.params.mcr.get() {
                return Err(EngineError::BelowMcr);
            }
            let sys_coll = (self.entire_system_coll().saturating_add(adj.coll_in)).saturating_sub(adj.coll_out);
            let sys_debt = self
                .entire_system_debt()
                .saturating_add(ps.debt_growth())
                .saturating_add(adj.debt_in)
                .saturating_sub(adj.debt_out);
            if compute_cr(sys_coll, sys_debt, price) < self.params.ccr.get() {
                return Err(EngineError::BelowCcr);
            }
        }

        self.commit_touch(idx, &ps, now_slot)?;
        {
            let p = &mut self.positions[idx as usize];
            p.collateral.set(new_coll);
            p.debt.set(new_debt);
        }
        self.totals.active_coll.try_add(adj.coll_in)?;
        self.totals.active_coll.try_sub(adj.coll_out)?;
        self.totals.active_debt.try_add(adj.debt_in)?;
        self.totals.active_debt.try_sub(adj.debt_out)?;
        let stake = self.replace_stake(idx, new_coll)?;

        Ok(AdjustOutcome { collateral: new_coll, debt: new_debt, stake })
    }

    /// Change the position's interest rate, which moves it in the registry.
    #[allow(clippy::too_many_arguments)]
    pub fn adjust_rank<A: InterestAccrual>(
        &mut self,
        accrual: &A,
        idx: u16,
        owner: &[u8; 32],
        new_rank_key: u64,
        hint_prev: u16,
        hint_next: u16,
        now_slot: u64,
    ) -> Result<()> {
        self.require_active(idx)?;
        self.require_owner(idx, owner)?;
        // Interest up to now is charged at the old rate.
        let ps = self.pending_state(accrual, idx, now_slot)?;
        self.commit_touch(idx, &ps, now_slot)?;
        self.registry.reinsert(&BORROWER, idx, new_rank_key, hint_prev, hint_next)?;
        self.positions[idx as usize].rank_key = new_rank_key;
        Ok(())
    }

    /// Repay and close. `caller_balance` is the owner's stablecoin balance.
    ///
    /// The last active position cannot close: the remaining system would
    /// have no collateral and so a ratio of zero.
    #[allow(clippy::too_many_arguments)]
    pub fn close<A: InterestAccrual>(
        &mut self,
        accrual: &A,
        idx: u16,
        owner: &[u8; 32],
        caller_balance: u128,
        price: u128,
        now_slot: u64,
    ) -> Result<CloseOutcome> {
        self.require_active(idx)?;
        self.require_owner(idx, owner)?;
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        if self.is_recovery_mode(price) {
            return Err(EngineError::RecoveryModeRestricted);
        }

        let ps = self.pending_state(accrual, idx, now_slot)?;
        let remaining_coll = self.entire_system_coll().saturating_sub(ps.coll);
        let remaining_debt = self.entire_system_debt().saturating_add(ps.debt_growth()).saturating_sub(ps.debt);
        if compute_cr(remaining_coll, remaining_debt, price) < self.params.ccr.get() {
            return Err(EngineError::BelowCcr);
        }
        let debt_repaid = self.net_debt(ps.debt);
        if caller_balance < debt_repaid {
            return Err(EngineError::InsufficientBalance);
        }

        self.commit_touch(idx, &ps, now_slot)?;
        let stake = self.positions[idx as usize].stake.get();
        self.totals.total_stakes.try_sub(stake)?;
        self.registry.remove(&MANAGER, idx)?;
        self.remove_active(idx);
        self.totals.active_coll.try_sub(ps.coll)?;
        self.totals.active_debt.try_sub(ps.debt)?;

        let p = &mut self.positions[idx as usize];
        p.collateral = U128::ZERO;
        p.debt = U128::ZERO;
        p.stake = U128::ZERO;
        p.status = PositionStatus::ClosedByOwner as u8;
        self.free_slot(idx);

        Ok(CloseOutcome { coll_returned: ps.coll, debt_repaid, reserve_burned: ps.debt - debt_repaid })
    }

    /// Pay out the surplus of a liquidated or fully redeemed position and
    /// release its slot.
    pub fn claim_surplus(&mut self, idx: u16, owner: &[u8; 32]) -> Result<ClaimOutcome> {
        if idx as usize >= MAX_POSITIONS || idx == NIL {
            return Err(EngineError::InvalidId);
        }
        if !self.is_used(idx as usize) {
            return Err(EngineError::NoSurplus);
        }
        self.require_owner(idx, owner)?;

        let p = self.positions[idx as usize];
        let out = match p.status() {
            PositionStatus::ClosedByLiquidation if !p.surplus.is_zero() => ClaimOutcome {
                coll_paid: p.surplus.get(),
                reserve_burned: 0,
            },
            PositionStatus::Unredeemable => ClaimOutcome {
                coll_paid: p.surplus.get(),
                reserve_burned: p.debt.get(),
            },
            _ => return Err(EngineError::NoSurplus),
        };

        self.totals.surplus_coll.try_sub(out.coll_paid)?;
        self.totals.active_debt.try_sub(out.reserve_burned)?;
        let p = &mut self.positions[idx as usize];
        p.surplus = U128::ZERO;
        p.debt = U128::ZERO;
        if p.status == PositionStatus::Unredeemable as u8 {
            p.status = PositionStatus::ClosedByOwner as u8;
        }
        self.free_slot(idx);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use super::super::{EngineParams, NoAccrual, SimpleInterest, SLOTS_PER_YEAR};
    use super::*;

    const ONE: u128 = DECIMAL_PRECISION;
    const PRICE: u128 = 2_000 * ONE;

    fn engine() -> Box<Engine> {
        Engine::new_boxed(EngineParams::standard()).unwrap()
    }

    fn open(e: &mut Engine, tag: u8, coll: u128, debt: u128, rank: u64) -> u16 {
        e.open([tag; 32], coll, debt, rank, NIL, NIL, PRICE, 0).unwrap().slot
    }

    #[test]
    fn open_sets_composite_debt_and_stake() {
        let mut e = engine();
        let out = e.open([1; 32], 10 * ONE, 2_000 * ONE, 500, NIL, NIL, PRICE, 7).unwrap();
        let p = e.position(out.slot).unwrap();
        assert_eq!(p.debt.get(), 2_200 * ONE);
        assert_eq!(p.stake.get(), 10 * ONE);
        assert_eq!(p.last_touch_slot, 7);
        assert_eq!(out.position_id, 1);
        assert!(e.registry.contains(out.slot));
        assert_eq!(e.entire_system_debt(), 2_200 * ONE);
        assert_eq!(e.total_stakes(), 10 * ONE);
    }

    #[test]
    fn open_rejections_leave_state_unchanged() {
        let mut e = engine();
        let before = e.clone();
        assert_eq!(e.open([1; 32], 0, 2_000 * ONE, 1, NIL, NIL, PRICE, 0), Err(EngineError::ZeroAmount));
        assert_eq!(e.open([1; 32], 10 * ONE, 100 * ONE, 1, NIL, NIL, PRICE, 0), Err(EngineError::BelowMinimumDebt));
        assert_eq!(e.open([1; 32], 10 * ONE, 2_000 * ONE, 1, NIL, NIL, 0, 0), Err(EngineError::InvalidPrice));
        // 3000 / 2200: above MCR, but as the whole system it is below CCR.
        assert_eq!(e.open([1; 32], 3 * ONE / 2, 2_000 * ONE, 1, NIL, NIL, PRICE, 0), Err(EngineError::BelowCcr));
        // 2000 / 2200 is below MCR.
        assert_eq!(e.open([1; 32], ONE, 2_000 * ONE, 1, NIL, NIL, PRICE, 0), Err(EngineError::BelowMcr));
        assert_eq!(*e, *before);

        // 4000 / 2200 clears both.
        assert!(e.open([1; 32], 2 * ONE, 2_000 * ONE, 1, NIL, NIL, PRICE, 0).is_ok());
    }

    #[test]
    fn adjust_moves_coll_and_debt() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
        open(&mut e, 2, 10 * ONE, 2_000 * ONE, 200);

        let out = e
            .adjust_position(&NoAccrual, a, &[1; 32], PositionAdjustment { coll_in: 5 * ONE, debt_in: 1_000 * ONE, ..Default::default() }, PRICE, 1)
            .unwrap();
        assert_eq!(out.collateral, 15 * ONE);
        assert_eq!(out.debt, 3_200 * ONE);
        assert_eq!(e.totals.active_coll.get(), 25 * ONE);
        assert_eq!(e.total_stakes(), 25 * ONE);

        let bad = PositionAdjustment { coll_in: ONE, coll_out: ONE, ..Default::default() };
        assert_eq!(e.adjust_position(&NoAccrual, a, &[1; 32], bad, PRICE, 1), Err(EngineError::InvalidAdjustment));
        assert_eq!(
            e.adjust_position(&NoAccrual, a, &[1; 32], PositionAdjustment::default(), PRICE, 1),
            Err(EngineError::InvalidAdjustment)
        );
        // Repay more than the net debt.
        let over = PositionAdjustment { debt_out: 3_001 * ONE, ..Default::default() };
        assert_eq!(e.adjust_position(&NoAccrual, a, &[1; 32], over, PRICE, 1), Err(EngineError::InvalidAdjustment));
        // Net debt would drop below the floor.
        let low = PositionAdjustment { debt_out: 1_500 * ONE, ..Default::default() };
        assert_eq!(e.adjust_position(&NoAccrual, a, &[1; 32], low, PRICE, 1), Err(EngineError::BelowMinimumDebt));
        // Someone else's position.
        let ok = PositionAdjustment { coll_in: ONE, ..Default::default() };
        assert_eq!(e.adjust_position(&NoAccrual, a, &[9; 32], ok, PRICE, 1), Err(EngineError::NotOwner));
    }

    #[test]
    fn recovery_mode_blocks_coll_withdrawal() {
        let mut e = engine();
        let a = open(&mut e, 1, 3 * ONE, 2_000 * ONE, 100);
        open(&mut e, 2, 3 * ONE, 2_000 * ONE, 200);
        // TCR = 6000 / 4400 at the lower price.
        let price = 1_000 * ONE;
        assert!(e.is_recovery_mode(price));
        let out = PositionAdjustment { coll_out: ONE / 10, ..Default::default() };
        assert_eq!(e.adjust_position(&NoAccrual, a, &[1; 32], out, price, 1), Err(EngineError::RecoveryModeRestricted));
        let borrow = PositionAdjustment { debt_in: 100 * ONE, ..Default::default() };
        assert_eq!(e.adjust_position(&NoAccrual, a, &[1; 32], borrow, price, 1), Err(EngineError::BelowCcr));
        assert_eq!(e.close(&NoAccrual, a, &[1; 32], u128::MAX, price, 1), Err(EngineError::RecoveryModeRestricted));
        // Topping up is always allowed.
        let top = PositionAdjustment { coll_in: ONE, ..Default::default() };
        assert!(e.adjust_position(&NoAccrual, a, &[1; 32], top, price, 1).is_ok());
    }

    #[test]
    fn close_returns_coll_and_burns_reserve() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
        let b = open(&mut e, 2, 10 * ONE, 2_000 * ONE, 200);

        assert_eq!(e.close(&NoAccrual, a, &[1; 32], 1_999 * ONE, PRICE, 1), Err(EngineError::InsufficientBalance));
        let out = e.close(&NoAccrual, a, &[1; 32], 2_000 * ONE, PRICE, 1).unwrap();
        assert_eq!(out.coll_returned, 10 * ONE);
        assert_eq!(out.debt_repaid, 2_000 * ONE);
        assert_eq!(out.reserve_burned, 200 * ONE);
        assert!(!e.registry.contains(a));
        assert_eq!(e.active_ids(), &[b]);
        assert_eq!(e.status(a), PositionStatus::Nonexistent);
        assert_eq!(e.positions[a as usize].status(), PositionStatus::ClosedByOwner);
        // The last position stays open.
        assert_eq!(e.close(&NoAccrual, b, &[2; 32], u128::MAX, PRICE, 1), Err(EngineError::BelowCcr));
        assert_eq!(e.close(&NoAccrual, a, &[1; 32], u128::MAX, PRICE, 1), Err(EngineError::PositionNotActive));
    }

    #[test]
    fn touch_accrues_interest_and_splits_it() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 1_000);
        let model = SimpleInterest { management_fee_bps: 0 };
        e.touch(&model, a, SLOTS_PER_YEAR).unwrap();
        // 10% of 2200 composite debt.
        let interest = 220 * ONE;
        assert_eq!(e.positions[a as usize].debt.get(), 2_200 * ONE + interest);
        assert_eq!(e.totals.pending_mint.get(), interest);
        let to_buffer = interest * 7_500 / 10_000;
        assert_eq!(e.buffer.yield_pending.get(), to_buffer);
        assert_eq!(e.totals.protocol_fees.get(), interest - to_buffer);
        // Second touch in the same slot adds nothing.
        e.touch(&model, a, SLOTS_PER_YEAR).unwrap();
        assert_eq!(e.positions[a as usize].debt.get(), 2_200 * ONE + interest);
    }

    #[test]
    fn adjust_rank_reorders_registry() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
        let b = open(&mut e, 2, 10 * ONE, 2_000 * ONE, 200);
        assert_eq!(e.registry.last(), a);
        e.adjust_rank(&NoAccrual, a, &[1; 32], 300, NIL, NIL, 1).unwrap();
        assert_eq!(e.registry.last(), b);
        assert_eq!(e.registry.first(), a);
        assert_eq!(e.positions[a as usize].rank_key, 300);
    }

    #[test]
    fn icr_edges() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
        assert_eq!(e.get_current_icr(&NoAccrual, a, PRICE, 0).unwrap(), 20_000 * ONE / 2_200);
        assert_eq!(e.get_current_icr(&NoAccrual, a, 0, 0).unwrap(), 0);
        assert_eq!(e.get_current_icr(&NoAccrual, NIL, PRICE, 0), Err(EngineError::InvalidId));
        assert_eq!(e.get_current_icr(&NoAccrual, 5, PRICE, 0), Err(EngineError::PositionNotActive));
    }

    #[test]
    fn icr_counts_accrued_interest_and_skips_retired_positions() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 1_000);
        let b = open(&mut e, 2, 10 * ONE, 2_000 * ONE, 2_000);
        let model = SimpleInterest { management_fee_bps: 0 };
        // A year at 10% on 2200.
        let icr = e.get_current_icr(&model, a, PRICE, SLOTS_PER_YEAR).unwrap();
        assert_eq!(icr, 20_000 * ONE / 2_420);
        assert!(icr < e.get_current_icr(&NoAccrual, a, PRICE, SLOTS_PER_YEAR).unwrap());
        // Reading does not touch.
        assert_eq!(e.positions[a as usize].debt.get(), 2_200 * ONE);

        let floor = e.params.redemption_fee_floor.get();
        let mut fee = super::super::FlatRedemptionFee(floor);
        e.redeem(&mut fee, &NoAccrual, 2_000 * ONE, 2_000 * ONE, 1, floor, PRICE, 1).unwrap();
        assert_eq!(e.status(a), PositionStatus::Unredeemable);
        assert_eq!(e.get_current_icr(&NoAccrual, a, PRICE, 1), Err(EngineError::PositionNotActive));
        assert!(e.get_current_icr(&NoAccrual, b, PRICE, 1).is_ok());
    }

    #[test]
    fn claim_surplus_requires_something_to_claim() {
        let mut e = engine();
        let a = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
        assert_eq!(e.claim_surplus(a, &[1; 32]), Err(EngineError::NoSurplus));
        assert_eq!(e.claim_surplus(a, &[2; 32]), Err(EngineError::NotOwner));
        assert_eq!(e.claim_surplus(NIL, &[1; 32]), Err(EngineError::InvalidId));
    }
}
