//! Single and batch liquidation.
//!
//! Each liquidated position is closed immediately, but the buffer offset and
//! the redistribution for the whole call are applied once at the end, from
//! totals accumulated across the batch.

use primitive_types::U256;

use super::fees::InterestAccrual;
use super::ledger::PendingState;
use super::wide::{compute_cr, mul_div, narrow, DECIMAL_PRECISION, U128};
use super::{Engine, EngineError, PositionStatus, Result, MANAGER, MAX_POSITIONS};

/// Totals of one liquidation call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiquidationOutcome {
    /// Positions liquidated
    pub liquidated: u32,
    /// Debt burned against the stability buffer
    pub debt_offset: u128,
    /// Collateral awarded to buffer depositors
    pub coll_to_buffer: u128,
    pub debt_redistributed: u128,
    pub coll_redistributed: u128,
    /// Collateral left to owners (capped recovery-mode liquidations)
    pub coll_surplus: u128,
    /// Collateral paid to the caller
    pub coll_compensation: u128,
    /// Stablecoin reserves paid to the caller
    pub reserve_compensation: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SingleLiquidation {
    debt_offset: u128,
    coll_to_buffer: u128,
    debt_redistributed: u128,
    coll_redistributed: u128,
    coll_surplus: u128,
    coll_compensation: u128,
}

impl SingleLiquidation {
    fn redistributes(&self) -> bool {
        self.debt_redistributed > 0 || self.coll_redistributed > 0
    }
}

/// Running system totals while a batch is processed.
struct BatchCursor {
    remaining_buffer: u128,
    entire_coll: u128,
    entire_debt: u128,
    recovery: bool,
}

impl BatchCursor {
    fn tcr(&self, price: u128) -> u128 {
        compute_cr(self.entire_coll, self.entire_debt, price)
    }
}

impl LiquidationOutcome {
    fn add(&mut self, s: &SingleLiquidation, reserve: u128) {
        self.liquidated += 1;
        self.debt_offset = self.debt_offset.saturating_add(s.debt_offset);
        self.coll_to_buffer = self.coll_to_buffer.saturating_add(s.coll_to_buffer);
        self.debt_redistributed = self.debt_redistributed.saturating_add(s.debt_redistributed);
        self.coll_redistributed = self.coll_redistributed.saturating_add(s.coll_redistributed);
        self.coll_surplus = self.coll_surplus.saturating_add(s.coll_surplus);
        self.coll_compensation = self.coll_compensation.saturating_add(s.coll_compensation);
        self.reserve_compensation = self.reserve_compensation.saturating_add(reserve);
    }

    fn redistributes(&self) -> bool {
        self.debt_redistributed > 0 || self.coll_redistributed > 0
    }
}

impl Engine {
    /// Liquidate one position. Anything that would make a batch skip it is
    /// an error here.
    pub fn liquidate<A: InterestAccrual>(
        &mut self,
        accrual: &A,
        idx: u16,
        price: u128,
        now_slot: u64,
    ) -> Result<LiquidationOutcome> {
        self.liquidate_positions(accrual, &[idx], price, now_slot, false)
    }

    /// Liquidate every eligible position in `ids`, in order. Ineligible ids
    /// are skipped; fails only if none was liquidated.
    pub fn batch_liquidate<A: InterestAccrual>(
        &mut self,
        accrual: &A,
        ids: &[u16],
        price: u128,
        now_slot: u64,
    ) -> Result<LiquidationOutcome> {
        if ids.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        self.liquidate_positions(accrual, ids, price, now_slot, true)
    }

    fn liquidate_positions<A: InterestAccrual>(
        &mut self,
        accrual: &A,
        ids: &[u16],
        price: u128,
        now_slot: u64,
        skip_ineligible: bool,
    ) -> Result<LiquidationOutcome> {
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        let ccr = self.params.ccr.get();
        let reserve = self.params.liquidation_reserve.get();
        let mut cursor = BatchCursor {
            remaining_buffer: self.buffer.total_deposits(),
            entire_coll: self.entire_system_coll(),
            entire_debt: self.entire_system_debt(),
            recovery: self.is_recovery_mode(price),
        };
        let mut out = LiquidationOutcome::default();

        for &idx in ids {
            let (ps, single) = match self.assess(accrual, idx, price, now_slot, &cursor, &out) {
                Ok(v) => v,
                Err(_) if skip_ineligible => continue,
                Err(e) => return Err(e),
            };

            self.close_liquidated(idx, &ps, &single, now_slot)?;

            cursor.remaining_buffer -= single.debt_offset;
            cursor.entire_debt = cursor
                .entire_debt
                .saturating_add(ps.debt_growth())
                .saturating_sub(single.debt_offset);
            cursor.entire_coll = cursor
                .entire_coll
                .saturating_sub(single.coll_to_buffer)
                .saturating_sub(single.coll_compensation)
                .saturating_sub(single.coll_surplus);
            // Once back to normal mode the rest of the batch stays there.
            if cursor.recovery {
                cursor.recovery = cursor.entire_debt > 0 && cursor.tcr(price) < ccr;
            }
            out.add(&single, reserve);
        }

        if out.liquidated == 0 {
            return Err(EngineError::NothingToLiquidate);
        }

        if out.debt_offset > 0 {
            let absorbed = self.buffer.offset(&MANAGER, out.debt_offset, out.coll_to_buffer)?;
            if absorbed != out.debt_offset {
                return Err(EngineError::BufferInvariant);
            }
            self.totals.pending_burn.try_add(absorbed)?;
        }
        self.redistribute(out.debt_redistributed, out.coll_redistributed)?;
        self.update_system_snapshots();
        self.lifetime_liquidations = self.lifetime_liquidations.saturating_add(out.liquidated as u64);
        Ok(out)
    }

    /// Decide what liquidating `idx` would do, without mutating anything.
    #[allow(clippy::too_many_arguments)]
    fn assess<A: InterestAccrual>(
        &self,
        accrual: &A,
        idx: u16,
        price: u128,
        now_slot: u64,
        cursor: &BatchCursor,
        so_far: &LiquidationOutcome,
    ) -> Result<(PendingState, SingleLiquidation)> {
        if idx as usize >= MAX_POSITIONS {
            return Err(EngineError::InvalidId);
        }
        if !self.is_used(idx as usize) || !self.positions[idx as usize].is_active() {
            return Err(EngineError::PositionNotActive);
        }
        let ps = self.pending_state(accrual, idx, now_slot)?;
        let icr = compute_cr(ps.coll, ps.debt, price);
        let mcr = self.params.mcr.get();

        let single = if !cursor.recovery {
            if icr >= mcr {
                return Err(EngineError::NothingToLiquidate);
            }
            self.offset_and_redistribute(ps.coll, ps.debt, cursor.remaining_buffer)?
        } else if icr <= DECIMAL_PRECISION {
            let coll_compensation = ps.coll / self.params.coll_gas_comp_divisor as u128;
            SingleLiquidation {
                debt_redistributed: ps.debt,
                coll_redistributed: ps.coll - coll_compensation,
                coll_compensation,
                ..Default::default()
            }
        } else if icr < mcr {
            self.offset_and_redistribute(ps.coll, ps.debt, cursor.remaining_buffer)?
        } else if icr < cursor.tcr(price) && ps.debt <= cursor.remaining_buffer {
            self.capped_offset(ps.coll, ps.debt, price)?
        } else {
            return Err(EngineError::NothingToLiquidate);
        };

        if single.redistributes() || so_far.redistributes() {
            let stake = self.positions[idx as usize].stake.get();
            if self.total_stakes().saturating_sub(stake) == 0 {
                return Err(EngineError::NoRedistributionTarget);
            }
        }
        Ok((ps, single))
    }

    /// Offset as much debt as the buffer holds; redistribute the rest.
    fn offset_and_redistribute(&self, coll: u128, debt: u128, remaining_buffer: u128) -> Result<SingleLiquidation> {
        let coll_compensation = coll / self.params.coll_gas_comp_divisor as u128;
        let coll_to_liquidate = coll - coll_compensation;

        let debt_offset = debt.min(remaining_buffer);
        let coll_to_buffer = if debt_offset == 0 { 0 } else { mul_div(coll_to_liquidate, debt_offset, debt)? };
        Ok(SingleLiquidation {
            debt_offset,
            coll_to_buffer,
            debt_redistributed: debt - debt_offset,
            coll_redistributed: coll_to_liquidate - coll_to_buffer,
            coll_surplus: 0,
            coll_compensation,
        })
    }

    /// Recovery-mode offset of a position between MCR and TCR: the buffer
    /// takes collateral worth `debt * MCR`, the owner keeps the rest.
    fn capped_offset(&self, coll: u128, debt: u128, price: u128) -> Result<SingleLiquidation> {
        let capped_coll = mul_div(debt, self.params.mcr.get(), price)?.min(coll);
        let coll_compensation = capped_coll / self.params.coll_gas_comp_divisor as u128;
        Ok(SingleLiquidation {
            debt_offset: debt,
            coll_to_buffer: capped_coll - coll_compensation,
            debt_redistributed: 0,
            coll_redistributed: 0,
            coll_surplus: coll - capped_coll,
            coll_compensation,
        })
    }

    fn close_liquidated(&mut self, idx: u16, ps: &PendingState, single: &SingleLiquidation, now_slot: u64) -> Result<()> {
        self.commit_touch(idx, ps, now_slot)?;
        let stake = self.positions[idx as usize].stake.get();
        self.totals.total_stakes.try_sub(stake)?;
        self.registry.remove(&MANAGER, idx)?;
        self.remove_active(idx);
        self.totals.active_coll.try_sub(ps.coll)?;
        self.totals.active_debt.try_sub(ps.debt)?;
        self.totals.surplus_coll.try_add(single.coll_surplus)?;

        let p = &mut self.positions[idx as usize];
        p.collateral = U128::ZERO;
        p.debt = U128::ZERO;
        p.stake = U128::ZERO;
        p.surplus = U128::new(single.coll_surplus);
        p.status = PositionStatus::ClosedByLiquidation as u8;
        if single.coll_surplus == 0 {
            self.free_slot(idx);
        }
        Ok(())
    }

    /// Spread debt and collateral over all remaining stakes via the L
    /// accumulators, carrying division remainders forward.
    fn redistribute(&mut self, debt: u128, coll: u128) -> Result<()> {
        if debt == 0 && coll == 0 {
            return Ok(());
        }
        let stakes = self.total_stakes();
        if stakes == 0 {
            return Err(EngineError::NoRedistributionTarget);
        }
        let stakes_w = U256::from(stakes);
        let precision = U256::from(DECIMAL_PRECISION);

        let coll_numerator = U256::from(coll) * precision + U256::from(self.totals.last_coll_error.get());
        let coll_per_stake = coll_numerator / stakes_w;
        let debt_numerator = U256::from(debt) * precision + U256::from(self.totals.last_debt_error.get());
        let debt_per_stake = debt_numerator / stakes_w;

        self.totals.last_coll_error.set(narrow(coll_numerator - coll_per_stake * stakes_w)?);
        self.totals.last_debt_error.set(narrow(debt_numerator - debt_per_stake * stakes_w)?);
        self.totals.l_coll.try_add(narrow(coll_per_stake)?)?;
        self.totals.l_debt.try_add(narrow(debt_per_stake)?)?;

        self.totals.default_coll.try_add(coll)?;
        self.totals.default_debt.try_add(debt)?;
        Ok(())
    }

    fn update_system_snapshots(&mut self) {
        self.totals.total_stakes_snapshot = self.totals.total_stakes;
        self.totals.total_collateral_snapshot = U128::new(self.entire_system_coll());
    }
}
