//! Stability buffer.
//!
//! Depositors pool stablecoin that liquidations burn against seized
//! collateral. Per-depositor balances are never iterated: each depositor
//! keeps a snapshot of the running product `P` and of the gain sums `S`
//! (collateral) and `B` (interest yield) for the epoch/scale it joined in,
//! and everything is derived lazily from the difference.
//!
//! `P` starts at 1e18 and is multiplied by `(1 - loss per unit)` on every
//! offset. Whenever it would drop below 1e9 it is rescaled by 1e9 and
//! `current_scale` advances, so about nine significant digits survive any
//! number of near-total depletions. A full depletion starts a new epoch.
//!
//! Sums are kept per (epoch, scale) in a bounded history table. An entry is
//! retained while it is current, while a depositor snapshot points at it, or
//! while a snapshot points at the entry one scale below it (whose gains read
//! `S[scale + 1]`). That bounds the table at two entries per depositor plus
//! the current one.

use bytemuck::{Pod, Zeroable};
use primitive_types::U256;

use super::wide::{mul_div, narrow, DECIMAL_PRECISION, U128, W256};
use super::{EngineError, ManagerRole, Result, MAX_DEPOSITORS, MAX_SUM_ENTRIES, NIL};

/// Rescale factor applied to `P` on a scale change.
pub const SCALE_FACTOR: u128 = 1_000_000_000;

/// Yield is held back while deposits are below one whole unit.
pub const MIN_DEPOSITS_FOR_YIELD: u128 = DECIMAL_PRECISION;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SumEntry {
    pub epoch: u64,
    pub scale: u64,
    /// Collateral gain sum S[epoch][scale]
    pub sum_s: W256,
    /// Yield gain sum B[epoch][scale]
    pub sum_b: W256,
    /// Depositor snapshots pointing at this entry
    pub direct_refs: u32,
    /// direct_refs + current + snapshots of the entry one scale below
    pub total_refs: u32,
    /// Entry for scale + 1 in the same epoch, or NIL
    pub next: u16,
    pub next_free: u16,
    pub live: u8,
    pub _padding: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Depositor {
    pub owner: [u8; 32],
    /// Balance basis at the last snapshot (zero = no snapshot)
    pub initial_value: U128,
    pub snapshot_p: U128,
    pub snapshot_s: W256,
    pub snapshot_b: W256,
    pub snapshot_epoch: u64,
    pub snapshot_scale: u64,
    /// Realized but unpaid collateral gain
    pub coll_claimable: U128,
    /// Realized but unpaid yield
    pub yield_claimable: U128,
    pub entry: u16,
    pub next_free: u16,
    pub in_use: u8,
    pub _padding: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct StabilityBuffer {
    pub total_deposits: U128,
    /// Running product, 1e18 = 1.0
    pub p: U128,
    pub current_epoch: u64,
    pub current_scale: u64,
    pub last_coll_error: U128,
    pub last_yield_error: U128,
    pub last_loss_error: U128,
    /// Collateral held for depositors (credited, not yet paid)
    pub coll_balance: U128,
    /// Stablecoin yield held for depositors (credited, not yet paid)
    pub yield_balance: U128,
    /// Yield credited while deposits were too small to distribute it
    pub yield_pending: U128,
    pub current_entry: u16,
    pub entry_free_head: u16,
    pub depositor_free_head: u16,
    pub num_depositors: u16,
    pub entries: [SumEntry; MAX_SUM_ENTRIES],
    pub depositors: [Depositor; MAX_DEPOSITORS],
}

/// Result of `provide`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepositOutcome {
    /// Compounded balance after the deposit
    pub new_balance: u128,
    /// Collateral gain moved into the claimable stash
    pub coll_realized: u128,
    /// Yield moved into the claimable stash
    pub yield_realized: u128,
}

/// Result of `withdraw`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WithdrawOutcome {
    /// Stablecoin returned (capped at the compounded balance)
    pub withdrawn: u128,
    /// Collateral gains paid out
    pub coll_paid: u128,
    /// Yield paid out
    pub yield_paid: u128,
    /// Compounded balance left in the buffer
    pub remaining: u128,
    /// Whether the depositor slot was released
    pub released: bool,
}

impl StabilityBuffer {
    /// Initialize over zeroed memory.
    pub fn init(&mut self) {
        self.p = U128::new(DECIMAL_PRECISION);
        self.current_epoch = 0;
        self.current_scale = 0;

        for i in 0..MAX_SUM_ENTRIES {
            self.entries[i].next = NIL;
            self.entries[i].next_free = if i + 1 < MAX_SUM_ENTRIES { (i + 1) as u16 } else { NIL };
        }
        self.entry_free_head = 0;

        for i in 0..MAX_DEPOSITORS {
            self.depositors[i].entry = NIL;
            self.depositors[i].next_free = if i + 1 < MAX_DEPOSITORS { (i + 1) as u16 } else { NIL };
        }
        self.depositor_free_head = 0;
        self.num_depositors = 0;

        // Entry 0 is (0, 0) and starts out current.
        self.entry_free_head = self.entries[0].next_free;
        let e = &mut self.entries[0];
        e.live = 1;
        e.total_refs = 1;
        e.next_free = NIL;
        self.current_entry = 0;
    }

    #[inline]
    pub fn total_deposits(&self) -> u128 {
        self.total_deposits.get()
    }

    #[inline]
    pub fn is_depositor(&self, idx: u16) -> bool {
        (idx as usize) < MAX_DEPOSITORS && self.depositors[idx as usize].in_use != 0
    }

    pub fn depositor_owner(&self, idx: u16) -> Option<[u8; 32]> {
        if !self.is_depositor(idx) {
            return None;
        }
        Some(self.depositors[idx as usize].owner)
    }

    // ========================================
    // History table
    // ========================================

    fn alloc_entry(&mut self, epoch: u64, scale: u64) -> Result<u16> {
        let idx = self.entry_free_head;
        if idx == NIL {
            return Err(EngineError::BufferInvariant);
        }
        self.entry_free_head = self.entries[idx as usize].next_free;
        self.entries[idx as usize] = SumEntry {
            epoch,
            scale,
            sum_s: W256::ZERO,
            sum_b: W256::ZERO,
            direct_refs: 0,
            total_refs: 0,
            next: NIL,
            next_free: NIL,
            live: 1,
            _padding: [0; 3],
        };
        Ok(idx)
    }

    fn release_entry(&mut self, idx: u16) {
        let e = &mut self.entries[idx as usize];
        e.total_refs = e.total_refs.saturating_sub(1);
        if e.total_refs == 0 {
            e.live = 0;
            e.next_free = self.entry_free_head;
            self.entry_free_head = idx;
        }
    }

    fn add_snapshot_ref(&mut self, idx: u16) {
        let e = &mut self.entries[idx as usize];
        e.direct_refs += 1;
        e.total_refs += 1;
        let next = e.next;
        if next != NIL {
            self.entries[next as usize].total_refs += 1;
        }
    }

    fn drop_snapshot_ref(&mut self, idx: u16) {
        let next = self.entries[idx as usize].next;
        if next != NIL {
            self.release_entry(next);
        }
        let e = &mut self.entries[idx as usize];
        e.direct_refs = e.direct_refs.saturating_sub(1);
        self.release_entry(idx);
    }

    /// Make a fresh entry current. `linked` records it as S[scale + 1] of the
    /// outgoing entry.
    fn advance_entry(&mut self, epoch: u64, scale: u64, linked: bool) -> Result<()> {
        let old = self.current_entry;
        let new = self.alloc_entry(epoch, scale)?;
        let inherited = if linked { self.entries[old as usize].direct_refs } else { 0 };
        self.entries[new as usize].total_refs = 1 + inherited;
        if linked {
            self.entries[old as usize].next = new;
        }
        self.current_entry = new;
        self.release_entry(old);
        Ok(())
    }

    /// Number of live history entries.
    pub fn live_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.live != 0).count()
    }

    // ========================================
    // Offset
    // ========================================

    /// Burn up to `debt` of pooled deposits against `coll` of seized collateral.
    ///
    /// Returns the debt actually absorbed; the remainder is the caller's to
    /// redistribute.
    pub fn offset(&mut self, _role: &ManagerRole, debt: u128, coll: u128) -> Result<u128> {
        let total = self.total_deposits.get();
        if total == 0 || debt == 0 {
            return Ok(0);
        }
        let debt = debt.min(total);

        let (coll_gain_per_unit, loss_per_unit) = self.compute_rewards_per_unit_staked(coll, debt, total)?;
        self.update_reward_sum_and_product(coll_gain_per_unit, loss_per_unit)?;

        self.total_deposits.set(total - debt);
        self.coll_balance.try_add(coll)?;
        Ok(debt)
    }

    fn compute_rewards_per_unit_staked(&mut self, coll: u128, debt: u128, total: u128) -> Result<(U256, u128)> {
        let total_w = U256::from(total);
        let precision = U256::from(DECIMAL_PRECISION);

        let coll_numerator = U256::from(coll) * precision + U256::from(self.last_coll_error.get());
        let coll_gain_per_unit = coll_numerator / total_w;
        self.last_coll_error.set(narrow(coll_numerator - coll_gain_per_unit * total_w)?);

        let loss_per_unit = if debt == total {
            self.last_loss_error = U128::ZERO;
            DECIMAL_PRECISION
        } else {
            // Round the loss up so compounded deposits never overstate the pool.
            let debt_w = U256::from(debt) * precision;
            let err = U256::from(self.last_loss_error.get());
            let loss_numerator = if debt_w > err { debt_w - err } else { U256::zero() };
            let mut loss = narrow(loss_numerator / total_w)? + 1;
            if loss >= DECIMAL_PRECISION {
                // Deposits remain, so the product must not hit zero.
                loss = DECIMAL_PRECISION - 1;
            }
            let charged = U256::from(loss) * total_w;
            let new_err = if charged > loss_numerator { narrow(charged - loss_numerator)? } else { 0 };
            self.last_loss_error.set(new_err);
            loss
        };

        Ok((coll_gain_per_unit, loss_per_unit))
    }

    fn update_reward_sum_and_product(&mut self, coll_gain_per_unit: U256, loss_per_unit: u128) -> Result<()> {
        let current_p = self.p.get();
        let factor = DECIMAL_PRECISION - loss_per_unit;

        let cur = self.current_entry as usize;
        let marginal = coll_gain_per_unit
            .checked_mul(U256::from(current_p))
            .ok_or(EngineError::Overflow)?;
        let new_s = self.entries[cur].sum_s.get().checked_add(marginal).ok_or(EngineError::Overflow)?;
        self.entries[cur].sum_s.set(new_s);

        if factor == 0 {
            let epoch = self.current_epoch.checked_add(1).ok_or(EngineError::Overflow)?;
            self.advance_entry(epoch, 0, false)?;
            self.current_epoch = epoch;
            self.current_scale = 0;
            self.p.set(DECIMAL_PRECISION);
            return Ok(());
        }

        // p and factor are both <= 1e18, so the product fits in u128.
        let product = current_p.checked_mul(factor).ok_or(EngineError::Overflow)?;
        let (new_p, scale_step) = if product / DECIMAL_PRECISION >= SCALE_FACTOR {
            (product / DECIMAL_PRECISION, 0)
        } else if product / SCALE_FACTOR >= SCALE_FACTOR {
            (product / SCALE_FACTOR, 1)
        } else {
            (product, 2)
        };
        if new_p == 0 {
            return Err(EngineError::BufferInvariant);
        }

        if scale_step > 0 {
            let scale = self.current_scale.checked_add(scale_step).ok_or(EngineError::Overflow)?;
            self.advance_entry(self.current_epoch, scale, scale_step == 1)?;
            self.current_scale = scale;
        }
        self.p.set(new_p);
        Ok(())
    }

    // ========================================
    // Yield
    // ========================================

    /// Credit interest yield to current depositors pro rata.
    pub fn credit_yield(&mut self, _role: &ManagerRole, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.yield_balance.try_add(amount)?;
        let accumulated = self.yield_pending.get().checked_add(amount).ok_or(EngineError::Overflow)?;

        let total = self.total_deposits.get();
        if total < MIN_DEPOSITS_FOR_YIELD {
            self.yield_pending.set(accumulated);
            return Ok(());
        }
        self.yield_pending = U128::ZERO;

        let total_w = U256::from(total);
        let numerator = U256::from(accumulated) * U256::from(DECIMAL_PRECISION) + U256::from(self.last_yield_error.get());
        let per_unit = numerator / total_w;
        self.last_yield_error.set(narrow(numerator - per_unit * total_w)?);

        let cur = self.current_entry as usize;
        let marginal = per_unit.checked_mul(U256::from(self.p.get())).ok_or(EngineError::Overflow)?;
        let new_b = self.entries[cur].sum_b.get().checked_add(marginal).ok_or(EngineError::Overflow)?;
        self.entries[cur].sum_b.set(new_b);
        Ok(())
    }

    // ========================================
    // Depositor reads
    // ========================================

    fn compounded_from(&self, d: &Depositor) -> Result<u128> {
        let initial = d.initial_value.get();
        if initial == 0 || d.snapshot_epoch < self.current_epoch {
            return Ok(0);
        }
        let snap_p = d.snapshot_p.get();
        let compounded = match self.current_scale.saturating_sub(d.snapshot_scale) {
            0 => mul_div(initial, self.p.get(), snap_p)?,
            1 => mul_div(initial, self.p.get(), snap_p)? / SCALE_FACTOR,
            _ => 0,
        };
        // Below one billionth of the basis the value is rounding noise.
        if compounded < initial / SCALE_FACTOR {
            return Ok(0);
        }
        Ok(compounded)
    }

    fn gain_from(&self, d: &Depositor, yield_sum: bool) -> Result<u128> {
        let initial = d.initial_value.get();
        if initial == 0 || d.entry == NIL {
            return Ok(0);
        }
        let entry = &self.entries[d.entry as usize];
        let (sum, snap) = if yield_sum {
            (entry.sum_b.get(), d.snapshot_b.get())
        } else {
            (entry.sum_s.get(), d.snapshot_s.get())
        };
        let first = sum.checked_sub(snap).ok_or(EngineError::BufferInvariant)?;
        let second = if entry.next != NIL {
            let next = &self.entries[entry.next as usize];
            let s = if yield_sum { next.sum_b.get() } else { next.sum_s.get() };
            s / U256::from(SCALE_FACTOR)
        } else {
            U256::zero()
        };
        let gain = U256::from(initial)
            .checked_mul(first + second)
            .ok_or(EngineError::Overflow)?
            / U256::from(d.snapshot_p.get())
            / U256::from(DECIMAL_PRECISION);
        narrow(gain)
    }

    fn depositor(&self, idx: u16) -> Result<&Depositor> {
        if !self.is_depositor(idx) {
            return Err(EngineError::DepositorNotFound);
        }
        Ok(&self.depositors[idx as usize])
    }

    /// Current compounded stablecoin balance of a depositor.
    pub fn compounded_deposit(&self, idx: u16) -> Result<u128> {
        self.compounded_from(self.depositor(idx)?)
    }

    /// Collateral gain owed to a depositor (stashed + pending).
    pub fn depositor_coll_gain(&self, idx: u16) -> Result<u128> {
        let d = self.depositor(idx)?;
        d.coll_claimable.get().checked_add(self.gain_from(d, false)?).ok_or(EngineError::Overflow)
    }

    /// Yield owed to a depositor (stashed + pending).
    pub fn depositor_yield_gain(&self, idx: u16) -> Result<u128> {
        let d = self.depositor(idx)?;
        d.yield_claimable.get().checked_add(self.gain_from(d, true)?).ok_or(EngineError::Overflow)
    }

    // ========================================
    // Depositor mutations
    // ========================================

    pub fn add_depositor(&mut self, owner: [u8; 32]) -> Result<u16> {
        let idx = self.depositor_free_head;
        if idx == NIL {
            return Err(EngineError::SlabFull);
        }
        self.depositor_free_head = self.depositors[idx as usize].next_free;
        let d = &mut self.depositors[idx as usize];
        *d = Depositor::zeroed();
        d.owner = owner;
        d.entry = NIL;
        d.next_free = NIL;
        d.in_use = 1;
        self.num_depositors += 1;
        Ok(idx)
    }

    fn release_depositor(&mut self, idx: u16) {
        let d = &mut self.depositors[idx as usize];
        *d = Depositor::zeroed();
        d.entry = NIL;
        d.next_free = self.depositor_free_head;
        self.depositor_free_head = idx;
        self.num_depositors = self.num_depositors.saturating_sub(1);
    }

    fn update_snapshots(&mut self, idx: u16, new_value: u128) {
        let old_entry = self.depositors[idx as usize].entry;
        if old_entry != NIL {
            self.drop_snapshot_ref(old_entry);
        }

        if new_value == 0 {
            let d = &mut self.depositors[idx as usize];
            d.initial_value = U128::ZERO;
            d.snapshot_p = U128::ZERO;
            d.snapshot_s = W256::ZERO;
            d.snapshot_b = W256::ZERO;
            d.snapshot_epoch = 0;
            d.snapshot_scale = 0;
            d.entry = NIL;
            return;
        }

        let cur = self.current_entry;
        let (sum_s, sum_b) = (self.entries[cur as usize].sum_s, self.entries[cur as usize].sum_b);
        let (p, epoch, scale) = (self.p, self.current_epoch, self.current_scale);
        let d = &mut self.depositors[idx as usize];
        d.initial_value = U128::new(new_value);
        d.snapshot_p = p;
        d.snapshot_s = sum_s;
        d.snapshot_b = sum_b;
        d.snapshot_epoch = epoch;
        d.snapshot_scale = scale;
        d.entry = cur;
        self.add_snapshot_ref(cur);
    }

    /// Add `amount` to a depositor's balance, realizing pending gains first.
    pub fn provide(&mut self, idx: u16, amount: u128) -> Result<DepositOutcome> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let d = *self.depositor(idx)?;
        let coll_gain = self.gain_from(&d, false)?;
        let yield_gain = self.gain_from(&d, true)?;
        let compounded = self.compounded_from(&d)?;
        let new_value = compounded.checked_add(amount).ok_or(EngineError::Overflow)?;
        let new_total = self.total_deposits.get().checked_add(amount).ok_or(EngineError::Overflow)?;
        let coll_stash = d.coll_claimable.get().checked_add(coll_gain).ok_or(EngineError::Overflow)?;
        let yield_stash = d.yield_claimable.get().checked_add(yield_gain).ok_or(EngineError::Overflow)?;

        self.total_deposits.set(new_total);
        {
            let d = &mut self.depositors[idx as usize];
            d.coll_claimable.set(coll_stash);
            d.yield_claimable.set(yield_stash);
        }
        self.update_snapshots(idx, new_value);

        Ok(DepositOutcome { new_balance: new_value, coll_realized: coll_gain, yield_realized: yield_gain })
    }

    /// Withdraw up to `amount` and pay out every realized gain.
    ///
    /// `amount` is capped at the compounded balance; zero is a pure claim.
    /// The slot is released once nothing is left in it.
    pub fn withdraw(&mut self, idx: u16, amount: u128) -> Result<WithdrawOutcome> {
        let d = *self.depositor(idx)?;
        let coll_gain = self.gain_from(&d, false)?;
        let yield_gain = self.gain_from(&d, true)?;
        let compounded = self.compounded_from(&d)?;
        let withdrawn = amount.min(compounded);
        let remaining = compounded - withdrawn;

        let coll_paid = d.coll_claimable.get().checked_add(coll_gain).ok_or(EngineError::Overflow)?;
        let yield_paid = d.yield_claimable.get().checked_add(yield_gain).ok_or(EngineError::Overflow)?;
        let new_total = self.total_deposits.get().checked_sub(withdrawn).ok_or(EngineError::BufferInvariant)?;
        let new_coll_balance = self.coll_balance.get().checked_sub(coll_paid).ok_or(EngineError::BufferInvariant)?;
        let new_yield_balance = self.yield_balance.get().checked_sub(yield_paid).ok_or(EngineError::BufferInvariant)?;

        self.total_deposits.set(new_total);
        self.coll_balance.set(new_coll_balance);
        self.yield_balance.set(new_yield_balance);
        {
            let d = &mut self.depositors[idx as usize];
            d.coll_claimable = U128::ZERO;
            d.yield_claimable = U128::ZERO;
        }
        self.update_snapshots(idx, remaining);

        let released = remaining == 0;
        if released {
            self.release_depositor(idx);
        }

        Ok(WithdrawOutcome { withdrawn, coll_paid, yield_paid, remaining, released })
    }
}
