//! Collateralized-debt engine.
//!
//! Borrowers lock collateral in positions and draw stablecoin debt against
//! it. Unhealthy positions are liquidated against the stability buffer, and
//! whatever the buffer cannot absorb is redistributed to every other active
//! position through per-stake accumulators that each position pulls lazily
//! on its next touch. Anyone can redeem stablecoin for collateral at par,
//! walking positions from the lowest interest rate up.
//!
//! All state lives in one contiguous `Pod` struct so it can be mapped
//! zero-copy out of a single Solana account. Nothing here iterates over
//! every position or every depositor.
//!
//! Amounts are 18-decimal fixed point ("wad").

#![forbid(unsafe_code)]

pub mod buffer;
pub mod fees;
mod ledger;
mod liquidation;
mod redemption;
pub mod registry;
pub mod wide;

use alloc::boxed::Box;
use bytemuck::{Pod, Zeroable};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

pub use buffer::{DepositOutcome, StabilityBuffer, WithdrawOutcome};
pub use fees::{BaseRateFee, FlatRedemptionFee, InterestAccrual, NoAccrual, RedemptionFeeModel, SimpleInterest};
pub use ledger::{AdjustOutcome, ClaimOutcome, CloseOutcome, OpenOutcome, PositionAdjustment};
pub use liquidation::LiquidationOutcome;
pub use redemption::RedemptionOutcome;
pub use registry::OrderedRegistry;
pub use wide::{compute_cr, DECIMAL_PRECISION, U128, W256};

// ============================================================================
// Constants
// ============================================================================

// Capacities are feature-configured, not target-configured, so host and SBF
// builds agree on the slab layout for a given feature set.
#[cfg(feature = "test")]
pub const MAX_POSITIONS: usize = 64;
#[cfg(not(feature = "test"))]
pub const MAX_POSITIONS: usize = 1024;

#[cfg(feature = "test")]
pub const MAX_DEPOSITORS: usize = 32;
#[cfg(not(feature = "test"))]
pub const MAX_DEPOSITORS: usize = 512;

/// Null slot / link sentinel.
pub const NIL: u16 = u16::MAX;

pub const BITMAP_WORDS: usize = (MAX_POSITIONS + 63) / 64;

/// Two history entries per depositor plus the current one, plus one spare
/// for the allocation that precedes a release.
pub const MAX_SUM_ENTRIES: usize = 2 * MAX_DEPOSITORS + 2;

pub const BPS_DENOMINATOR: u128 = 10_000;

/// ~400ms slots.
pub const SLOTS_PER_YEAR: u64 = 78_840_000;

// ============================================================================
// Capabilities
// ============================================================================

/// Grants registry insert/reinsert. Only the engine can construct one.
pub struct BorrowerRole(());

/// Grants registry removal and buffer offset/yield credit. Only the engine
/// can construct one.
pub struct ManagerRole(());

const BORROWER: BorrowerRole = BorrowerRole(());
const MANAGER: ManagerRole = ManagerRole(());

// ============================================================================
// Core Data Structures
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum PositionStatus {
    Nonexistent = 0,
    Active = 1,
    ClosedByOwner = 2,
    ClosedByLiquidation = 3,
    /// Fully redeemed; only the reserve debt and a surplus claim remain.
    Unredeemable = 4,
}

/// One borrower position.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Position {
    /// Monotonic, never reused (slots are)
    pub position_id: u64,
    pub owner: [u8; 32],
    pub collateral: U128,
    /// Composite debt: drawn debt + liquidation reserve + accrued interest
    pub debt: U128,
    /// Redistribution share
    pub stake: U128,
    pub snapshot_l_coll: U128,
    pub snapshot_l_debt: U128,
    /// Collateral claimable by the owner after liquidation or full redemption
    pub surplus: U128,
    /// Annual interest rate in bps; also the registry ordering key
    pub rank_key: u64,
    pub last_touch_slot: u64,
    /// Index into `Engine::active_ids` while active
    pub array_index: u16,
    pub status: u8,
    pub _padding: [u8; 5],
}

impl Position {
    pub fn status(&self) -> PositionStatus {
        PositionStatus::from_u8(self.status).unwrap_or(PositionStatus::Nonexistent)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active as u8
    }
}

/// Protocol parameters, fixed at market init.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct EngineParams {
    /// Minimum collateral ratio
    pub mcr: U128,
    /// Critical system collateral ratio (recovery mode below it)
    pub ccr: U128,
    /// Minimum debt excluding the reserve
    pub min_net_debt: U128,
    /// Fixed stablecoin amount added to every position's debt and paid to
    /// its liquidator
    pub liquidation_reserve: U128,
    pub redemption_fee_floor: U128,
    /// Liquidator collateral compensation is `coll / divisor`
    pub coll_gas_comp_divisor: u64,
    /// Share of interest routed to buffer depositors
    pub yield_split_bps: u64,
    /// Annual management fee on debt, charged on top of interest
    pub management_fee_bps: u64,
    pub _reserved: u64,
}

impl EngineParams {
    /// MCR 110%, CCR 150%, 1800 min net debt, 200 reserve, 0.5% floor.
    pub const fn standard() -> Self {
        Self {
            mcr: U128::new(1_100_000_000_000_000_000),
            ccr: U128::new(1_500_000_000_000_000_000),
            min_net_debt: U128::new(1_800 * DECIMAL_PRECISION),
            liquidation_reserve: U128::new(200 * DECIMAL_PRECISION),
            redemption_fee_floor: U128::new(5_000_000_000_000_000),
            coll_gas_comp_divisor: 200,
            yield_split_bps: 7_500,
            management_fee_bps: 0,
            _reserved: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mcr = self.mcr.get();
        if mcr <= DECIMAL_PRECISION
            || self.ccr.get() < mcr
            || self.min_net_debt.is_zero()
            || self.coll_gas_comp_divisor == 0
            || self.redemption_fee_floor.get() > DECIMAL_PRECISION
            || self.yield_split_bps as u128 > BPS_DENOMINATOR
            || self.management_fee_bps as u128 > BPS_DENOMINATOR
        {
            return Err(EngineError::InvalidParams);
        }
        Ok(())
    }
}

/// System-wide accumulators and pool totals.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SystemTotals {
    /// Redistributed collateral per unit staked (1e18 scaled)
    pub l_coll: U128,
    /// Redistributed debt per unit staked (1e18 scaled)
    pub l_debt: U128,
    pub last_coll_error: U128,
    pub last_debt_error: U128,
    pub total_stakes: U128,
    pub total_stakes_snapshot: U128,
    pub total_collateral_snapshot: U128,
    /// Recorded collateral of active positions
    pub active_coll: U128,
    /// Recorded debt of active and unredeemable positions
    pub active_debt: U128,
    /// Redistributed collateral not yet pulled by positions
    pub default_coll: U128,
    /// Redistributed debt not yet pulled by positions
    pub default_debt: U128,
    /// Collateral owed to owners of liquidated/redeemed positions
    pub surplus_coll: U128,
    /// Stablecoin fees owed to the protocol
    pub protocol_fees: U128,
    /// Stablecoin to mint into the stable vault (interest)
    pub pending_mint: U128,
    /// Stablecoin to burn from the stable vault (buffer offsets)
    pub pending_burn: U128,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing changed
    Validation,
    /// Not allowed in the current state; nothing changed
    State,
    /// Broken internal invariant
    Invariant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineError {
    ZeroAmount,
    /// Slot or id out of range, or the null sentinel
    InvalidId,
    /// Max fee outside [fee floor, 100%]
    FeeOutOfBand,
    EmptyBatch,
    BelowMinimumDebt,
    InvalidAdjustment,
    InvalidParams,
    InvalidPrice,

    PositionNotActive,
    AlreadyPresent,
    NotPresent,
    NotOwner,
    InsufficientBalance,
    NothingToLiquidate,
    /// Liquidation would leave debt to redistribute with no stakes to take it
    NoRedistributionTarget,
    FeeExceedsMax,
    BelowMcr,
    BelowCcr,
    RecoveryModeRestricted,
    TcrBelowMcr,
    NothingToRedeem,
    NoSurplus,
    SlabFull,
    DepositorNotFound,

    Overflow,
    BufferInvariant,
}

impl EngineError {
    pub fn kind(self) -> ErrorKind {
        use EngineError::*;
        match self {
            ZeroAmount | InvalidId | FeeOutOfBand | EmptyBatch | BelowMinimumDebt | InvalidAdjustment
            | InvalidParams | InvalidPrice => ErrorKind::Validation,
            Overflow | BufferInvariant => ErrorKind::Invariant,
            _ => ErrorKind::State,
        }
    }
}

pub type Result<T> = core::result::Result<T, EngineError>;

// ============================================================================
// Engine
// ============================================================================

/// Main engine state - fixed slab with bitmap
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Engine {
    pub params: EngineParams,
    pub totals: SystemTotals,
    /// Stored state of the default redemption fee model
    pub redemption_fee: BaseRateFee,

    /// Latest slot seen by a mutating call
    pub current_slot: u64,
    /// Next position id to assign (never recycled)
    pub next_position_id: u64,
    pub lifetime_liquidations: u64,
    pub lifetime_redemptions: u64,

    // ========================================
    // Slab Management
    // ========================================
    pub num_used_positions: u16,
    /// Freelist head (NIL = none)
    pub free_head: u16,
    pub active_count: u16,
    pub _padding: u16,
    pub used: [u64; BITMAP_WORDS],
    pub next_free: [u16; MAX_POSITIONS],
    /// Dense list of active slots (swap-remove)
    pub active_ids: [u16; MAX_POSITIONS],

    pub registry: OrderedRegistry,
    pub buffer: StabilityBuffer,
    pub positions: [Position; MAX_POSITIONS],
}

impl Engine {
    /// Allocate and initialize on the heap.
    pub fn new_boxed(params: EngineParams) -> Result<Box<Self>> {
        let mut engine: Box<Self> = bytemuck::zeroed_box();
        engine.init_in_place(params)?;
        Ok(engine)
    }

    /// Initialize over zeroed memory (zero-copy friendly).
    ///
    /// Only non-zero fields are written; everything else is already correct
    /// as zero.
    pub fn init_in_place(&mut self, params: EngineParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        self.redemption_fee = BaseRateFee::new(params.redemption_fee_floor.get());
        self.next_position_id = 1;
        self.registry.init();
        self.buffer.init();

        for i in 0..MAX_POSITIONS - 1 {
            self.next_free[i] = (i + 1) as u16;
        }
        self.next_free[MAX_POSITIONS - 1] = NIL;
        self.free_head = 0;
        Ok(())
    }

    #[inline]
    fn observe_slot(&mut self, now_slot: u64) {
        if now_slot > self.current_slot {
            self.current_slot = now_slot;
        }
    }

    // ========================================
    // Bitmap Helpers
    // ========================================

    pub fn is_used(&self, idx: usize) -> bool {
        if idx >= MAX_POSITIONS {
            return false;
        }
        (self.used[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    fn set_used(&mut self, idx: usize) {
        self.used[idx >> 6] |= 1u64 << (idx & 63);
    }

    fn clear_used(&mut self, idx: usize) {
        self.used[idx >> 6] &= !(1u64 << (idx & 63));
    }

    // ========================================
    // Slot Allocation
    // ========================================

    fn alloc_slot(&mut self) -> Result<u16> {
        if self.free_head == NIL {
            return Err(EngineError::SlabFull);
        }
        let idx = self.free_head;
        self.free_head = self.next_free[idx as usize];
        self.set_used(idx as usize);
        self.num_used_positions = self.num_used_positions.saturating_add(1);
        Ok(idx)
    }

    /// Return a slot to the freelist. The record stays readable until the
    /// slot is reused.
    fn free_slot(&mut self, idx: u16) {
        self.clear_used(idx as usize);
        self.next_free[idx as usize] = self.free_head;
        self.free_head = idx;
        self.num_used_positions = self.num_used_positions.saturating_sub(1);
    }

    fn push_active(&mut self, idx: u16) {
        let at = self.active_count;
        self.active_ids[at as usize] = idx;
        self.positions[idx as usize].array_index = at;
        self.active_count += 1;
    }

    fn remove_active(&mut self, idx: u16) {
        let at = self.positions[idx as usize].array_index as usize;
        let last = self.active_count as usize - 1;
        let moved = self.active_ids[last];
        self.active_ids[at] = moved;
        self.positions[moved as usize].array_index = at as u16;
        self.active_ids[last] = 0;
        self.active_count -= 1;
    }

    /// Id-range and liveness check shared by every position entry point.
    fn require_active(&self, idx: u16) -> Result<()> {
        if idx as usize >= MAX_POSITIONS {
            return Err(EngineError::InvalidId);
        }
        if !self.is_used(idx as usize) || !self.positions[idx as usize].is_active() {
            return Err(EngineError::PositionNotActive);
        }
        Ok(())
    }

    fn require_owner(&self, idx: u16, owner: &[u8; 32]) -> Result<()> {
        if &self.positions[idx as usize].owner != owner {
            return Err(EngineError::NotOwner);
        }
        Ok(())
    }

    // ========================================
    // Getters
    // ========================================

    /// Position record in a live slot.
    pub fn position(&self, idx: u16) -> Option<&Position> {
        if !self.is_used(idx as usize) {
            return None;
        }
        Some(&self.positions[idx as usize])
    }

    pub fn status(&self, idx: u16) -> PositionStatus {
        self.position(idx).map(|p| p.status()).unwrap_or(PositionStatus::Nonexistent)
    }

    pub fn active_count(&self) -> usize {
        self.active_count as usize
    }

    /// Active slots in internal (unordered) order.
    pub fn active_ids(&self) -> &[u16] {
        &self.active_ids[..self.active_count as usize]
    }

    #[inline]
    pub fn total_stakes(&self) -> u128 {
        self.totals.total_stakes.get()
    }

    pub fn entire_system_coll(&self) -> u128 {
        self.totals.active_coll.get().saturating_add(self.totals.default_coll.get())
    }

    pub fn entire_system_debt(&self) -> u128 {
        self.totals.active_debt.get().saturating_add(self.totals.default_debt.get())
    }

    /// Total collateral ratio at `price`.
    pub fn tcr(&self, price: u128) -> u128 {
        compute_cr(self.entire_system_coll(), self.entire_system_debt(), price)
    }

    /// TCR below CCR. An empty system is not in recovery mode.
    pub fn is_recovery_mode(&self, price: u128) -> bool {
        if self.entire_system_debt() == 0 {
            return false;
        }
        self.tcr(price) < self.params.ccr.get()
    }

    /// Debt excluding the liquidation reserve.
    #[inline]
    fn net_debt(&self, debt: u128) -> u128 {
        debt.saturating_sub(self.params.liquidation_reserve.get())
    }

    // ========================================
    // Settlement counters
    // ========================================

    /// Take the whole-`unit` part of the pending mint.
    pub fn take_pending_mint(&mut self, unit: u128) -> u128 {
        take_whole_units(&mut self.totals.pending_mint, unit)
    }

    /// Take the whole-`unit` part of the pending burn.
    pub fn take_pending_burn(&mut self, unit: u128) -> u128 {
        take_whole_units(&mut self.totals.pending_burn, unit)
    }

    /// Take the whole-`unit` part of accumulated protocol fees.
    pub fn collect_protocol_fees(&mut self, unit: u128) -> u128 {
        take_whole_units(&mut self.totals.protocol_fees, unit)
    }
}

fn take_whole_units(counter: &mut U128, unit: u128) -> u128 {
    if unit == 0 {
        return 0;
    }
    let v = counter.get();
    let whole = v / unit * unit;
    counter.set(v - whole);
    whole
}
