//! Engine scenario tests for solvent-prog
//!
//! These drive `Engine` through its public API: buffer precision across
//! scale changes, redemption sweeps, redistribution exactness and the
//! system-ratio bounds. Wrapper-level tests live next to the processor.

use solvent_prog::engine::{
    buffer::SCALE_FACTOR, compute_cr, wide::mul_div, Engine, EngineError, EngineParams, FlatRedemptionFee,
    NoAccrual, PositionStatus, SimpleInterest, DECIMAL_PRECISION, NIL,
};

const ONE: u128 = DECIMAL_PRECISION;
const PRICE: u128 = 2_000 * ONE;
const FLOOR: u128 = 5 * ONE / 1_000;

// --- Helpers ---

fn engine_with(params: EngineParams) -> Box<Engine> {
    Engine::new_boxed(params).unwrap()
}

fn engine() -> Box<Engine> {
    engine_with(EngineParams::standard())
}

fn open(e: &mut Engine, tag: u8, coll: u128, debt: u128, rank: u64) -> u16 {
    e.open([tag; 32], coll, debt, rank, NIL, NIL, PRICE, 0).unwrap().slot
}

fn deposit(e: &mut Engine, tag: u8, amount: u128) -> u16 {
    let idx = e.buffer.add_depositor([tag; 32]).unwrap();
    e.buffer.provide(idx, amount).unwrap();
    idx
}

// --- Stability buffer ---

#[test]
fn test_buffer_precision_across_two_scale_changes() {
    let mut params = EngineParams::standard();
    params.min_net_debt.set(ONE);
    let mut e = engine_with(params);

    // Composite debts of exactly 2000 and the amount that drives the
    // product factor to 1e-9 on the second offset.
    let second_debt: u128 = 999_999_999_000_000_001_002;
    let a = open(&mut e, 1, 2 * ONE, 1_800 * ONE, 100);
    let c = open(&mut e, 3, ONE, second_debt - 200 * ONE, 100);
    open(&mut e, 2, 100 * ONE, 1_800 * ONE, 100);
    assert_eq!(e.position(a).unwrap().debt.get(), 2_000 * ONE);
    assert_eq!(e.position(c).unwrap().debt.get(), second_debt);

    let early = deposit(&mut e, 9, 2_000 * ONE + 2_001);

    let price = 1_000 * ONE;
    let out = e.liquidate(&NoAccrual, a, price, 1).unwrap();
    assert_eq!(out.debt_offset, 2_000 * ONE);
    assert_eq!(out.debt_redistributed, 0);
    assert_eq!(e.buffer.p.get(), SCALE_FACTOR);
    assert_eq!(e.buffer.current_scale, 1);

    let x = 1_000 * ONE;
    let late = deposit(&mut e, 10, x);

    let out = e.liquidate(&NoAccrual, c, price, 2).unwrap();
    assert_eq!(out.debt_offset, second_debt);
    assert_eq!(e.buffer.p.get(), SCALE_FACTOR);
    assert_eq!(e.buffer.current_scale, 2);
    assert_eq!(e.buffer.current_epoch, 0);

    assert_eq!(e.buffer.compounded_deposit(late).unwrap(), x / SCALE_FACTOR);
    assert_eq!(e.buffer.compounded_deposit(early).unwrap(), 0);
    assert_eq!(e.totals.pending_burn.get(), 2_000 * ONE + second_debt);
}

#[test]
fn test_matched_liquidation_drains_buffer_into_new_epoch() {
    let mut e = engine();
    let a = open(&mut e, 1, 2 * ONE, 1_800 * ONE, 100);
    let b = open(&mut e, 2, 2 * ONE, 1_800 * ONE, 100);
    let c = open(&mut e, 3, 100 * ONE, 1_800 * ONE, 100);
    let early = deposit(&mut e, 9, 2_000 * ONE);
    let price = 1_000 * ONE;
    let seized = 2 * ONE - 2 * ONE / 200;

    let out = e.liquidate(&NoAccrual, a, price, 1).unwrap();
    assert_eq!(out.debt_offset, 2_000 * ONE);
    assert_eq!(out.debt_redistributed, 0);
    assert_eq!(out.coll_to_buffer, seized);
    assert_eq!(e.buffer.total_deposits(), 0);
    assert_eq!(e.buffer.current_epoch, 1);
    assert_eq!(e.buffer.compounded_deposit(early).unwrap(), 0);
    assert_eq!(e.buffer.depositor_coll_gain(early).unwrap(), seized);

    let late = deposit(&mut e, 10, 4_000 * ONE);
    let out = e.liquidate(&NoAccrual, b, price, 2).unwrap();
    assert_eq!(out.debt_offset, 2_000 * ONE);
    assert_eq!(e.buffer.current_epoch, 1);
    assert_eq!(e.buffer.compounded_deposit(late).unwrap(), 2_000 * ONE - 4_000);
    assert_eq!(e.buffer.depositor_coll_gain(late).unwrap(), seized);
    assert_eq!(e.buffer.depositor_coll_gain(early).unwrap(), seized);
    assert_eq!(e.totals.pending_burn.get(), 4_000 * ONE);
    assert_eq!(e.totals.default_debt.get(), 0);
    assert_eq!(e.active_ids(), &[c]);

    let w = e.buffer.withdraw(early, u128::MAX).unwrap();
    assert_eq!((w.withdrawn, w.coll_paid), (0, seized));
    assert!(w.released);
}

#[test]
fn test_buffer_gains_follow_liquidation() {
    let mut e = engine();
    let a = open(&mut e, 1, 3 * ONE, 2_000 * ONE, 100);
    open(&mut e, 2, 20 * ONE, 2_000 * ONE, 100);
    let d1 = deposit(&mut e, 8, 3_000 * ONE);
    let d2 = deposit(&mut e, 9, 1_000 * ONE);

    let out = e.liquidate(&NoAccrual, a, 800 * ONE, 1).unwrap();
    assert_eq!(out.debt_offset, 2_200 * ONE);

    let g1 = e.buffer.depositor_coll_gain(d1).unwrap();
    let g2 = e.buffer.depositor_coll_gain(d2).unwrap();
    // 3:1 split of the collateral sent to the buffer.
    assert!(g1 + g2 <= out.coll_to_buffer);
    assert!(out.coll_to_buffer - (g1 + g2) < 10);
    assert!(g1.abs_diff(g2 * 3) < 10);

    let w = e.buffer.withdraw(d2, u128::MAX).unwrap();
    assert!(w.released);
    assert_eq!(w.coll_paid, g2);
    assert!(w.withdrawn <= 450 * ONE && 450 * ONE - w.withdrawn < 10);
    assert_eq!(e.buffer.withdraw(d2, ONE), Err(EngineError::DepositorNotFound));
}

// --- Redemption ---

#[test]
fn test_redemption_clears_lowest_ranks_first() {
    let mut e = engine();
    // Net debts D1 < D2 < D3 at ascending ranks.
    let (d1, d2, d3) = (2_000 * ONE, 3_000 * ONE, 4_000 * ONE);
    let p1 = open(&mut e, 1, 10 * ONE, d1, 100);
    let p2 = open(&mut e, 2, 10 * ONE, d2, 200);
    let p3 = open(&mut e, 3, 10 * ONE, d3, 300);

    let eps = 500 * ONE;
    let amount = d1 + d2 + eps;
    let debt_before = e.entire_system_debt();
    let p3_debt = e.position(p3).unwrap().debt.get();

    let mut fee = e.redemption_fee;
    let out = e.redeem(&mut fee, &NoAccrual, amount, amount, 0, ONE, PRICE, 1).unwrap();
    e.redemption_fee = fee;

    assert_eq!(out.redeemed, amount);
    assert_eq!(out.positions_cleared, 2);
    assert_eq!(out.positions_partial, 1);
    assert_eq!(e.entire_system_debt(), debt_before - amount);

    for id in [p1, p2] {
        assert_eq!(e.status(id), PositionStatus::Unredeemable);
        assert!(!e.registry.contains(id));
        // Only the reserve remains as debt.
        assert_eq!(e.position(id).unwrap().debt.get(), 200 * ONE);
    }
    assert_eq!(e.status(p3), PositionStatus::Active);
    assert!(e.registry.contains(p3));
    assert_eq!(e.position(p3).unwrap().debt.get(), p3_debt - eps);
    assert_eq!(e.registry.size(), 1);
    assert_eq!(e.active_count(), 1);
}

#[test]
fn test_redemption_leaves_unreached_positions_untouched() {
    let mut e = engine();
    let p1 = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
    let p2 = open(&mut e, 2, 10 * ONE, 2_000 * ONE, 200);
    let p3 = open(&mut e, 3, 10 * ONE, 2_000 * ONE, 300);
    let untouched = [*e.position(p2).unwrap(), *e.position(p3).unwrap()];

    let accrual = SimpleInterest { management_fee_bps: 0 };
    let now = 10_000;
    let mut fee = FlatRedemptionFee(FLOOR);
    let out = e
        .redeem(&mut fee, &accrual, 5_000 * ONE, 5_000 * ONE, 1, FLOOR, PRICE, now)
        .unwrap();

    assert_eq!(out.visited, 1);
    assert_eq!(out.positions_cleared, 1);
    assert_eq!(e.position(p1).unwrap().last_touch_slot, now);
    assert_eq!(*e.position(p2).unwrap(), untouched[0]);
    assert_eq!(*e.position(p3).unwrap(), untouched[1]);
}

#[test]
fn test_redeemed_position_claims_surplus_once() {
    let mut e = engine();
    let p1 = open(&mut e, 1, 10 * ONE, 2_000 * ONE, 100);
    open(&mut e, 2, 10 * ONE, 2_000 * ONE, 200);

    let mut fee = FlatRedemptionFee(FLOOR);
    let out = e.redeem(&mut fee, &NoAccrual, 2_000 * ONE, 2_000 * ONE, 0, FLOOR, PRICE, 1).unwrap();
    let surplus = 10 * ONE - out.coll_drawn;
    assert_eq!(e.totals.surplus_coll.get(), surplus);

    assert_eq!(e.claim_surplus(p1, &[2; 32]), Err(EngineError::NotOwner));
    let claim = e.claim_surplus(p1, &[1; 32]).unwrap();
    assert_eq!(claim.coll_paid, surplus);
    assert_eq!(claim.reserve_burned, 200 * ONE);
    assert_eq!(e.status(p1), PositionStatus::Nonexistent);
    assert_eq!(e.claim_surplus(p1, &[1; 32]), Err(EngineError::NoSurplus));
    assert_eq!(e.entire_system_debt(), 2_200 * ONE);
}

// --- Redistribution ---

#[test]
fn test_redistribution_gain_is_exact_across_interleaving() {
    let mut e = engine();
    let a = open(&mut e, 1, 3 * ONE, 2_000 * ONE, 100);
    let d = open(&mut e, 4, 3 * ONE, 2_000 * ONE, 100);
    let b = open(&mut e, 2, 20 * ONE, 2_000 * ONE, 100);
    let c = open(&mut e, 3, 30 * ONE, 2_000 * ONE, 100);

    let p = *e.position(b).unwrap();
    let stake = p.stake.get();
    let price = 800 * ONE;
    let debt_before = e.entire_system_debt();

    e.liquidate(&NoAccrual, a, price, 1).unwrap();
    assert_eq!(e.entire_system_debt(), debt_before);
    e.touch(&NoAccrual, c, 2).unwrap();
    // d's share of a's debt pushes it further under.
    assert!(e.get_current_icr(&NoAccrual, d, price, 3).unwrap() < e.params.mcr.get());
    e.liquidate(&NoAccrual, d, price, 3).unwrap();

    let (virtual_debt, virtual_coll) = e.get_entire_debt_and_coll(&NoAccrual, b, 4).unwrap();
    e.apply_pending_rewards(b).unwrap();
    let after = *e.position(b).unwrap();

    let l_debt = e.totals.l_debt.get() - p.snapshot_l_debt.get();
    let l_coll = e.totals.l_coll.get() - p.snapshot_l_coll.get();
    assert_eq!(after.debt.get() - p.debt.get(), mul_div(stake, l_debt, ONE).unwrap());
    assert_eq!(after.collateral.get() - p.collateral.get(), mul_div(stake, l_coll, ONE).unwrap());
    assert_eq!((after.debt.get(), after.collateral.get()), (virtual_debt, virtual_coll));
}

#[test]
fn test_pure_redistribution_bounds_tcr_drop() {
    let mut e = engine();
    let a = open(&mut e, 1, 3 * ONE, 2_000 * ONE, 100);
    open(&mut e, 2, 20 * ONE, 2_000 * ONE, 100);
    open(&mut e, 3, 20 * ONE, 2_000 * ONE, 100);
    let price = 800 * ONE;

    let coll = e.entire_system_coll();
    let debt = e.entire_system_debt();
    let tcr_before = e.tcr(price);

    let out = e.liquidate(&NoAccrual, a, price, 1).unwrap();
    assert_eq!(out.debt_offset, 0);
    let tcr_after = e.tcr(price);

    assert!(tcr_after <= tcr_before);
    assert!(tcr_after >= compute_cr(coll - out.coll_compensation, debt, price));
    assert_eq!(e.entire_system_debt(), debt);
}

// --- Ratios ---

#[test]
fn test_icr_monotonicity() {
    let coll = 10 * ONE;
    let debt = 2_000 * ONE;
    let mut last = u128::MAX;
    for step in 0..20u128 {
        let cr = compute_cr(coll, debt + step * 97 * ONE, PRICE);
        assert!(cr <= last);
        last = cr;
    }
    let mut last = 0;
    for step in 0..20u128 {
        let cr = compute_cr(coll + step * ONE / 3, debt, PRICE);
        assert!(cr >= last);
        let by_price = compute_cr(coll, debt, PRICE + step * ONE);
        assert!(by_price >= compute_cr(coll, debt, PRICE));
        last = cr;
    }
    assert_eq!(compute_cr(coll, 0, PRICE), u128::MAX);
    assert!(compute_cr(u128::MAX, 1, u128::MAX) < u128::MAX);
    assert_eq!(compute_cr(0, 0, PRICE), 0);
}

#[test]
fn test_current_icr_includes_pending_rewards() {
    let mut e = engine();
    let a = open(&mut e, 1, 3 * ONE, 2_000 * ONE, 100);
    let b = open(&mut e, 2, 20 * ONE, 2_000 * ONE, 100);
    let price = 800 * ONE;
    let before = e.get_current_icr(&NoAccrual, b, price, 1).unwrap();
    open(&mut e, 3, 20 * ONE, 2_000 * ONE, 100);

    e.liquidate(&NoAccrual, a, price, 1).unwrap();
    let pending = e.get_current_icr(&NoAccrual, b, price, 1).unwrap();
    e.apply_pending_rewards(b).unwrap();
    assert_eq!(e.get_current_icr(&NoAccrual, b, price, 1).unwrap(), pending);
    assert!(pending < before);
    assert_eq!(e.get_current_icr(&NoAccrual, a, price, 1), Err(EngineError::PositionNotActive));
    assert_eq!(e.get_current_icr(&NoAccrual, NIL, price, 1), Err(EngineError::InvalidId));
}

// --- Batch ---

#[test]
fn test_batch_liquidation_totals_match_reports() {
    let mut e = engine();
    let weak: Vec<u16> = (0..4).map(|i| open(&mut e, i, 3 * ONE, 2_000 * ONE, 100)).collect();
    open(&mut e, 10, 200 * ONE, 2_000 * ONE, 100);
    deposit(&mut e, 9, 5_000 * ONE);

    let debt_before = e.entire_system_debt();
    let out = e.batch_liquidate(&NoAccrual, &weak, 800 * ONE, 1).unwrap();
    assert_eq!(out.liquidated, 4);
    assert_eq!(out.debt_offset + out.debt_redistributed, 4 * 2_200 * ONE);
    assert_eq!(out.debt_offset, 5_000 * ONE);
    assert_eq!(out.reserve_compensation, 4 * 200 * ONE);
    assert_eq!(e.entire_system_debt(), debt_before - out.debt_offset);
    assert_eq!(e.buffer.total_deposits(), 0);
    assert_eq!(e.active_count(), 1);
    assert_eq!(e.registry.size(), 1);
}
