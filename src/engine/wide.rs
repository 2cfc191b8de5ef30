//! Slab-safe wide integers and the 18-decimal fixed-point helpers.
//!
//! u128 changed alignment from 8 to 16 bytes on x86_64 in Rust 1.77, while SBF
//! keeps 8. Every wide value stored in the slab goes through these wrappers so
//! the layout is identical on the host and on chain.

use bytemuck::{Pod, Zeroable};
use core::fmt;
use primitive_types::U256;

use super::{EngineError, Result};

/// 1.0 in 18-decimal fixed point.
pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Stored unsigned 128-bit integer. Layout: [lo, hi] little-endian.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct U128([u64; 2]);

impl U128 {
    pub const ZERO: Self = Self([0, 0]);
    pub const MAX: Self = Self([u64::MAX, u64::MAX]);

    #[inline]
    pub const fn new(val: u128) -> Self {
        Self([val as u64, (val >> 64) as u64])
    }

    #[inline]
    pub const fn get(self) -> u128 {
        ((self.0[1] as u128) << 64) | (self.0[0] as u128)
    }

    #[inline]
    pub fn set(&mut self, val: u128) {
        self.0[0] = val as u64;
        self.0[1] = (val >> 64) as u64;
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == [0, 0]
    }

    /// Checked in-place add, surfacing overflow as an invariant error.
    #[inline]
    pub fn try_add(&mut self, rhs: u128) -> Result<()> {
        let v = self.get().checked_add(rhs).ok_or(EngineError::Overflow)?;
        self.set(v);
        Ok(())
    }

    /// Checked in-place subtract, surfacing underflow as an invariant error.
    #[inline]
    pub fn try_sub(&mut self, rhs: u128) -> Result<()> {
        let v = self.get().checked_sub(rhs).ok_or(EngineError::Overflow)?;
        self.set(v);
        Ok(())
    }

    #[inline]
    pub fn saturating_sub(self, rhs: u128) -> Self {
        Self::new(self.get().saturating_sub(rhs))
    }
}

impl fmt::Debug for U128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl From<u128> for U128 {
    fn from(v: u128) -> Self {
        Self::new(v)
    }
}

/// Stored unsigned 256-bit integer for the buffer's running sums.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct W256([u64; 4]);

impl W256 {
    pub const ZERO: Self = Self([0; 4]);

    #[inline]
    pub fn new(val: U256) -> Self {
        Self(val.0)
    }

    #[inline]
    pub fn get(self) -> U256 {
        U256(self.0)
    }

    #[inline]
    pub fn set(&mut self, val: U256) {
        self.0 = val.0;
    }
}

impl fmt::Debug for W256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

// ============================================================================
// Fixed-point helpers
// ============================================================================

/// Narrow a 256-bit intermediate back to u128.
#[inline]
pub fn narrow(v: U256) -> Result<u128> {
    if v > U256::from(u128::MAX) {
        return Err(EngineError::Overflow);
    }
    Ok(v.as_u128())
}

/// floor(a * b / d) with a 256-bit intermediate.
#[inline]
pub fn mul_div(a: u128, b: u128, d: u128) -> Result<u128> {
    if d == 0 {
        return Err(EngineError::Overflow);
    }
    narrow(U256::from(a) * U256::from(b) / U256::from(d))
}

/// ceil(a * b / d) with a 256-bit intermediate.
#[inline]
pub fn mul_div_up(a: u128, b: u128, d: u128) -> Result<u128> {
    if d == 0 {
        return Err(EngineError::Overflow);
    }
    let num = U256::from(a) * U256::from(b);
    let d = U256::from(d);
    let q = num / d;
    let q = if q * d == num { q } else { q + U256::one() };
    narrow(q)
}

/// Collateralization ratio `coll * price / debt` in wad.
///
/// Zero collateral is never healthy, even at price zero. Zero debt with
/// collateral is the only case reported as `u128::MAX`; finite ratios that
/// exceed the range saturate one below it.
pub fn compute_cr(coll: u128, debt: u128, price: u128) -> u128 {
    if coll == 0 {
        return 0;
    }
    if debt == 0 {
        return u128::MAX;
    }
    let cr = U256::from(coll) * U256::from(price) / U256::from(debt);
    if cr >= U256::from(u128::MAX) {
        u128::MAX - 1
    } else {
        cr.as_u128()
    }
}
