//! Solvent: Solana program wrapping the collateralized-debt engine.
//!
//! One slab account holds a header, the market config and the whole engine
//! state, mapped zero-copy. The program-derived vault authority owns both
//! token vaults and is the stablecoin mint authority.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

pub mod engine;

// 1. mod constants
pub mod constants {
    use crate::engine::Engine;
    use crate::state::MarketConfig;
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x534f4c56454e5431; // "SOLVENT1"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<MarketConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<Engine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<Engine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Both mints use 9 decimals; one base unit is 1e9 wad.
    pub const TOKEN_DECIMALS: u8 = 9;
    pub const UNIT_WAD: u128 = 1_000_000_000;

    pub const VAULT_SEED: &[u8] = b"vault";

    /// Largest id list accepted by BatchLiquidate.
    pub const MAX_BATCH: usize = 32;

    /// Accounts shared by every instruction after InitMarket, in order:
    /// user, slab, user collateral, collateral vault, user stable, stable
    /// mint, stable vault, vault authority, token program. Clock and oracle
    /// follow where needed.
    pub const MARKET_ACCOUNTS: usize = 9;
    pub const CLOCK_IDX: usize = 9;
    pub const ORACLE_IDX: usize = 10;
}

// 2. mod zc
pub mod zc {
    use crate::constants::{ENGINE_LEN, ENGINE_OFF};
    use crate::engine::Engine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref(data: &[u8]) -> Result<&Engine, ProgramError> {
        let bytes = data.get(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN).ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }

    #[inline]
    pub fn engine_mut(data: &mut [u8]) -> Result<&mut Engine, ProgramError> {
        let bytes = data
            .get_mut(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }
}

// 3. mod error
pub mod error {
    // thiserror 1.x and `PrintProgramError` both name `std::error::Error`.
    extern crate std;

    use crate::engine::EngineError;
    use alloc::format;
    use num_derive::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;

    #[derive(Error, Debug, Copy, Clone, FromPrimitive, PartialEq, Eq)]
    pub enum SolventError {
        #[error("Slab already initialized")]
        AlreadyInitialized = 0,
        #[error("Slab not initialized")]
        NotInitialized = 1,
        #[error("Unsupported slab version")]
        InvalidVersion = 2,
        #[error("Slab has the wrong length")]
        InvalidSlabLen = 3,
        #[error("Expected signer")]
        ExpectedSigner = 4,
        #[error("Expected writable account")]
        ExpectedWritable = 5,
        #[error("Vault does not match the market")]
        InvalidVault = 6,
        #[error("Mint does not match the market")]
        InvalidMint = 7,
        #[error("Token account has the wrong mint or owner")]
        InvalidTokenAccount = 8,
        #[error("Vault authority mismatch")]
        InvalidAuthority = 9,
        #[error("Invalid market parameters")]
        InvalidMarketParams = 10,
        #[error("Oracle price invalid")]
        OracleInvalid = 11,
        #[error("Oracle price stale")]
        OracleStale = 12,
        #[error("Oracle confidence too wide")]
        OracleConfTooWide = 13,
        #[error("Amount does not fit in a token amount")]
        AmountOverflow = 14,
        #[error("Too many ids in batch")]
        BatchTooLarge = 15,
        #[error("Unauthorized")]
        Unauthorized = 16,

        // Engine errors mapped:
        #[error("Zero amount")]
        EngineZeroAmount = 32,
        #[error("Invalid position or depositor id")]
        EngineInvalidId = 33,
        #[error("Max fee outside the allowed band")]
        EngineFeeOutOfBand = 34,
        #[error("Empty batch")]
        EngineEmptyBatch = 35,
        #[error("Debt below minimum")]
        EngineBelowMinimumDebt = 36,
        #[error("Invalid adjustment")]
        EngineInvalidAdjustment = 37,
        #[error("Invalid engine parameters")]
        EngineInvalidParams = 38,
        #[error("Invalid price")]
        EngineInvalidPrice = 39,
        #[error("Position not active")]
        EnginePositionNotActive = 40,
        #[error("Id already in registry")]
        EngineAlreadyPresent = 41,
        #[error("Id not in registry")]
        EngineNotPresent = 42,
        #[error("Caller does not own the position")]
        EngineNotOwner = 43,
        #[error("Insufficient balance")]
        EngineInsufficientBalance = 44,
        #[error("Nothing to liquidate")]
        EngineNothingToLiquidate = 45,
        #[error("No stakes left to take redistributed debt")]
        EngineNoRedistributionTarget = 46,
        #[error("Fee exceeds max")]
        EngineFeeExceedsMax = 47,
        #[error("Collateral ratio below MCR")]
        EngineBelowMcr = 48,
        #[error("Collateral ratio below CCR")]
        EngineBelowCcr = 49,
        #[error("Not allowed in recovery mode")]
        EngineRecoveryModeRestricted = 50,
        #[error("System ratio below MCR")]
        EngineTcrBelowMcr = 51,
        #[error("Nothing to redeem")]
        EngineNothingToRedeem = 52,
        #[error("No surplus to claim")]
        EngineNoSurplus = 53,
        #[error("Slab full")]
        EngineSlabFull = 54,
        #[error("Depositor not found")]
        EngineDepositorNotFound = 55,
        #[error("Arithmetic overflow")]
        EngineOverflow = 56,
        #[error("Stability buffer invariant broken")]
        EngineBufferInvariant = 57,
    }

    impl From<SolventError> for ProgramError {
        fn from(e: SolventError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for SolventError {
        fn type_of() -> &'static str {
            "SolventError"
        }
    }

    impl PrintProgramError for SolventError {
        fn print<E>(&self) {
            msg!("SolventError: {}", self);
        }
    }

    pub fn map_engine_error(e: EngineError) -> ProgramError {
        let err = match e {
            EngineError::ZeroAmount => SolventError::EngineZeroAmount,
            EngineError::InvalidId => SolventError::EngineInvalidId,
            EngineError::FeeOutOfBand => SolventError::EngineFeeOutOfBand,
            EngineError::EmptyBatch => SolventError::EngineEmptyBatch,
            EngineError::BelowMinimumDebt => SolventError::EngineBelowMinimumDebt,
            EngineError::InvalidAdjustment => SolventError::EngineInvalidAdjustment,
            EngineError::InvalidParams => SolventError::EngineInvalidParams,
            EngineError::InvalidPrice => SolventError::EngineInvalidPrice,
            EngineError::PositionNotActive => SolventError::EnginePositionNotActive,
            EngineError::AlreadyPresent => SolventError::EngineAlreadyPresent,
            EngineError::NotPresent => SolventError::EngineNotPresent,
            EngineError::NotOwner => SolventError::EngineNotOwner,
            EngineError::InsufficientBalance => SolventError::EngineInsufficientBalance,
            EngineError::NothingToLiquidate => SolventError::EngineNothingToLiquidate,
            EngineError::NoRedistributionTarget => SolventError::EngineNoRedistributionTarget,
            EngineError::FeeExceedsMax => SolventError::EngineFeeExceedsMax,
            EngineError::BelowMcr => SolventError::EngineBelowMcr,
            EngineError::BelowCcr => SolventError::EngineBelowCcr,
            EngineError::RecoveryModeRestricted => SolventError::EngineRecoveryModeRestricted,
            EngineError::TcrBelowMcr => SolventError::EngineTcrBelowMcr,
            EngineError::NothingToRedeem => SolventError::EngineNothingToRedeem,
            EngineError::NoSurplus => SolventError::EngineNoSurplus,
            EngineError::SlabFull => SolventError::EngineSlabFull,
            EngineError::DepositorNotFound => SolventError::EngineDepositorNotFound,
            EngineError::Overflow => SolventError::EngineOverflow,
            EngineError::BufferInvariant => SolventError::EngineBufferInvariant,
        };
        err.into()
    }
}

// 4. mod ix
pub mod ix {
    use crate::constants::MAX_BATCH;
    use crate::engine::{EngineParams, U128};
    use crate::error::SolventError;
    use arrayref::array_ref;
    use solana_program::program_error::ProgramError;

    /// Token amounts are in base units of the 9-decimal mints. `max_fee` and
    /// the params are wad.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Instruction {
        InitMarket { params: EngineParams, max_staleness_slots: u64, conf_filter_bps: u16 },
        OpenPosition { collateral: u64, debt: u64, rank_key: u64, hint_prev: u16, hint_next: u16 },
        AdjustPosition { position: u16, coll_in: u64, coll_out: u64, debt_in: u64, debt_out: u64 },
        AdjustRank { position: u16, rank_key: u64, hint_prev: u16, hint_next: u16 },
        ClosePosition { position: u16 },
        ClaimSurplus { position: u16 },
        Liquidate { position: u16 },
        BatchLiquidate { ids: [u16; MAX_BATCH], count: u8 },
        Redeem { amount: u64, max_iterations: u16, max_fee: u128 },
        /// `depositor` is `NIL` to open a new deposit.
        ProvideToBuffer { depositor: u16, amount: u64 },
        WithdrawFromBuffer { depositor: u16, amount: u64 },
        CollectFees,
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let params = read_params(&mut rest)?;
                    let max_staleness_slots = read_u64(&mut rest)?;
                    let conf_filter_bps = read_u16(&mut rest)?;
                    Ok(Instruction::InitMarket { params, max_staleness_slots, conf_filter_bps })
                }
                1 => {
                    let collateral = read_u64(&mut rest)?;
                    let debt = read_u64(&mut rest)?;
                    let rank_key = read_u64(&mut rest)?;
                    let hint_prev = read_u16(&mut rest)?;
                    let hint_next = read_u16(&mut rest)?;
                    Ok(Instruction::OpenPosition { collateral, debt, rank_key, hint_prev, hint_next })
                }
                2 => {
                    let position = read_u16(&mut rest)?;
                    let coll_in = read_u64(&mut rest)?;
                    let coll_out = read_u64(&mut rest)?;
                    let debt_in = read_u64(&mut rest)?;
                    let debt_out = read_u64(&mut rest)?;
                    Ok(Instruction::AdjustPosition { position, coll_in, coll_out, debt_in, debt_out })
                }
                3 => {
                    let position = read_u16(&mut rest)?;
                    let rank_key = read_u64(&mut rest)?;
                    let hint_prev = read_u16(&mut rest)?;
                    let hint_next = read_u16(&mut rest)?;
                    Ok(Instruction::AdjustRank { position, rank_key, hint_prev, hint_next })
                }
                4 => Ok(Instruction::ClosePosition { position: read_u16(&mut rest)? }),
                5 => Ok(Instruction::ClaimSurplus { position: read_u16(&mut rest)? }),
                6 => Ok(Instruction::Liquidate { position: read_u16(&mut rest)? }),
                7 => {
                    let count = read_u8(&mut rest)?;
                    if count as usize > MAX_BATCH {
                        return Err(SolventError::BatchTooLarge.into());
                    }
                    let mut ids = [0u16; MAX_BATCH];
                    for id in ids.iter_mut().take(count as usize) {
                        *id = read_u16(&mut rest)?;
                    }
                    Ok(Instruction::BatchLiquidate { ids, count })
                }
                8 => {
                    let amount = read_u64(&mut rest)?;
                    let max_iterations = read_u16(&mut rest)?;
                    let max_fee = read_u128(&mut rest)?;
                    Ok(Instruction::Redeem { amount, max_iterations, max_fee })
                }
                9 => {
                    let depositor = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::ProvideToBuffer { depositor, amount })
                }
                10 => {
                    let depositor = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::WithdrawFromBuffer { depositor, amount })
                }
                11 => Ok(Instruction::CollectFees),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        Ok(take(input, 1)?[0])
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        let bytes = take(input, 2)?;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        let bytes = take(input, 16)?;
        Ok(u128::from_le_bytes(*array_ref![bytes, 0, 16]))
    }

    fn read_params(input: &mut &[u8]) -> Result<EngineParams, ProgramError> {
        Ok(EngineParams {
            mcr: U128::new(read_u128(input)?),
            ccr: U128::new(read_u128(input)?),
            min_net_debt: U128::new(read_u128(input)?),
            liquidation_reserve: U128::new(read_u128(input)?),
            redemption_fee_floor: U128::new(read_u128(input)?),
            coll_gas_comp_divisor: read_u64(input)?,
            yield_split_bps: read_u64(input)?,
            management_fee_bps: read_u64(input)?,
            _reserved: 0,
        })
    }
}

// 5. mod accounts
pub mod accounts {
    use crate::constants::VAULT_SEED;
    use crate::error::SolventError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(SolventError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(SolventError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, slab_key.as_ref()], program_id)
    }

    /// Vault authority from the bump stored at init.
    pub fn vault_authority(program_id: &Pubkey, slab_key: &Pubkey, bump: u8) -> Result<Pubkey, ProgramError> {
        Pubkey::create_program_address(&[VAULT_SEED, slab_key.as_ref(), &[bump]], program_id)
            .map_err(|_| SolventError::InvalidAuthority.into())
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct MarketConfig {
        pub collateral_mint: [u8; 32],
        pub collateral_vault: [u8; 32],
        pub stable_mint: [u8; 32],
        pub stable_vault: [u8; 32],
        pub oracle: [u8; 32],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub authority_bump: u8,
        pub _padding: [u8; 5],
    }

    pub fn slab_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> MarketConfig {
        let mut c = MarketConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &MarketConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod oracle
pub mod oracle {
    use crate::error::SolventError;
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    /// Bytes read from a legacy Pyth price account.
    pub const PYTH_PRICE_LEN: usize = 208;

    /// Aggregate price as wad (collateral priced in stablecoin).
    pub fn read_pyth_price_wad(
        price_ai: &AccountInfo,
        now_slot: u64,
        max_staleness: u64,
        conf_bps: u16,
    ) -> Result<u128, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < PYTH_PRICE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }

        let expo = i32::from_le_bytes(*array_ref![data, 20, 4]);
        let price = i64::from_le_bytes(*array_ref![data, 176, 8]);
        let conf = u64::from_le_bytes(*array_ref![data, 184, 8]);
        let pub_slot = u64::from_le_bytes(*array_ref![data, 200, 8]);

        if price <= 0 {
            return Err(SolventError::OracleInvalid.into());
        }

        let age = now_slot.saturating_sub(pub_slot);
        if age > max_staleness {
            return Err(SolventError::OracleStale.into());
        }

        let price_u = price as u128;
        let lhs = (conf as u128) * 10_000;
        let rhs = price_u * (conf_bps as u128);
        if lhs > rhs {
            return Err(SolventError::OracleConfTooWide.into());
        }

        let scale = expo + 18;
        let wad = if scale >= 0 {
            10u128
                .checked_pow(scale as u32)
                .and_then(|mul| price_u.checked_mul(mul))
                .ok_or(SolventError::OracleInvalid)?
        } else {
            match 10u128.checked_pow(scale.unsigned_abs()) {
                Some(div) => price_u / div,
                None => 0,
            }
        };

        if wad == 0 {
            return Err(SolventError::OracleInvalid.into());
        }
        Ok(wad)
    }
}

// 8. mod units
pub mod units {
    use crate::constants::UNIT_WAD;
    use crate::error::SolventError;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn to_wad(amount: u64) -> u128 {
        amount as u128 * UNIT_WAD
    }

    /// For amounts leaving a vault.
    pub fn to_units_floor(wad: u128) -> Result<u64, ProgramError> {
        u64::try_from(wad / UNIT_WAD).map_err(|_| SolventError::AmountOverflow.into())
    }

    /// For amounts owed by a user.
    pub fn to_units_ceil(wad: u128) -> Result<u64, ProgramError> {
        let units = wad / UNIT_WAD + (wad % UNIT_WAD != 0) as u128;
        u64::try_from(units).map_err(|_| SolventError::AmountOverflow.into())
    }
}

// 9. mod token
pub mod token {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, program_pack::Pack};
    use spl_token::state::Account as TokenAccount;

    use crate::error::SolventError;

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use spl_token::state::Mint;

    pub fn read_account(ai: &AccountInfo) -> Result<TokenAccount, ProgramError> {
        if ai.owner != &spl_token::ID {
            return Err(SolventError::InvalidTokenAccount.into());
        }
        let data = ai.try_borrow_data()?;
        TokenAccount::unpack(&data)
    }

    /// Move tokens out of an account the signer owns.
    pub fn transfer<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()])
        }
        #[cfg(test)]
        {
            mock::debit(source, amount)?;
            mock::credit(dest, amount)
        }
    }

    /// Move tokens out of a vault owned by the program authority.
    pub fn transfer_signed<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            mock::debit(source, amount)?;
            mock::credit(dest, amount)
        }
    }

    pub fn mint_to_signed<'a>(
        _token_program: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::mint_to(_token_program.key, mint.key, dest.key, _authority.key, &[], amount)?;
            invoke_signed(&ix, &[mint.clone(), dest.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            mock::supply(mint, amount, true)?;
            mock::credit(dest, amount)
        }
    }

    /// Burn from an account the signer owns.
    pub fn burn<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::burn(_token_program.key, source.key, mint.key, _authority.key, &[], amount)?;
            invoke(&ix, &[source.clone(), mint.clone(), _authority.clone(), _token_program.clone()])
        }
        #[cfg(test)]
        {
            mock::debit(source, amount)?;
            mock::supply(mint, amount, false)
        }
    }

    pub fn burn_signed<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::burn(_token_program.key, source.key, mint.key, _authority.key, &[], amount)?;
            invoke_signed(&ix, &[source.clone(), mint.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            mock::debit(source, amount)?;
            mock::supply(mint, amount, false)
        }
    }

}

// 10. mod processor
pub mod processor {
    use alloc::format;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_option::COption,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    use crate::{
        accounts,
        constants::{CLOCK_IDX, MAGIC, MARKET_ACCOUNTS, ORACLE_IDX, SLAB_LEN, TOKEN_DECIMALS, UNIT_WAD, VAULT_SEED, VERSION},
        engine::{Engine, EngineError, PositionAdjustment, SimpleInterest, NIL},
        error::{map_engine_error, SolventError},
        ix::Instruction,
        oracle,
        state::{self, MarketConfig, SlabHeader},
        token, units, zc,
    };

    #[inline(always)]
    fn cu_checkpoint(_label: &str) {
        #[cfg(feature = "cu-audit")]
        {
            msg!(_label);
            solana_program::log::sol_log_compute_units();
        }
    }

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(SolventError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(SolventError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(SolventError::InvalidVersion.into());
        }
        Ok(())
    }

    fn verify_mint(a_mint: &AccountInfo, expected_authority: Option<&Pubkey>) -> Result<(), ProgramError> {
        if a_mint.owner != &spl_token::ID || a_mint.data_len() != spl_token::state::Mint::LEN {
            return Err(SolventError::InvalidMint.into());
        }
        let data = a_mint.try_borrow_data()?;
        let mint = spl_token::state::Mint::unpack(&data)?;
        if mint.decimals != TOKEN_DECIMALS {
            return Err(SolventError::InvalidMint.into());
        }
        if let Some(auth) = expected_authority {
            if mint.mint_authority != COption::Some(*auth) {
                return Err(SolventError::InvalidAuthority.into());
            }
        }
        Ok(())
    }

    fn verify_vault(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey) -> Result<(), ProgramError> {
        if a_vault.owner != &spl_token::ID || a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(SolventError::InvalidVault.into());
        }
        let tok = token::read_account(a_vault)?;
        if tok.mint != *expected_mint {
            return Err(SolventError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(SolventError::InvalidVault.into());
        }
        Ok(())
    }

    /// Balance of a user's token account, in wad.
    fn user_balance_wad(a_token: &AccountInfo, mint: &Pubkey, owner: &Pubkey) -> Result<u128, ProgramError> {
        let tok = token::read_account(a_token)?;
        if tok.mint != *mint || tok.owner != *owner {
            return Err(SolventError::InvalidTokenAccount.into());
        }
        Ok(units::to_wad(tok.amount))
    }

    fn accrual(engine: &Engine) -> SimpleInterest {
        SimpleInterest { management_fee_bps: engine.params.management_fee_bps }
    }

    fn read_clock(accounts: &[AccountInfo]) -> Result<u64, ProgramError> {
        accounts::expect_len(accounts, CLOCK_IDX + 1)?;
        Ok(Clock::from_account_info(&accounts[CLOCK_IDX])?.slot)
    }

    /// Current slot and wad price.
    fn read_price(accounts: &[AccountInfo], config: &MarketConfig) -> Result<(u64, u128), ProgramError> {
        accounts::expect_len(accounts, ORACLE_IDX + 1)?;
        let now_slot = read_clock(accounts)?;
        let a_oracle = &accounts[ORACLE_IDX];
        accounts::expect_key(a_oracle, &Pubkey::new_from_array(config.oracle))?;
        let price = oracle::read_pyth_price_wad(a_oracle, now_slot, config.max_staleness_slots, config.conf_filter_bps)?;
        Ok((now_slot, price))
    }

    /// Accounts every market instruction carries, validated against the
    /// stored config.
    struct Market<'a, 'b> {
        user: &'b AccountInfo<'a>,
        user_coll: &'b AccountInfo<'a>,
        coll_vault: &'b AccountInfo<'a>,
        user_stable: &'b AccountInfo<'a>,
        stable_mint: &'b AccountInfo<'a>,
        stable_vault: &'b AccountInfo<'a>,
        authority: &'b AccountInfo<'a>,
        token_program: &'b AccountInfo<'a>,
        slab_key: Pubkey,
        bump: u8,
    }

    impl<'a, 'b> Market<'a, 'b> {
        fn load(program_id: &Pubkey, accounts: &'b [AccountInfo<'a>], config: &MarketConfig) -> Result<Self, ProgramError> {
            accounts::expect_len(accounts, MARKET_ACCOUNTS)?;
            let m = Self {
                user: &accounts[0],
                user_coll: &accounts[2],
                coll_vault: &accounts[3],
                user_stable: &accounts[4],
                stable_mint: &accounts[5],
                stable_vault: &accounts[6],
                authority: &accounts[7],
                token_program: &accounts[8],
                slab_key: *accounts[1].key,
                bump: config.authority_bump,
            };
            accounts::expect_signer(m.user)?;
            accounts::expect_key(m.token_program, &spl_token::ID)?;
            let auth = accounts::vault_authority(program_id, &m.slab_key, m.bump)?;
            if *m.authority.key != auth {
                return Err(SolventError::InvalidAuthority.into());
            }
            if m.coll_vault.key.to_bytes() != config.collateral_vault || m.stable_vault.key.to_bytes() != config.stable_vault {
                return Err(SolventError::InvalidVault.into());
            }
            if m.stable_mint.key.to_bytes() != config.stable_mint {
                return Err(SolventError::InvalidMint.into());
            }
            Ok(m)
        }

        fn owner(&self) -> [u8; 32] {
            self.user.key.to_bytes()
        }

        fn stable_balance_wad(&self) -> Result<u128, ProgramError> {
            user_balance_wad(self.user_stable, self.stable_mint.key, self.user.key)
        }

        /// Pay out of a vault.
        fn pay(&self, vault: &AccountInfo<'a>, dest: &AccountInfo<'a>, amount: u64) -> ProgramResult {
            if amount == 0 {
                return Ok(());
            }
            let bump = [self.bump];
            let seeds: [&[u8]; 3] = [VAULT_SEED, self.slab_key.as_ref(), &bump];
            token::transfer_signed(self.token_program, vault, dest, self.authority, amount, &[&seeds])
        }

        fn mint_stable(&self, dest: &AccountInfo<'a>, amount: u64) -> ProgramResult {
            if amount == 0 {
                return Ok(());
            }
            let bump = [self.bump];
            let seeds: [&[u8]; 3] = [VAULT_SEED, self.slab_key.as_ref(), &bump];
            token::mint_to_signed(self.token_program, self.stable_mint, dest, self.authority, amount, &[&seeds])
        }

        fn burn_from_vault(&self, amount: u64) -> ProgramResult {
            if amount == 0 {
                return Ok(());
            }
            let bump = [self.bump];
            let seeds: [&[u8]; 3] = [VAULT_SEED, self.slab_key.as_ref(), &bump];
            token::burn_signed(self.token_program, self.stable_vault, self.stable_mint, self.authority, amount, &[&seeds])
        }

        fn burn_from_user(&self, amount: u64) -> ProgramResult {
            if amount == 0 {
                return Ok(());
            }
            token::burn(self.token_program, self.user_stable, self.stable_mint, self.user, amount)
        }

        fn collect(&self, source: &AccountInfo<'a>, vault: &AccountInfo<'a>, amount: u64) -> ProgramResult {
            if amount == 0 {
                return Ok(());
            }
            token::transfer(self.token_program, source, vault, self.user, amount)
        }

        /// Mint accrued interest into the stable vault and burn what the
        /// buffer absorbed, in whole units. Remainders stay pending.
        fn settle(&self, engine: &mut Engine) -> ProgramResult {
            let minted = units::to_units_floor(engine.take_pending_mint(UNIT_WAD))?;
            self.mint_stable(self.stable_vault, minted)?;
            let burned = units::to_units_floor(engine.take_pending_burn(UNIT_WAD))?;
            self.burn_from_vault(burned)
        }
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitMarket { params, max_staleness_slots, conf_filter_bps } => {
                msg!("Instruction: InitMarket");
                accounts::expect_len(accounts, 7)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_coll_mint = &accounts[2];
                let a_coll_vault = &accounts[3];
                let a_stable_mint = &accounts[4];
                let a_stable_vault = &accounts[5];
                let a_oracle = &accounts[6];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(SolventError::AlreadyInitialized.into());
                }
                if params.liquidation_reserve.get() % UNIT_WAD != 0 || conf_filter_bps == 0 {
                    return Err(SolventError::InvalidMarketParams.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_mint(a_coll_mint, None)?;
                verify_mint(a_stable_mint, Some(&auth))?;
                verify_vault(a_coll_vault, &auth, a_coll_mint.key)?;
                verify_vault(a_stable_vault, &auth, a_stable_mint.key)?;

                data.fill(0);
                zc::engine_mut(&mut data)?.init_in_place(params).map_err(map_engine_error)?;

                let config = MarketConfig {
                    collateral_mint: a_coll_mint.key.to_bytes(),
                    collateral_vault: a_coll_vault.key.to_bytes(),
                    stable_mint: a_stable_mint.key.to_bytes(),
                    stable_vault: a_stable_vault.key.to_bytes(),
                    oracle: a_oracle.key.to_bytes(),
                    max_staleness_slots,
                    conf_filter_bps,
                    authority_bump: bump,
                    _padding: [0; 5],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::OpenPosition { collateral, debt, rank_key, hint_prev, hint_next } => {
                msg!("Instruction: OpenPosition");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let (now_slot, price) = read_price(accounts, &config)?;
                let engine = zc::engine_mut(&mut data)?;
                cu_checkpoint("open: start");

                let out = engine
                    .open(
                        m.owner(),
                        units::to_wad(collateral),
                        units::to_wad(debt),
                        rank_key,
                        hint_prev,
                        hint_next,
                        price,
                        now_slot,
                    )
                    .map_err(map_engine_error)?;

                m.collect(m.user_coll, m.coll_vault, collateral)?;
                m.mint_stable(m.user_stable, debt)?;
                m.mint_stable(m.stable_vault, units::to_units_floor(out.reserve)?)?;
                m.settle(engine)?;
                cu_checkpoint("open: done");
                msg!("position {} id {} on {}", out.slot, out.position_id, m.slab_key);
            }
            Instruction::AdjustPosition { position, coll_in, coll_out, debt_in, debt_out } => {
                msg!("Instruction: AdjustPosition");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let (now_slot, price) = read_price(accounts, &config)?;
                let engine = zc::engine_mut(&mut data)?;

                let adj = PositionAdjustment {
                    coll_in: units::to_wad(coll_in),
                    coll_out: units::to_wad(coll_out),
                    debt_in: units::to_wad(debt_in),
                    debt_out: units::to_wad(debt_out),
                };
                let model = accrual(engine);
                engine
                    .adjust_position(&model, position, &m.owner(), adj, price, now_slot)
                    .map_err(map_engine_error)?;

                m.collect(m.user_coll, m.coll_vault, coll_in)?;
                m.pay(m.coll_vault, m.user_coll, coll_out)?;
                m.mint_stable(m.user_stable, debt_in)?;
                m.burn_from_user(debt_out)?;
                m.settle(engine)?;
            }
            Instruction::AdjustRank { position, rank_key, hint_prev, hint_next } => {
                msg!("Instruction: AdjustRank");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let now_slot = read_clock(accounts)?;
                let engine = zc::engine_mut(&mut data)?;

                let model = accrual(engine);
                engine
                    .adjust_rank(&model, position, &m.owner(), rank_key, hint_prev, hint_next, now_slot)
                    .map_err(map_engine_error)?;
                m.settle(engine)?;
            }
            Instruction::ClosePosition { position } => {
                msg!("Instruction: ClosePosition");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let (now_slot, price) = read_price(accounts, &config)?;
                let balance = m.stable_balance_wad()?;
                let engine = zc::engine_mut(&mut data)?;

                let model = accrual(engine);
                let out = engine
                    .close(&model, position, &m.owner(), balance, price, now_slot)
                    .map_err(map_engine_error)?;

                m.burn_from_user(units::to_units_ceil(out.debt_repaid)?)?;
                m.burn_from_vault(units::to_units_floor(out.reserve_burned)?)?;
                m.pay(m.coll_vault, m.user_coll, units::to_units_floor(out.coll_returned)?)?;
                m.settle(engine)?;
            }
            Instruction::ClaimSurplus { position } => {
                msg!("Instruction: ClaimSurplus");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let engine = zc::engine_mut(&mut data)?;

                let out = engine.claim_surplus(position, &m.owner()).map_err(map_engine_error)?;
                m.pay(m.coll_vault, m.user_coll, units::to_units_floor(out.coll_paid)?)?;
                m.burn_from_vault(units::to_units_floor(out.reserve_burned)?)?;
                m.settle(engine)?;
                msg!("surplus coll={} reserve_burned={}", out.coll_paid, out.reserve_burned);
            }
            Instruction::Liquidate { position } => {
                msg!("Instruction: Liquidate");
                process_liquidation(program_id, accounts, &[position], false)?;
            }
            Instruction::BatchLiquidate { ids, count } => {
                msg!("Instruction: BatchLiquidate");
                process_liquidation(program_id, accounts, &ids[..count as usize], true)?;
            }
            Instruction::Redeem { amount, max_iterations, max_fee } => {
                msg!("Instruction: Redeem");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let (now_slot, price) = read_price(accounts, &config)?;
                let balance = m.stable_balance_wad()?;
                let engine = zc::engine_mut(&mut data)?;
                cu_checkpoint("redeem: start");

                let model = accrual(engine);
                let mut fee_model = engine.redemption_fee;
                let out = engine
                    .redeem(&mut fee_model, &model, balance, units::to_wad(amount), max_iterations, max_fee, price, now_slot)
                    .map_err(map_engine_error)?;
                engine.redemption_fee = fee_model;

                m.burn_from_user(units::to_units_ceil(out.redeemed)?)?;
                m.pay(m.coll_vault, m.user_coll, units::to_units_floor(out.coll_drawn)?)?;
                m.settle(engine)?;
                cu_checkpoint("redeem: done");
                msg!(
                    "redeemed={} coll={} fee_rate={} cleared={} partial={}",
                    out.redeemed,
                    out.coll_drawn,
                    out.fee_rate,
                    out.positions_cleared,
                    out.positions_partial
                );
            }
            Instruction::ProvideToBuffer { depositor, amount } => {
                msg!("Instruction: ProvideToBuffer");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let engine = zc::engine_mut(&mut data)?;

                if amount == 0 {
                    return Err(map_engine_error(EngineError::ZeroAmount));
                }
                let idx = if depositor == NIL {
                    engine.buffer.add_depositor(m.owner()).map_err(map_engine_error)?
                } else {
                    require_depositor(engine, depositor, &m.owner())?;
                    depositor
                };
                let out = engine.buffer.provide(idx, units::to_wad(amount)).map_err(map_engine_error)?;
                m.collect(m.user_stable, m.stable_vault, amount)?;
                msg!("depositor {} balance {}", idx, out.new_balance);
            }
            Instruction::WithdrawFromBuffer { depositor, amount } => {
                msg!("Instruction: WithdrawFromBuffer");
                let mut data = load_slab(program_id, accounts)?;
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                let engine = zc::engine_mut(&mut data)?;

                require_depositor(engine, depositor, &m.owner())?;
                let out = engine.buffer.withdraw(depositor, units::to_wad(amount)).map_err(map_engine_error)?;
                // Yield may still be pending mint.
                m.settle(engine)?;
                let stable_out = out.withdrawn.checked_add(out.yield_paid).ok_or(SolventError::AmountOverflow)?;
                m.pay(m.stable_vault, m.user_stable, units::to_units_floor(stable_out)?)?;
                m.pay(m.coll_vault, m.user_coll, units::to_units_floor(out.coll_paid)?)?;
                msg!("depositor {} remaining {} released {}", depositor, out.remaining, out.released);
            }
            Instruction::CollectFees => {
                msg!("Instruction: CollectFees");
                let mut data = load_slab(program_id, accounts)?;
                let header = state::read_header(&data);
                let config = state::read_config(&data);
                let m = Market::load(program_id, accounts, &config)?;
                if m.user.key.to_bytes() != header.admin {
                    return Err(SolventError::Unauthorized.into());
                }
                let engine = zc::engine_mut(&mut data)?;

                m.settle(engine)?;
                let fees = units::to_units_floor(engine.collect_protocol_fees(UNIT_WAD))?;
                m.pay(m.stable_vault, m.user_stable, fees)?;
                msg!("fees collected {}", fees);
            }
        }
        Ok(())
    }

    fn load_slab<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
    ) -> Result<core::cell::RefMut<'b, &'a mut [u8]>, ProgramError> {
        accounts::expect_len(accounts, MARKET_ACCOUNTS)?;
        let a_slab = &accounts[1];
        accounts::expect_writable(a_slab)?;
        let data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        Ok(data)
    }

    fn require_depositor(engine: &Engine, idx: u16, owner: &[u8; 32]) -> Result<(), ProgramError> {
        match engine.buffer.depositor_owner(idx) {
            None => Err(map_engine_error(EngineError::DepositorNotFound)),
            Some(o) if &o != owner => Err(SolventError::Unauthorized.into()),
            Some(_) => Ok(()),
        }
    }

    fn process_liquidation<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        ids: &[u16],
        batch: bool,
    ) -> ProgramResult {
        let mut data = load_slab(program_id, accounts)?;
        let config = state::read_config(&data);
        let m = Market::load(program_id, accounts, &config)?;
        let (now_slot, price) = read_price(accounts, &config)?;
        let engine = zc::engine_mut(&mut data)?;
        cu_checkpoint("liquidate: start");

        let model = accrual(engine);
        let res = if batch {
            engine.batch_liquidate(&model, ids, price, now_slot)
        } else {
            engine.liquidate(&model, ids[0], price, now_slot)
        };
        let out = res.map_err(map_engine_error)?;

        m.pay(m.coll_vault, m.user_coll, units::to_units_floor(out.coll_compensation)?)?;
        m.pay(m.stable_vault, m.user_stable, units::to_units_floor(out.reserve_compensation)?)?;
        m.settle(engine)?;
        cu_checkpoint("liquidate: done");
        msg!(
            "liquidated={} offset={} to_buffer={} redistributed={} surplus={}",
            out.liquidated,
            out.debt_offset,
            out.coll_to_buffer,
            out.debt_redistributed,
            out.coll_surplus
        );
        Ok(())
    }
}

// 11. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use crate::{error::SolventError, processor};
    use num_traits::FromPrimitive;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint,
        entrypoint::ProgramResult,
        program_error::{PrintProgramError, ProgramError},
        pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        if let Err(error) = processor::process_instruction(program_id, accounts, instruction_data) {
            if let ProgramError::Custom(code) = error {
                if let Some(e) = SolventError::from_u32(code) {
                    e.print::<SolventError>();
                }
            }
            return Err(error);
        }
        Ok(())
    }

    solana_security_txt::security_txt! {
        name: "Solvent",
        project_url: "https://github.com/solvent-prog/solvent-prog",
        contacts: "link:https://github.com/solvent-prog/solvent-prog/security/advisories/new",
        policy: "https://github.com/solvent-prog/solvent-prog/security/policy",
        preferred_languages: "en"
    }
}
