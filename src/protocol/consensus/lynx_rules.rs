//! The Lynx coinbase-eligibility rules.
//!
//! Three height-gated predicates restrict which address may receive a block
//! reward:
//!
//! 1. the address must not have been a coinbase destination in the last `n`
//!    blocks;
//! 2. the address must hold a minimum balance derived from a recent block's
//!    difficulty;
//! 3. the SHA-256 of the address and the block hash must agree on their
//!    last `n` hex characters.
//!
//! Each rule is inactive until its hard-fork activation height has passed,
//! so all three return success unconditionally on early chain segments.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;
use tracing::warn;

use super::address::Address;
use super::amount::Amount;
use super::amount::COIN;
use super::block::block_height::BlockHeight;
use super::block::block_index::BlockIndex;
use super::block::Block;
use super::pow::difficulty_prev_n;
use super::transaction::Transaction;
use super::validation::ValidationState;
use super::ConsensusParams;
use crate::state::chain::ChainView;
use crate::state::chain::ReadBlockError;

/// Reject reason attached to the validation state when any rule fails.
pub const REJECT_BAD_CB_DESTINATION: &str = "bad-cb-destination";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LynxRuleError {
    #[error(transparent)]
    ReadBlock(#[from] ReadBlockError),

    #[error("new blocks with coinbase destination {0} are temporarily not allowed")]
    DestinationRecentlyRewarded(Address),

    #[error("coinbase transaction has no standard destination")]
    MissingDestination,

    #[error("not enough coins on address {address}: balance={balance}, required={required}")]
    InsufficientBalance {
        address: Address,
        balance: Amount,
        required: Amount,
    },
}

/// Why an address may not mine on top of the current tip. The messages are
/// surfaced verbatim through the RPC layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressEligibilityError {
    #[error("Unable to get the latest Coinbase addresses")]
    ProhibitedSetUnavailable,

    #[error("Address get reward not long ago")]
    RecentlyRewarded,

    #[error("Not enough coins on address")]
    InsufficientBalance,
}

/// The minimum balance a reward address must hold to mine on top of `best`.
///
/// Zero while rule 2 is inactive. Active: the reference difficulty (the
/// block `difficulty_prev_block_count` behind the tip) raised to the
/// configured exponent, in coins, clamped into
/// `[min_balance_lower_limit, min_balance_upper_limit]`.
pub fn min_balance_for_mining(best: &BlockIndex, params: &ConsensusParams) -> Amount {
    let Some(exponent) = params.rule2_params.param_at(best.height) else {
        return Amount::zero();
    };

    let difficulty = difficulty_prev_n(best, params.difficulty_prev_block_count);
    let raw = difficulty.powi(exponent as i32) * COIN as f64;
    if raw.is_infinite() || raw > params.min_balance_upper_limit.units() as f64 {
        return params.min_balance_upper_limit;
    }
    Amount::from_units(raw as i64).max(params.min_balance_lower_limit)
}

/// The set of addresses rule 1 currently bars from mining: every coinbase
/// destination of the last `n` blocks, counting `best` itself.
///
/// Empty while rule 1 is inactive. Fails if any of the blocks cannot be
/// read back from storage.
pub fn addresses_prohibited_for_mining(
    chain: &dyn ChainView,
    best: &BlockIndex,
    params: &ConsensusParams,
) -> Result<BTreeSet<Address>, ReadBlockError> {
    let mut prohibited = BTreeSet::new();
    let Some(n_blocks) = params.rule1_params.param_at(best.height) else {
        return Ok(prohibited);
    };

    let mut index = Some(best);
    for _ in 0..n_blocks {
        let Some(current) = index else { break };
        let block = chain.read_block(current)?;
        if let Some(coinbase) = block.coinbase() {
            prohibited.extend(coinbase.destinations());
        }
        index = current.prev.as_deref();
    }

    Ok(prohibited)
}

/// The first address in `balances` that passes the rule-1 and rule-2 gates,
/// in the map's iteration order. `None` when no address qualifies or the
/// prohibited set cannot be determined.
pub fn find_address_for_mining<'a>(
    chain: &dyn ChainView,
    balances: &'a BTreeMap<Address, Amount>,
    best: &BlockIndex,
    params: &ConsensusParams,
) -> Option<&'a Address> {
    let prohibited = match addresses_prohibited_for_mining(chain, best, params) {
        Ok(prohibited) => prohibited,
        Err(err) => {
            warn!("cannot determine prohibited mining addresses: {err}");
            return None;
        }
    };
    let min_balance = min_balance_for_mining(best, params);

    balances
        .iter()
        .find(|(address, balance)| !prohibited.contains(address) && **balance >= min_balance)
        .map(|(address, _)| address)
}

/// Check a single address against the rule-1 and rule-2 gates.
pub fn is_valid_address_for_mining(
    chain: &dyn ChainView,
    address: &Address,
    balance: Amount,
    best: &BlockIndex,
    params: &ConsensusParams,
) -> Result<(), AddressEligibilityError> {
    let prohibited = addresses_prohibited_for_mining(chain, best, params)
        .map_err(|_| AddressEligibilityError::ProhibitedSetUnavailable)?;
    if prohibited.contains(address) {
        return Err(AddressEligibilityError::RecentlyRewarded);
    }

    if balance < min_balance_for_mining(best, params) {
        return Err(AddressEligibilityError::InsufficientBalance);
    }

    Ok(())
}

/// Rule 1: none of the block's coinbase destinations may appear as a
/// coinbase destination of the previous `n` blocks.
pub fn check_rule1(
    chain: &dyn ChainView,
    block: &Block,
    index: &BlockIndex,
    params: &ConsensusParams,
) -> Result<(), LynxRuleError> {
    let Some(n_blocks) = params.rule1_params.param_at(index.height) else {
        return Ok(());
    };

    let destinations = block.coinbase().map(Transaction::destinations).unwrap_or_default();

    let mut prev = index.prev.as_deref();
    for _ in 0..n_blocks {
        let Some(current) = prev else { break };
        let prev_block = chain.read_block(current)?;
        if let Some(coinbase) = prev_block.coinbase() {
            for prev_destination in coinbase.destinations() {
                if destinations.contains(&prev_destination) {
                    return Err(LynxRuleError::DestinationRecentlyRewarded(prev_destination));
                }
            }
        }
        prev = current.prev.as_deref();
    }

    Ok(())
}

/// Rule 2: the first coinbase destination must hold at least the minimum
/// balance computed against the tip the block was mined on.
pub fn check_rule2(
    chain: &dyn ChainView,
    block: &Block,
    index: &BlockIndex,
    params: &ConsensusParams,
) -> Result<(), LynxRuleError> {
    if !params.rule2_params.is_active_at(index.height) {
        return Ok(());
    }

    let destinations = block.coinbase().map(Transaction::destinations).unwrap_or_default();
    let Some(address) = destinations.into_iter().next() else {
        return Err(LynxRuleError::MissingDestination);
    };

    let balance = chain.address_balance(&address);
    let required = match index.prev.as_deref() {
        Some(prev) => min_balance_for_mining(prev, params),
        None => Amount::zero(),
    };
    if balance < required {
        return Err(LynxRuleError::InsufficientBalance {
            address,
            balance,
            required,
        });
    }

    Ok(())
}

/// Rule 3: the last `n` hex characters of the SHA-256 of the first coinbase
/// destination must equal the last `n` hex characters of the block hash,
/// case-sensitive.
///
/// `from_builtin_miner` only adds diagnostics for the miner log; the verdict
/// is identical either way.
pub fn check_rule3(
    block: &Block,
    height: BlockHeight,
    params: &ConsensusParams,
    from_builtin_miner: bool,
) -> bool {
    let Some(n_chars) = params.rule3_params.param_at(height) else {
        return true;
    };

    let destinations = block.coinbase().map(Transaction::destinations).unwrap_or_default();
    let Some(address) = destinations.first() else {
        warn!("rule 3: coinbase transaction has no standard destination");
        return false;
    };

    let address_hex = address.sha256_hex();
    let block_hex = block.hash().to_hex();
    let n_chars = (n_chars as usize).min(address_hex.len()).min(block_hex.len());
    let address_suffix = &address_hex[address_hex.len() - n_chars..];
    let block_suffix = &block_hex[block_hex.len() - n_chars..];

    if from_builtin_miner {
        debug!("BuiltinMiner: Reward address: {address}");
        debug!("BuiltinMiner: Address_hash: {address_hex}");
        debug!("BuiltinMiner: Block hash: {block_hex}");
    }

    let matches = address_suffix == block_suffix;
    if from_builtin_miner {
        if matches {
            debug!("BuiltinMiner: Candidate block {block_hex} Rule3 passed");
        } else {
            debug!(
                "BuiltinMiner: Candidate block {block_hex} Rule3 failed. Block hash and sha256 \
                 hash of the first destination should end on the same {n_chars} chars \
                 ({address_suffix}<>{block_suffix})"
            );
        }
    }
    matches
}

/// Apply rules 1–3 in order. Any failure marks the validation state with
/// [`REJECT_BAD_CB_DESTINATION`] at DoS level 100.
pub fn check_lynx_rules(
    chain: &dyn ChainView,
    block: &Block,
    index: &BlockIndex,
    params: &ConsensusParams,
    state: &mut ValidationState,
) -> bool {
    if let Err(err) = check_rule1(chain, block, index, params) {
        warn!("rule 1 failed for block {}: {err}", index.hash);
        return state.dos(100, REJECT_BAD_CB_DESTINATION);
    }

    if let Err(err) = check_rule2(chain, block, index, params) {
        warn!("rule 2 failed for block {}: {err}", index.hash);
        return state.dos(100, REJECT_BAD_CB_DESTINATION);
    }

    if !check_rule3(block, index.height, params, false) {
        warn!("rule 3 failed for block {}", index.hash);
        return state.dos(100, REJECT_BAD_CB_DESTINATION);
    }

    true
}
