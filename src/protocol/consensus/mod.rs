pub mod address;
pub mod amount;
pub mod block;
pub mod lynx_rules;
pub mod pow;
pub mod transaction;
pub mod validation;

use amount::Amount;
use block::block_height::BlockHeight;

/// One entry of a height-gated hard-fork parameter table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardForkParam {
    pub activation_height: BlockHeight,
    pub param: i64,
}

/// A hard-fork parameter table, sorted by ascending activation height.
///
/// A rule becomes active strictly *after* its activation height: at
/// `height == activation_height` the old behavior still applies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardForkParams(Vec<HardForkParam>);

impl HardForkParams {
    pub fn new(entries: impl IntoIterator<Item = (u64, i64)>) -> Self {
        let mut entries: Vec<HardForkParam> = entries
            .into_iter()
            .map(|(height, param)| HardForkParam {
                activation_height: BlockHeight::new(height),
                param,
            })
            .collect();
        entries.sort_by_key(|entry| entry.activation_height);
        Self(entries)
    }

    /// The parameter value in force at `height`, or `None` while the rule is
    /// inactive. Scans from the highest activation height downwards and
    /// takes the first entry the height has passed.
    pub fn param_at(&self, height: BlockHeight) -> Option<i64> {
        self.0
            .iter()
            .rev()
            .find(|entry| height > entry.activation_height)
            .map(|entry| entry.param)
    }

    pub fn is_active_at(&self, height: BlockHeight) -> bool {
        self.param_at(height).is_some()
    }
}

/// The consensus parameters the miner core consumes. The proof-of-work
/// retargeting parameters live with the validation pipeline, not here.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// Rule 1: how many recent blocks' coinbase destinations are prohibited.
    pub rule1_params: HardForkParams,
    /// Rule 2: exponent applied to the reference difficulty.
    pub rule2_params: HardForkParams,
    /// Rule 3: number of trailing hex characters that must match.
    pub rule3_params: HardForkParams,
    pub min_balance_lower_limit: Amount,
    pub min_balance_upper_limit: Amount,
    /// How many blocks behind the tip the rule-2 reference difficulty sits.
    pub difficulty_prev_block_count: u64,
}

impl ConsensusParams {
    /// Parameters for an in-memory regression-test chain: every rule
    /// activates within the first few dozen blocks.
    pub fn regtest() -> Self {
        Self {
            rule1_params: HardForkParams::new([(20, 3)]),
            rule2_params: HardForkParams::new([(30, 2)]),
            rule3_params: HardForkParams::new([(40, 1)]),
            min_balance_lower_limit: Amount::from_coins(1),
            min_balance_upper_limit: Amount::from_coins(100_000),
            difficulty_prev_block_count: 10,
        }
    }
}
