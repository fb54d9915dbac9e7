//! Resolution of the coinbase reward script for each mining iteration.
//!
//! With a wallet attached the script comes from the wallet's key pool and is
//! committed only when a block is accepted. Without a wallet the miner works
//! through a configured candidate-address list, gated by the same
//! eligibility rules that full validation will apply to the block.

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::protocol::consensus::address::Address;
use crate::protocol::consensus::block::block_height::BlockHeight;
use crate::protocol::consensus::block::block_index::BlockIndex;
use crate::protocol::consensus::lynx_rules;
use crate::protocol::consensus::transaction::Script;
use crate::protocol::consensus::ConsensusParams;
use crate::state::chain::ChainView;
use crate::state::wallet::ReserveScript;
use crate::state::wallet::WalletSource;

/// How long to wait before re-reading the miner-address list from the
/// configuration file when none is configured.
const RELOAD_CONFIG_INTERVAL: Duration = Duration::from_secs(120);

/// Poll granularity of every selector wait, so shutdown stays responsive.
const RELOAD_POLL: Duration = Duration::from_millis(200);

/// The per-worker selection cache: a script stays valid until the chain tip
/// advances past the height it was selected at.
#[derive(Debug, Default)]
pub(crate) struct CachedScript {
    pub script: Option<Arc<ReserveScript>>,
    pub height: Option<BlockHeight>,
}

pub(crate) struct CoinbaseSelector {
    chain: Arc<dyn ChainView>,
    consensus: Arc<ConsensusParams>,
    wallet: Option<Arc<dyn WalletSource>>,
    addresses: Mutex<Vec<String>>,
    conf: Option<PathBuf>,
}

impl CoinbaseSelector {
    pub fn new(
        chain: Arc<dyn ChainView>,
        consensus: Arc<ConsensusParams>,
        wallet: Option<Arc<dyn WalletSource>>,
        addresses: Vec<String>,
        conf: Option<PathBuf>,
    ) -> Self {
        Self {
            chain,
            consensus,
            wallet,
            addresses: Mutex::new(addresses),
            conf,
        }
    }

    /// Resolve the reward script for the next mining attempt.
    ///
    /// A cached selection is reused while the tip height is unchanged;
    /// otherwise a fresh one is made and cached. Returns `None` when no
    /// script can be produced this cycle, in which case the caller retries
    /// later.
    pub fn get_script_for_mining(
        &self,
        cached: &mut CachedScript,
        running: &AtomicBool,
    ) -> Option<Arc<ReserveScript>> {
        let height = self.chain.height();
        if cached.script.is_some() && cached.height == height && height.is_some() {
            return cached.script.clone();
        }

        let script = match &self.wallet {
            Some(wallet) => match wallet.get_script_for_mining() {
                Ok(script) => Some(Arc::new(script)),
                Err(err) => {
                    debug!("wallet did not issue a mining script: {err}");
                    None
                }
            },
            None => self.script_from_candidates(running),
        };

        if script.is_some() {
            cached.height = height;
        }
        cached.script = script.clone();
        script
    }

    fn script_from_candidates(&self, running: &AtomicBool) -> Option<Arc<ReserveScript>> {
        let candidates = self.addresses.lock().unwrap().clone();
        if candidates.is_empty() {
            self.wait_and_reload_addresses(running);
            return None;
        }

        let Some(tip) = self.chain.tip() else {
            warn!("can't get current block");
            return None;
        };

        let address = if self.consensus.rule1_params.is_active_at(tip.height) {
            self.first_eligible_candidate(&candidates, &tip)
        } else {
            random_valid_candidate(&candidates)
        }?;

        Some(Arc::new(ReserveScript::new(Script::pay_to_address(
            &address,
        ))))
    }

    /// Rule-gated selection: the first candidate that is not in the
    /// prohibited set and holds the minimum balance.
    fn first_eligible_candidate(
        &self,
        candidates: &[String],
        tip: &BlockIndex,
    ) -> Option<Address> {
        let prohibited = match lynx_rules::addresses_prohibited_for_mining(
            self.chain.as_ref(),
            tip,
            &self.consensus,
        ) {
            Ok(prohibited) => prohibited,
            Err(err) => {
                warn!("cannot determine prohibited mining addresses: {err}");
                return None;
            }
        };
        let min_balance = lynx_rules::min_balance_for_mining(tip, &self.consensus);

        for candidate in candidates {
            let address = match Address::parse(candidate) {
                Ok(address) => address,
                Err(_) => {
                    info!("Mining address {candidate} is invalid");
                    continue;
                }
            };
            let balance = self.chain.address_balance(&address);
            if !prohibited.contains(&address) && balance >= min_balance {
                return Some(address);
            }
        }

        None
    }

    /// No addresses are configured: wait (shutdown-aware) and then reload
    /// the list from the configuration file, if one was given.
    fn wait_and_reload_addresses(&self, running: &AtomicBool) {
        info!("no mining addresses configured; will reload the configuration shortly");
        let deadline = Instant::now() + RELOAD_CONFIG_INTERVAL;
        while running.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(RELOAD_POLL);
        }
        if !running.load(Ordering::Acquire) {
            return;
        }

        let Some(path) = &self.conf else { return };
        match load_miner_addresses(path) {
            Ok(addresses) if !addresses.is_empty() => {
                info!(
                    "reloaded {} miner address(es) from {}",
                    addresses.len(),
                    path.display()
                );
                *self.addresses.lock().unwrap() = addresses;
            }
            Ok(_) => debug!("no miner addresses in {}", path.display()),
            Err(err) => warn!(
                "failed to reload miner addresses from {}: {err}",
                path.display()
            ),
        }
    }
}

fn random_valid_candidate(candidates: &[String]) -> Option<Address> {
    let mut rng = rand::rng();
    let candidate = &candidates[rng.random_range(0..candidates.len())];
    match Address::parse(candidate) {
        Ok(address) => Some(address),
        Err(_) => {
            info!("Mining address {candidate} is invalid");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct MinerConfigFile {
    #[serde(default)]
    miner_addresses: Vec<String>,
}

fn load_miner_addresses(path: &Path) -> anyhow::Result<Vec<String>> {
    let file = File::open(path)?;
    let config: MinerConfigFile = serde_json::from_reader(file)?;
    Ok(config.miner_addresses)
}
