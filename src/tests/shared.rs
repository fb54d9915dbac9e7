//! Shared regtest fixtures: an in-memory chain that implements every node
//! seam the miner consumes, plus deterministic address and wallet helpers.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tracing::debug;

use crate::application::loops::mine_loop::MinerContext;
use crate::protocol::consensus::address::Address;
use crate::protocol::consensus::amount::Amount;
use crate::protocol::consensus::block::block_height::BlockHeight;
use crate::protocol::consensus::block::block_index::BlockIndex;
use crate::protocol::consensus::block::Block;
use crate::protocol::consensus::block::BlockHash;
use crate::protocol::consensus::block::BlockHeader;
use crate::protocol::consensus::lynx_rules::check_lynx_rules;
use crate::protocol::consensus::lynx_rules::check_rule3;
use crate::protocol::consensus::pow::PowOracle;
use crate::protocol::consensus::transaction::Script;
use crate::protocol::consensus::transaction::Transaction;
use crate::protocol::consensus::validation::ValidationState;
use crate::protocol::consensus::ConsensusParams;
use crate::state::chain::BlockSink;
use crate::state::chain::BlockTemplate;
use crate::state::chain::BlockTemplateSource;
use crate::state::chain::ChainView;
use crate::state::chain::ReadBlockError;
use crate::state::wallet::ReserveScript;
use crate::state::wallet::WalletError;
use crate::state::wallet::WalletSource;

/// Compact target of every regtest block header.
pub const REGTEST_NBITS: u32 = 0x207fffff;

pub const BLOCK_SUBSIDY: Amount = Amount::from_coins(50);

struct ChainInner {
    tip: Arc<BlockIndex>,
    blocks: HashMap<BlockHash, Block>,
    balances: BTreeMap<Address, Amount>,
    initial_block_download: bool,
    fail_reads: bool,
}

/// An in-memory chain with full Lynx-rule enforcement on block intake.
pub struct RegtestChain {
    consensus: Arc<ConsensusParams>,
    inner: Mutex<ChainInner>,
}

impl RegtestChain {
    pub fn new(consensus: ConsensusParams) -> Arc<Self> {
        let genesis_block = Block {
            header: BlockHeader {
                nbits: REGTEST_NBITS,
                ..Default::default()
            },
            transactions: vec![],
        };
        let genesis_index = Arc::new(BlockIndex {
            height: BlockHeight::genesis(),
            hash: genesis_block.hash(),
            nbits: REGTEST_NBITS,
            prev: None,
        });
        let mut blocks = HashMap::new();
        blocks.insert(genesis_index.hash, genesis_block);

        Arc::new(Self {
            consensus: Arc::new(consensus),
            inner: Mutex::new(ChainInner {
                tip: genesis_index,
                blocks,
                balances: BTreeMap::new(),
                initial_block_download: false,
                fail_reads: false,
            }),
        })
    }

    pub fn consensus(&self) -> Arc<ConsensusParams> {
        Arc::clone(&self.consensus)
    }

    pub fn tip_index(&self) -> Arc<BlockIndex> {
        Arc::clone(&self.inner.lock().unwrap().tip)
    }

    pub fn tip_height(&self) -> BlockHeight {
        self.inner.lock().unwrap().tip.height
    }

    pub fn set_initial_block_download(&self, flag: bool) {
        self.inner.lock().unwrap().initial_block_download = flag;
    }

    /// Make every subsequent `read_block` fail, to exercise the fail-closed
    /// paths of the rules.
    pub fn set_fail_reads(&self, flag: bool) {
        self.inner.lock().unwrap().fail_reads = flag;
    }

    pub fn set_balance(&self, address: &Address, balance: Amount) {
        self.inner
            .lock()
            .unwrap()
            .balances
            .insert(address.clone(), balance);
    }

    pub fn balances_of(&self, addresses: &[Address]) -> BTreeMap<Address, Amount> {
        let inner = self.inner.lock().unwrap();
        addresses
            .iter()
            .map(|address| {
                let balance = inner
                    .balances
                    .get(address)
                    .copied()
                    .unwrap_or(Amount::zero());
                (address.clone(), balance)
            })
            .collect()
    }

    /// Mine one block paying `address`, searching nonces until rule 3 is
    /// satisfied, and submit it. Returns whether the chain accepted it.
    pub fn mine_block_to(&self, address: &Address) -> bool {
        let script = Script::pay_to_address(address);
        let Some(template) = self.create_new_block(&script) else {
            return false;
        };
        let mut block = template.block;
        let next_height = self.tip_height().next();

        for nonce in 0..0x20000u32 {
            block.header.nonce = nonce;
            if check_rule3(&block, next_height, &self.consensus, false) {
                return self.accept(block, true);
            }
        }
        false
    }

    /// Mine `count` blocks to `address`, asserting each is accepted.
    pub fn mine_blocks_to(&self, count: u64, address: &Address) {
        for _ in 0..count {
            let height = self.tip_height();
            assert!(
                self.mine_block_to(address),
                "block to {address} rejected at height {}",
                height.next()
            );
        }
    }

    /// A solved block paying `address` whose hash-suffix does NOT satisfy
    /// rule 3 at the next height. Panics if rule 3 is inactive there.
    pub fn block_violating_rule3(&self, address: &Address) -> Block {
        let script = Script::pay_to_address(address);
        let mut block = self.create_new_block(&script).expect("template").block;
        let next_height = self.tip_height().next();
        assert!(
            self.consensus.rule3_params.is_active_at(next_height),
            "rule 3 must be active to construct a violating block"
        );

        for nonce in 0..0x20000u32 {
            block.header.nonce = nonce;
            if !check_rule3(&block, next_height, &self.consensus, false) {
                return block;
            }
        }
        unreachable!("no nonce with a mismatched hash suffix found");
    }
}

impl ChainView for RegtestChain {
    fn tip(&self) -> Option<Arc<BlockIndex>> {
        Some(self.tip_index())
    }

    fn read_block(&self, index: &BlockIndex) -> Result<Block, ReadBlockError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_reads {
            return Err(ReadBlockError {
                hash: index.hash,
                height: index.height,
            });
        }
        inner
            .blocks
            .get(&index.hash)
            .cloned()
            .ok_or(ReadBlockError {
                hash: index.hash,
                height: index.height,
            })
    }

    fn address_balance(&self, address: &Address) -> Amount {
        self.inner
            .lock()
            .unwrap()
            .balances
            .get(address)
            .copied()
            .unwrap_or(Amount::zero())
    }

    fn is_initial_block_download(&self) -> bool {
        self.inner.lock().unwrap().initial_block_download
    }
}

impl BlockTemplateSource for RegtestChain {
    fn create_new_block(&self, coinbase_script: &Script) -> Option<BlockTemplate> {
        let tip = self.tip_index();
        let next_height = tip.height.next();
        let coinbase = Transaction::coinbase(coinbase_script.clone(), BLOCK_SUBSIDY);
        let mut block = Block {
            header: BlockHeader {
                prev_block_hash: tip.hash,
                timestamp: next_height.value(),
                nbits: REGTEST_NBITS,
                ..Default::default()
            },
            transactions: vec![coinbase],
        };
        block.update_merkle_root();
        Some(BlockTemplate { block })
    }
}

impl PowOracle for RegtestChain {
    fn check(&self, _pow_hash: &BlockHash, _nbits: u32, _params: &ConsensusParams) -> bool {
        // Regtest: the proof-of-work target is trivially satisfied.
        true
    }
}

impl BlockSink for RegtestChain {
    fn accept(&self, block: Block, _force: bool) -> bool {
        let tip = self.tip_index();
        if block.header.prev_block_hash != tip.hash {
            debug!("rejecting block that does not extend the tip");
            return false;
        }

        let index = Arc::new(BlockIndex {
            height: tip.height.next(),
            hash: block.hash(),
            nbits: block.header.nbits,
            prev: Some(Arc::clone(&tip)),
        });

        // Full validation of the coinbase rules; the lock is not held here
        // because the checks read back through the ChainView seam.
        let mut state = ValidationState::new();
        if !check_lynx_rules(self, &block, &index, &self.consensus, &mut state) {
            debug!(
                "rejecting block {}: {:?}",
                index.hash,
                state.reject_reason()
            );
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.tip.hash != tip.hash {
            // Lost a race against another submitted block.
            return false;
        }
        if let Some(coinbase) = block.coinbase() {
            for output in &coinbase.outputs {
                if let Some(address) = output.script_pubkey.address() {
                    let balance = inner.balances.entry(address).or_insert(Amount::zero());
                    *balance = *balance + output.value;
                }
            }
        }
        inner.blocks.insert(index.hash, block);
        inner.tip = index;
        true
    }
}

/// A wallet issuing scripts for a single address, counting `keep()` commits.
pub struct TestWallet {
    address: Address,
    keeps: Arc<AtomicUsize>,
}

impl TestWallet {
    pub fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            keeps: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn keep_count(&self) -> usize {
        self.keeps.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl WalletSource for TestWallet {
    fn get_script_for_mining(&self) -> Result<ReserveScript, WalletError> {
        let keeps = Arc::clone(&self.keeps);
        Ok(ReserveScript::with_keep(
            Script::pay_to_address(&self.address),
            move || {
                keeps.fetch_add(1, Ordering::SeqCst);
            },
        ))
    }
}

/// A wallet whose key pool is exhausted.
pub struct FailingWallet;

impl WalletSource for FailingWallet {
    fn get_script_for_mining(&self) -> Result<ReserveScript, WalletError> {
        Err(WalletError::KeypoolExhausted)
    }
}

/// Deterministic, well-formed base58 address for a seed.
pub fn test_address(seed: u64) -> Address {
    const CHARS: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    let mut rng = StdRng::seed_from_u64(seed);
    let s: String = (0..30)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect();
    Address::parse(&s).expect("generated address uses only base58 characters")
}

/// A miner context whose every seam is served by the given regtest chain.
pub fn miner_context(
    chain: &Arc<RegtestChain>,
    wallet: Option<Arc<dyn WalletSource>>,
) -> MinerContext {
    MinerContext {
        chain: Arc::clone(chain) as Arc<dyn ChainView>,
        template_source: Arc::clone(chain) as Arc<dyn BlockTemplateSource>,
        pow: Arc::clone(chain) as Arc<dyn PowOracle>,
        block_sink: Arc::clone(chain) as Arc<dyn BlockSink>,
        wallet,
        consensus: chain.consensus(),
    }
}
