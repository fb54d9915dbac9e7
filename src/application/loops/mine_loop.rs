//! The built-in miner.
//!
//! A long-lived controller owns a [`CpuLimiter`] and a set of worker
//! threads. Each worker repeatedly resolves a coinbase script, fetches a
//! block template, and iterates nonces against the proof-of-work oracle,
//! yielding to the limiter between attempts. A telemetry thread reports the
//! aggregate hash rate.
//!
//! The final check inside a worker runs rule 3 only: rules 1 and 2 are
//! enforced again by the full validation pipeline when the solved block is
//! submitted, so checking them per candidate here would be wasted work.

pub(crate) mod coinbase_selector;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use itertools::Itertools;
use tracing::debug;
use tracing::info;
use tracing::warn;

use coinbase_selector::CachedScript;
use coinbase_selector::CoinbaseSelector;

use crate::application::config::cli_args::Args;
use crate::application::cpu_limiter::CpuLimiter;
use crate::application::cpu_limiter::InvalidLimit;
use crate::protocol::consensus::block::block_height::BlockHeight;
use crate::protocol::consensus::block::block_index::BlockIndex;
use crate::protocol::consensus::block::Block;
use crate::protocol::consensus::lynx_rules::check_rule3;
use crate::protocol::consensus::pow::PowOracle;
use crate::protocol::consensus::ConsensusParams;
use crate::state::chain::BlockSink;
use crate::state::chain::BlockTemplateSource;
use crate::state::chain::ChainView;
use crate::state::wallet::ReserveScript;
use crate::state::wallet::WalletSource;

/// Upper bound of the inner nonce loop. Bounds worker unresponsiveness
/// between template refreshes: at least one tip check per 65536 attempts.
const INNER_LOOP_COUNT: u32 = 0x10000;

/// Poll granularity of every worker wait, so `stop()` latency is bounded.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// How long a worker backs off after failing to resolve a reward script.
const NO_ADDRESS_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Hash-rate reporting period of the telemetry thread.
const HASH_RATE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Pause between worker spawns, so each worker starts from a template with
/// a distinct block-header timestamp.
const WORKER_SPAWN_STAGGER: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum MinerError {
    #[error("Unable to start the built-in miner: the built-in miner is active")]
    AlreadyRunning,

    #[error("Unable to update built-in miner settings: the built-in miner is active")]
    MinerBusy,

    #[error("Unable to start the built-in miner: wallet is disabled and no miner address is configured")]
    NoWallet,

    #[error(transparent)]
    InvalidLimit(#[from] InvalidLimit),

    #[error("failed to spawn miner thread")]
    Spawn(#[source] std::io::Error),
}

/// Everything the miner consumes from the rest of the node.
#[derive(Clone)]
pub struct MinerContext {
    pub chain: Arc<dyn ChainView>,
    pub template_source: Arc<dyn BlockTemplateSource>,
    pub pow: Arc<dyn PowOracle>,
    pub block_sink: Arc<dyn BlockSink>,
    pub wallet: Option<Arc<dyn WalletSource>>,
    pub consensus: Arc<ConsensusParams>,
}

/// Mutable miner settings; changeable only while stopped.
#[derive(Clone, Debug)]
struct MinerSettings {
    cpu_limit: f64,
    check_sync_chain: bool,
    miner_addresses: Vec<String>,
    conf: Option<PathBuf>,
    worker_threads: Option<usize>,
}

impl Default for MinerSettings {
    fn default() -> Self {
        Self {
            cpu_limit: crate::application::config::cli_args::DEFAULT_CPU_LIMIT_FOR_BUILTIN_MINER,
            check_sync_chain: true,
            miner_addresses: Vec::new(),
            conf: None,
            worker_threads: None,
        }
    }
}

struct MinerState {
    settings: MinerSettings,
    running: bool,
    workers: Vec<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
    limiter: Option<Arc<CpuLimiter>>,
}

/// The built-in miner controller.
///
/// All mutable state sits behind one mutex; the worker-visible `running`
/// flag and the hash counter are atomics so the hot loop never takes it.
pub struct BuiltinMiner {
    ctx: MinerContext,
    state: Mutex<MinerState>,
    running: Arc<AtomicBool>,
    hash_counter: Arc<AtomicU64>,
}

impl BuiltinMiner {
    pub fn new(ctx: MinerContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(MinerState {
                settings: MinerSettings::default(),
                running: false,
                workers: Vec::new(),
                telemetry: None,
                limiter: None,
            }),
            running: Arc::new(AtomicBool::new(false)),
            hash_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wire up the miner from command-line options and start it unless
    /// disabled. Returns the (possibly unstarted) miner.
    pub fn app_init(ctx: MinerContext, args: &Args) -> anyhow::Result<Arc<Self>> {
        let miner = Arc::new(Self::new(ctx));

        if args.disable_builtin_miner {
            info!("BuiltinMiner disabled!");
            return Ok(miner);
        }

        let addresses = parse_address_list(args.miner_address.as_deref().unwrap_or(""));
        if miner.ctx.wallet.is_none() && addresses.is_empty() {
            info!("BuiltinMiner is disabled: the wallet is disabled and no miner address is configured");
            return Ok(miner);
        }

        if args.disable_check_sync_chain {
            miner
                .set_check_sync_chain_flag(false)
                .expect("miner has not been started yet");
        }
        miner
            .set_miner_addresses(addresses)
            .expect("miner has not been started yet");
        miner
            .set_conf_path(args.conf.clone())
            .expect("miner has not been started yet");
        miner
            .set_worker_threads(args.miner_threads)
            .expect("miner has not been started yet");

        if miner.set_cpu_limit(args.cpu_limit_for_builtin_miner).is_err() {
            bail!("--cpu-limit-for-builtin-miner is invalid");
        }

        miner.start()?;
        Ok(miner)
    }

    /// Start mining. Fails when already running, or when neither a wallet
    /// nor candidate addresses are available.
    pub fn start(&self) -> Result<(), MinerError> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(MinerError::AlreadyRunning);
            }
            if self.ctx.wallet.is_none() && state.settings.miner_addresses.is_empty() {
                return Err(MinerError::NoWallet);
            }
            self.do_start(&mut state)
        };

        match result {
            Ok(()) => {
                info!("BuiltinMiner started");
                Ok(())
            }
            Err(err) => {
                // Unwind whatever part of the worker fleet came up.
                self.stop();
                Err(err)
            }
        }
    }

    fn do_start(&self, state: &mut MinerState) -> Result<(), MinerError> {
        let limiter = Arc::new(CpuLimiter::new(state.settings.cpu_limit)?);
        let selector = Arc::new(CoinbaseSelector::new(
            Arc::clone(&self.ctx.chain),
            Arc::clone(&self.ctx.consensus),
            self.ctx.wallet.clone(),
            state.settings.miner_addresses.clone(),
            state.settings.conf.clone(),
        ));

        self.hash_counter.store(0, Ordering::Release);
        self.running.store(true, Ordering::Release);
        state.running = true;

        let worker_count = state
            .settings
            .worker_threads
            .unwrap_or_else(CpuLimiter::cpu_count)
            .max(1);
        for i in 0..worker_count {
            if i > 0 {
                thread::sleep(WORKER_SPAWN_STAGGER);
            }
            let worker = WorkerContext {
                ctx: self.ctx.clone(),
                running: Arc::clone(&self.running),
                hash_counter: Arc::clone(&self.hash_counter),
                limiter: Arc::clone(&limiter),
                selector: Arc::clone(&selector),
                check_sync_chain: state.settings.check_sync_chain,
            };
            let handle = thread::Builder::new()
                .name(format!("miner-worker-{i}"))
                .spawn(move || generate_blocks(worker))
                .map_err(MinerError::Spawn)?;
            limiter.add(&handle);
            state.workers.push(handle);
        }

        let telemetry_running = Arc::clone(&self.running);
        let telemetry_counter = Arc::clone(&self.hash_counter);
        let telemetry = thread::Builder::new()
            .name("miner-telemetry".to_string())
            .spawn(move || report_hash_rate(&telemetry_running, &telemetry_counter))
            .map_err(MinerError::Spawn)?;

        state.telemetry = Some(telemetry);
        state.limiter = Some(limiter);
        Ok(())
    }

    /// Stop mining and join every thread the miner spawned. Idempotent;
    /// returns only after all workers have exited.
    pub fn stop(&self) {
        let (limiter, workers, telemetry, was_running) = {
            let mut state = self.state.lock().unwrap();
            self.running.store(false, Ordering::Release);
            let was_running = state.running;
            state.running = false;
            (
                state.limiter.take(),
                std::mem::take(&mut state.workers),
                state.telemetry.take(),
                was_running,
            )
        };

        // Joins happen outside the state mutex so a caller blocked on the
        // public API cannot deadlock the shutdown.
        if let Some(limiter) = &limiter {
            limiter.stop();
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("a miner worker thread panicked");
            }
        }
        if let Some(telemetry) = telemetry {
            if telemetry.join().is_err() {
                warn!("the miner telemetry thread panicked");
            }
        }
        drop(limiter);

        if was_running {
            info!("BuiltinMiner stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn set_cpu_limit(&self, limit: f64) -> Result<(), MinerError> {
        let mut state = self.state.lock().unwrap();
        if !(0.0..=1.0).contains(&limit) {
            return Err(MinerError::InvalidLimit(InvalidLimit(limit)));
        }
        if state.running {
            return Err(MinerError::MinerBusy);
        }
        state.settings.cpu_limit = limit;
        info!("A new cpu limit value for BuiltinMiner has been set: {limit:.2}");
        Ok(())
    }

    pub fn cpu_limit(&self) -> f64 {
        self.state.lock().unwrap().settings.cpu_limit
    }

    pub fn set_check_sync_chain_flag(&self, flag: bool) -> Result<(), MinerError> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(MinerError::MinerBusy);
        }
        if state.settings.check_sync_chain == flag {
            return Ok(());
        }
        state.settings.check_sync_chain = flag;
        if flag {
            info!("Mining without network synchronization is prohibited");
        } else {
            info!("Mining without network synchronization is allowed");
        }
        Ok(())
    }

    pub fn check_sync_chain_flag(&self) -> bool {
        self.state.lock().unwrap().settings.check_sync_chain
    }

    pub fn set_miner_addresses(&self, addresses: Vec<String>) -> Result<(), MinerError> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(MinerError::MinerBusy);
        }
        state.settings.miner_addresses = addresses;
        Ok(())
    }

    pub fn set_conf_path(&self, conf: Option<PathBuf>) -> Result<(), MinerError> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(MinerError::MinerBusy);
        }
        state.settings.conf = conf;
        Ok(())
    }

    pub fn set_worker_threads(&self, worker_threads: Option<usize>) -> Result<(), MinerError> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(MinerError::MinerBusy);
        }
        state.settings.worker_threads = worker_threads;
        Ok(())
    }
}

impl Drop for BuiltinMiner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Split a configured address list on commas, tabs and spaces.
fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split([',', '\t', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect_vec()
}

#[derive(Clone)]
struct WorkerContext {
    ctx: MinerContext,
    running: Arc<AtomicBool>,
    hash_counter: Arc<AtomicU64>,
    limiter: Arc<CpuLimiter>,
    selector: Arc<CoinbaseSelector>,
    check_sync_chain: bool,
}

impl WorkerContext {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// The worker main loop.
fn generate_blocks(worker: WorkerContext) {
    wait_for_sync_chain(&worker);

    let mut cached = CachedScript::default();
    while worker.is_running() {
        worker.limiter.suspend_me();

        let Some(script) = worker
            .selector
            .get_script_for_mining(&mut cached, &worker.running)
        else {
            if worker.is_running() {
                info!("BuiltinMiner: no appropriate address for mining; sleeping for 30 seconds");
                sleep_while_running(&worker.running, NO_ADDRESS_RETRY_DELAY);
            }
            continue;
        };

        generate_block(&worker, &script, cached.height);
    }
}

/// Wait out the initial block download, unless that gate is disabled.
fn wait_for_sync_chain(worker: &WorkerContext) {
    if !worker.check_sync_chain {
        return;
    }
    while worker.is_running() && worker.ctx.chain.is_initial_block_download() {
        thread::sleep(SHUTDOWN_POLL);
    }
}

/// One template's worth of mining: fetch a candidate, bump the extranonce,
/// then iterate nonces until the template is exhausted, the miner stops, or
/// a block is found and submitted.
fn generate_block(worker: &WorkerContext, script: &Arc<ReserveScript>, height: Option<BlockHeight>) {
    let Some(template) = worker.ctx.template_source.create_new_block(script.script()) else {
        debug!("no block template available; retrying");
        return;
    };
    let mut block = template.block;

    {
        // Tip read and extranonce bump, briefly under the chain view only.
        let tip = worker.ctx.chain.tip();
        let mut extra_nonce = 0;
        increment_extra_nonce(&mut block, tip.as_deref(), &mut extra_nonce);
    }

    let next_height = height.map_or(BlockHeight::genesis(), |h| h.next());
    while worker.is_running() && block.header.nonce < INNER_LOOP_COUNT {
        worker.hash_counter.fetch_add(1, Ordering::AcqRel);

        let is_valid_block = worker
            .ctx
            .pow
            .check(&block.pow_hash(), block.header.nbits, &worker.ctx.consensus)
            && check_rule3(&block, next_height, &worker.ctx.consensus, true);
        if is_valid_block {
            info!(
                "BuiltinMiner: candidate block {} found at height {next_height}",
                block.hash()
            );
            if worker.ctx.block_sink.accept(block, true) {
                script.keep();
            }
            return;
        }

        worker.limiter.suspend_me();
        block.header.nonce += 1;
    }
}

/// Rewrite the coinbase input script with the next height and a fresh
/// extranonce, and refresh the header merkle root.
fn increment_extra_nonce(block: &mut Block, tip: Option<&BlockIndex>, extra_nonce: &mut u32) {
    *extra_nonce += 1;
    let height = tip.map_or(BlockHeight::genesis(), |tip| tip.height.next());

    if let Some(coinbase) = block.transactions.first_mut() {
        if let Some(input) = coinbase.inputs.first_mut() {
            let mut script_sig = Vec::with_capacity(12);
            script_sig.extend_from_slice(&height.value().to_le_bytes());
            script_sig.extend_from_slice(&extra_nonce.to_le_bytes());
            input.script_sig = script_sig;
        }
    }
    block.update_merkle_root();
}

/// Telemetry loop: report the aggregate hash rate every few seconds.
fn report_hash_rate(running: &AtomicBool, hash_counter: &AtomicU64) {
    let mut last_report = Instant::now();
    while running.load(Ordering::Acquire) {
        thread::sleep(SHUTDOWN_POLL);
        let elapsed = last_report.elapsed();
        if elapsed >= HASH_RATE_REPORT_INTERVAL {
            let hashes = hash_counter.swap(0, Ordering::AcqRel);
            info!(
                "BuiltinMiner: speed {:.0} H/s",
                hashes as f64 / elapsed.as_secs_f64()
            );
            last_report = Instant::now();
        }
    }
}

fn sleep_while_running(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::Acquire) && Instant::now() < deadline {
        thread::sleep(SHUTDOWN_POLL);
    }
}
