use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::protocol::consensus::transaction::Script;

type KeepFn = Box<dyn Fn() + Send + Sync>;

/// A coinbase script tentatively reserved for a mining attempt.
///
/// Wallet-issued scripts carry a notifier that commits the underlying key
/// once a block paying to it is accepted; until then the key can be returned
/// to the pool. Scripts built from configured candidate addresses have
/// nothing to commit.
pub struct ReserveScript {
    script: Script,
    keep: Option<KeepFn>,
    kept: AtomicBool,
}

impl ReserveScript {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            keep: None,
            kept: AtomicBool::new(false),
        }
    }

    pub fn with_keep(script: Script, keep: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            script,
            keep: Some(Box::new(keep)),
            kept: AtomicBool::new(false),
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Commit the reserved key. At most one call has an effect, no matter
    /// how many blocks end up paying to the same script.
    pub fn keep(&self) {
        if !self.kept.swap(true, Ordering::AcqRel) {
            if let Some(keep) = &self.keep {
                keep();
            }
        }
    }
}

impl fmt::Debug for ReserveScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReserveScript")
            .field("script", &self.script)
            .field("kept", &self.kept.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("keypool ran out, please refill the keypool first")]
    KeypoolExhausted,
    #[error("wallet is unavailable: {0}")]
    Unavailable(String),
}

/// Issues reserve scripts for coinbase payouts.
pub trait WalletSource: Send + Sync {
    fn get_script_for_mining(&self) -> Result<ReserveScript, WalletError>;
}
