/// Outcome accumulator for block validation, in the bitcoin style: checks
/// mark the state invalid with a reject reason and a DoS score, and the
/// caller decides what to do with the peer that sent the block.
#[derive(Clone, Debug, Default)]
pub struct ValidationState {
    invalid: bool,
    dos_level: u32,
    reject_reason: Option<String>,
}

impl ValidationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the state invalid with the given misbehavior score. Returns
    /// `false` so checks can `return state.dos(...)` directly.
    pub fn dos(&mut self, level: u32, reject_reason: &str) -> bool {
        self.invalid = true;
        self.dos_level += level;
        self.reject_reason = Some(reject_reason.to_string());
        false
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    pub fn dos_level(&self) -> u32 {
        self.dos_level
    }

    pub fn reject_reason(&self) -> Option<&str> {
        self.reject_reason.as_deref()
    }
}
