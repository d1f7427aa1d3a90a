use crate::error::{P2pError, P2pResult};

/// Tracks whether the peer-to-peer radio is enabled.
/// Starts disabled until the radio reports otherwise.
#[derive(Debug, Default)]
pub struct RadioStateTracker {
    enabled: bool,
}

impl RadioStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state-changed notification. Returns true if the flag flipped.
    pub fn on_radio_state_changed(&mut self, enabled: bool) -> bool {
        let changed = self.enabled != enabled;
        self.enabled = enabled;
        changed
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fail fast instead of issuing a call the radio would reject anyway
    pub fn ensure_enabled(&self) -> P2pResult<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(P2pError::RadioDisabled)
        }
    }
}
