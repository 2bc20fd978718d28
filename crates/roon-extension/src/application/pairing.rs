//! Pairing state machine.
//!
//! An extension may be connected to several Cores at once but is *paired* with
//! at most one.  The machine decides which, and reports what the caller must
//! do as a list of [`PairingEffect`]s.  It performs no I/O itself.
//!
//! ```text
//!              found(core) while unpaired
//!  Unpaired ──────────────────────────────► Paired(core_id)
//!                                             │   ▲
//!                          lost(paired core)  │   │ found(paired core)
//!                                             ▼   │
//!                                      Paired(core_id), not live
//! ```
//!
//! Losing the paired Core keeps its id: when it comes back it is paired again
//! without any other Core being able to claim it.  Only an explicit `pair`
//! request from another Core moves the pairing.

use crate::domain::RemoteCore;

/// Work the caller has to carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEffect {
    /// Write the new `paired_core_id` to the state store.
    Persist,
    /// Push `Changed {paired_core_id}` to every pairing subscriber.
    Broadcast(String),
    /// The paired Core is live.
    Paired(RemoteCore),
    /// The paired Core went away or was replaced.
    Unpaired(RemoteCore),
}

/// Tracks the paired Core id and whether it is currently connected.
#[derive(Debug, Default)]
pub struct PairingMachine {
    paired_core_id: Option<String>,
    is_paired: bool,
}

impl PairingMachine {
    /// Starts from the persisted `paired_core_id`, not yet live.
    pub fn new(persisted: Option<String>) -> Self {
        Self {
            paired_core_id: persisted,
            is_paired: false,
        }
    }

    pub fn paired_core_id(&self) -> Option<&str> {
        self.paired_core_id.as_deref()
    }

    /// True while a registered connection from the paired Core exists.
    pub fn is_paired(&self) -> bool {
        self.is_paired
    }

    /// A Core finished registration.
    pub fn found(&mut self, core: &RemoteCore) -> Vec<PairingEffect> {
        let mut effects = Vec::new();
        if self.paired_core_id.is_none() {
            self.paired_core_id = Some(core.core_id.clone());
            effects.push(PairingEffect::Persist);
            effects.push(PairingEffect::Broadcast(core.core_id.clone()));
        }
        if self.paired_core_id.as_deref() == Some(core.core_id.as_str()) {
            self.is_paired = true;
            effects.push(PairingEffect::Paired(core.clone()));
        }
        effects
    }

    /// A registered Core's connection closed.
    pub fn lost(&mut self, core: &RemoteCore) -> Vec<PairingEffect> {
        if self.paired_core_id.as_deref() != Some(core.core_id.as_str()) {
            return Vec::new();
        }
        self.is_paired = false;
        vec![PairingEffect::Unpaired(core.clone())]
    }

    /// `core` asked to become the paired Core.  `previous` is the live
    /// connection of the currently paired Core, if any.
    ///
    /// Asking again from the Core that is already paired changes nothing.
    pub fn pair(&mut self, core: &RemoteCore, previous: Option<&RemoteCore>) -> Vec<PairingEffect> {
        if self.paired_core_id.as_deref() == Some(core.core_id.as_str()) {
            return Vec::new();
        }
        let mut effects = match previous {
            Some(old) => self.lost(old),
            None => Vec::new(),
        };
        self.paired_core_id = None;
        self.is_paired = false;
        effects.extend(self.found(core));
        effects
    }
}
