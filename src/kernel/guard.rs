//! Purity guard for detector-class runes.
//!
//! Handlers consult the ambient network toggles before doing any outbound
//! I/O. While a [`PurityGuard`] is alive the toggles read as cleared; when
//! the guard drops, on any exit path including unwinding, the previous
//! toggles are back in effect.
//!
//! Guards nest and may be held from several threads at once: suppression
//! is a depth counter over an untouched base configuration.

use std::sync::{Mutex, MutexGuard};

/// Outbound-network switches visible to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkToggles {
    /// Whether handlers may open outbound connections.
    pub outbound: bool,
    /// Proxy handlers should route through, if any.
    pub proxy: Option<String>,
}

impl NetworkToggles {
    /// Everything off.
    pub const CLEARED: Self = Self {
        outbound: false,
        proxy: None,
    };
}

#[derive(Debug)]
struct AmbientState {
    base: NetworkToggles,
    suppressed: u32,
}

/// Ambient network context.
#[derive(Debug)]
pub struct AmbientNetwork {
    state: Mutex<AmbientState>,
}

impl AmbientNetwork {
    /// Context with the given base toggles.
    pub const fn new(base: NetworkToggles) -> Self {
        Self {
            state: Mutex::new(AmbientState {
                base,
                suppressed: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AmbientState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Toggles currently in effect.
    pub fn current(&self) -> NetworkToggles {
        let state = self.lock();
        if state.suppressed > 0 {
            NetworkToggles::CLEARED
        } else {
            state.base.clone()
        }
    }

    /// Replace the base toggles (process configuration, not handlers).
    pub fn configure(&self, base: NetworkToggles) {
        self.lock().base = base;
    }

    /// Snapshot the toggles and clear them until the guard drops.
    pub fn guard(&self) -> PurityGuard<'_> {
        let mut state = self.lock();
        let snapshot = if state.suppressed > 0 {
            NetworkToggles::CLEARED
        } else {
            state.base.clone()
        };
        state.suppressed = state.suppressed.saturating_add(1);
        PurityGuard {
            ambient: self,
            snapshot,
        }
    }
}

/// Scoped suppression of ambient network access.
#[derive(Debug)]
pub struct PurityGuard<'a> {
    ambient: &'a AmbientNetwork,
    snapshot: NetworkToggles,
}

impl PurityGuard<'_> {
    /// Toggles that were in effect when the guard was acquired.
    pub fn snapshot(&self) -> &NetworkToggles {
        &self.snapshot
    }
}

impl Drop for PurityGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.ambient.lock();
        state.suppressed = state.suppressed.saturating_sub(1);
    }
}

static AMBIENT: AmbientNetwork = AmbientNetwork::new(NetworkToggles {
    outbound: true,
    proxy: None,
});

/// The process-wide ambient network context.
pub fn ambient() -> &'static AmbientNetwork {
    &AMBIENT
}

/// Whether handlers may currently make outbound calls.
pub fn outbound_allowed() -> bool {
    AMBIENT.current().outbound
}

/// Acquire a guard on the process-wide context.
pub fn acquire() -> PurityGuard<'static> {
    AMBIENT.guard()
}
