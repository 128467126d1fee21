use std::sync::{Arc, Mutex, OnceLock};

use tracing::info;

#[derive(Debug, Default)]
struct BridgeState {
    initialized: bool,
}

/// Process-wide guard around starting the adb server.
#[derive(Debug, Default)]
pub struct AdbBridge {
    state: Mutex<BridgeState>,
}

static SHARED_BRIDGE: OnceLock<Arc<AdbBridge>> = OnceLock::new();

impl AdbBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<AdbBridge> {
        Arc::clone(SHARED_BRIDGE.get_or_init(|| Arc::new(AdbBridge::new())))
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.initialized)
            .unwrap_or_else(|poisoned| poisoned.into_inner().initialized)
    }

    /// Runs `init` unless an earlier call already succeeded. Concurrent callers wait on the
    /// lock, so `init` never runs twice at once. A failed `init` leaves the bridge
    /// uninitialized for the next caller.
    pub fn ensure_initialized<E>(
        &self,
        init: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.initialized {
            return Ok(());
        }
        init()?;
        state.initialized = true;
        info!("adb bridge initialized");
        Ok(())
    }
}
