//! Process-wide connection manager
//!
//! The composition root installs one manager at startup; feature code that
//! cannot be handed a reference reaches it through [`manager`].

use crate::connection::ConnectionManager;
use std::sync::OnceLock;

static MANAGER: OnceLock<ConnectionManager> = OnceLock::new();

/// Install the process-wide manager.
///
/// Only the first call wins; later calls get their manager back.
pub fn install(manager: ConnectionManager) -> Result<(), ConnectionManager> {
    MANAGER.set(manager)
}

/// The installed manager, if any
pub fn manager() -> Option<&'static ConnectionManager> {
    MANAGER.get()
}
