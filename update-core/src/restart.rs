use log::{info, warn};

use crate::session::UpdateState;

/// Device restart trigger, owned by the caller of the session.
pub trait Restart {
    fn restart(&self);
}

/// Restart into the new image if, and only if, the session committed.
/// Returns whether a restart was requested.
pub fn restart_if_committed(state: UpdateState, restart: &dyn Restart) -> bool {
    if state != UpdateState::Committed {
        warn!("OTA: not restarting, update ended {state}");
        return false;
    }
    info!("OTA: update committed, restarting");
    restart.restart();
    true
}
