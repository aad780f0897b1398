use anyhow::{Result, anyhow};
use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pins the calling thread to `core_id`. Returns the id on success.
pub fn try_pin_core(core_id: usize) -> Result<usize> {
    let ids = get_core_ids().ok_or_else(|| anyhow!("core ids are not available"))?;
    if !ids.iter().any(|c| c.id == core_id) {
        return Err(anyhow!(
            "core {core_id} does not exist ({} cores available)",
            ids.len()
        ));
    }
    if set_for_current(CoreId { id: core_id }) {
        Ok(core_id)
    } else {
        Err(anyhow!("failed to pin current thread to core {core_id}"))
    }
}
