use std::collections::BTreeMap;

use crate::{virtual_date, CheckEntry, CheckId, DayKey, EngineConfig, LedgerError};

/// Outcome of folding raw check-ins into one record per virtual day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResolution {
    pub kept: BTreeMap<DayKey, CheckEntry>,
    pub discarded: Vec<CheckId>,
}

/// Fold check-ins by virtual day, keeping one per day.
///
/// On collision the existing record stays unless the incoming one is saved and the
/// existing one is a placeholder. Among saved records the first one seen wins.
///
/// # Errors
/// Returns [`LedgerError::Time`] when a timestamp cannot be mapped to a day.
pub fn partition_checks(
    raw: &[CheckEntry],
    config: &EngineConfig,
) -> Result<CheckResolution, LedgerError> {
    let mut resolution = CheckResolution::default();

    for incoming in raw {
        let day = virtual_date(incoming.timestamp_ms, config)?;
        match resolution.kept.get_mut(&day) {
            None => {
                resolution.kept.insert(day, incoming.clone());
            }
            Some(existing) if incoming.is_saved && !existing.is_saved => {
                let replaced = std::mem::replace(existing, incoming.clone());
                resolution.discarded.push(replaced.id);
            }
            Some(_) => resolution.discarded.push(incoming.id),
        }
    }

    Ok(resolution)
}

/// One check-in per virtual day, ordered by day.
///
/// # Errors
/// Returns [`LedgerError::Time`] when a timestamp cannot be mapped to a day.
pub fn resolve_checks(
    raw: &[CheckEntry],
    config: &EngineConfig,
) -> Result<Vec<CheckEntry>, LedgerError> {
    Ok(partition_checks(raw, config)?.kept.into_values().collect())
}
