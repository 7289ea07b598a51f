use time::{OffsetDateTime, Weekday};

use crate::{BackupConfig, BackupFrequency};

// A monthly schedule always has a hit within 62 days.
const SEARCH_WINDOW_DAYS: u16 = 62;

/// Next instant strictly after `after` at which a scheduled backup is due.
///
/// `diario` fires every day at `hora`, `semanal` on Sundays, `mensual` on the
/// first day of each month. The computation happens in the offset carried by
/// `after`. Returns `None` for an inactive configuration.
#[must_use]
pub fn next_run_after(config: &BackupConfig, after: OffsetDateTime) -> Option<OffsetDateTime> {
    if !config.activo {
        return None;
    }

    let at = config.hora.as_time();
    let mut date = after.date();
    for _ in 0..=SEARCH_WINDOW_DAYS {
        if fires_on(config.frecuencia, date) {
            let candidate = date.with_time(at).assume_offset(after.offset());
            if candidate > after {
                return Some(candidate);
            }
        }
        date = date.next_day()?;
    }

    None
}

fn fires_on(frequency: BackupFrequency, date: time::Date) -> bool {
    match frequency {
        BackupFrequency::Diario => true,
        BackupFrequency::Semanal => date.weekday() == Weekday::Sunday,
        BackupFrequency::Mensual => date.day() == 1,
    }
}
