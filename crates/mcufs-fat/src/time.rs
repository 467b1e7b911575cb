//! Timestamps for the FAT engine
//!
//! FAT stores creation/modification times on disk; the engine pulls them
//! through a time provider. This one forwards to the [`Clock`] capability
//! the adapter captured at construction.

use core::fmt;
use std::sync::Arc;

use mcufs_core::clock::Clock;

/// FAT's date range starts at 1980 and ends at 2107
const FAT_YEAR_MIN: u16 = 1980;
const FAT_YEAR_MAX: u16 = 2107;

/// [`fatfs::TimeProvider`] over a [`Clock`]
pub struct ClockProvider {
    clock: Arc<dyn Clock>,
}

impl ClockProvider {
    /// Wrap a clock capability
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl fmt::Debug for ClockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockProvider").finish_non_exhaustive()
    }
}

impl fatfs::TimeProvider for ClockProvider {
    fn get_current_date(&self) -> fatfs::Date {
        let now = self.clock.now();
        fatfs::Date::new(
            now.year.clamp(FAT_YEAR_MIN, FAT_YEAR_MAX),
            now.month as u16,
            now.day as u16,
        )
    }

    fn get_current_date_time(&self) -> fatfs::DateTime {
        let now = self.clock.now();
        let date = fatfs::Date::new(
            now.year.clamp(FAT_YEAR_MIN, FAT_YEAR_MAX),
            now.month as u16,
            now.day as u16,
        );
        let time = fatfs::Time::new(now.hour as u16, now.minute as u16, now.second as u16, 0);
        fatfs::DateTime::new(date, time)
    }
}
