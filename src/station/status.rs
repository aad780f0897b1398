use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Station-level condition for one evaluated step. Flags combine; a code
    /// of zero is NORMAL.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventStatus: u32 {
        const UNINITIALIZED = 1 << 0;
        const OUTLIER_DETECTED = 1 << 1;
        const POSSIBLE_EVENT = 1 << 2;
        const EVENT_TIMEOUT = 1 << 3;
        const EVENT_IDENTIFIED = 1 << 4;
        const DATA_MISSING = 1 << 5;
        const CHANNELS_ALARMING = 1 << 6;
        const STATION_CALIBRATING = 1 << 7;
    }
}

impl EventStatus {
    pub const NORMAL: EventStatus = EventStatus::empty();

    #[inline]
    pub fn code(&self) -> u32 {
        self.bits()
    }

    /// Parses a combined status code, ignoring unknown bits.
    #[inline]
    pub fn from_code(code: u32) -> Self {
        Self::from_bits_truncate(code)
    }

    /// NORMAL, optionally with alarming channels: nothing off baseline.
    #[inline]
    pub fn is_quiet(&self) -> bool {
        EventStatus::CHANNELS_ALARMING.contains(*self)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NORMAL");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

bitflags! {
    /// Per-channel data quality for one step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataStatus: u32 {
        const MISSING = 1 << 0;
        const OUT_OF_RANGE = 1 << 1;
        const LIMIT_VIOLATION = 1 << 2;
        const ALARM = 1 << 3;
        const CALIBRATING = 1 << 4;
    }
}

impl DataStatus {
    pub const NORMAL: DataStatus = DataStatus::empty();
}
