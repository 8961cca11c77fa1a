//! Flow identifiers and transmit priority levels.

use std::fmt;

/// Identifies a flow, locally or remotely originated. Flow IDs are 64-bit
/// non-negative integers, VLU-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transmit priority, lowest to highest. `SendFlow`s with pending work are
/// queued by priority; a transmit pass drains higher priorities first and
/// round-robins within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Background = 0,
    Bulk = 1,
    Data = 2,
    Routine = 3,
    PriorityLevel = 4,
    Immediate = 5,
    Flash = 6,
    FlashOverride = 7,
}

/// Total number of priority levels; also the size of the Session's priority
/// deque array.
pub const PRIORITY_LEVELS: usize = 8;

impl Priority {
    pub const ALL: [Priority; PRIORITY_LEVELS] = [
        Priority::Background,
        Priority::Bulk,
        Priority::Data,
        Priority::Routine,
        Priority::PriorityLevel,
        Priority::Immediate,
        Priority::Flash,
        Priority::FlashOverride,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as u8 as usize
    }
}

impl TryFrom<u8> for Priority {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Background),
            1 => Ok(Priority::Bulk),
            2 => Ok(Priority::Data),
            3 => Ok(Priority::Routine),
            4 => Ok(Priority::PriorityLevel),
            5 => Ok(Priority::Immediate),
            6 => Ok(Priority::Flash),
            7 => Ok(Priority::FlashOverride),
            other => Err(other),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Routine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_declaration_order() {
        assert!(Priority::Background < Priority::FlashOverride);
        assert!(Priority::Bulk < Priority::Data);
    }

    #[test]
    fn priority_round_trips_through_u8() {
        for p in Priority::ALL {
            assert_eq!(Priority::try_from(p.as_u8()), Ok(p));
        }
        assert_eq!(Priority::try_from(8), Err(8));
    }
}
