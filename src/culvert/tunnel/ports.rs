use std::{
    collections::BTreeSet,
    sync::{Mutex, PoisonError},
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortGrantError {
    #[error("port {0} is outside the allowed range")]
    NotAllowed(u16),
    #[error("port {0} is already reserved")]
    Taken(u16),
    #[error("no free ports left in the allowed range")]
    Exhausted,
}

/// Process-wide reservation table for public ports.
///
/// Holds at most one reservation per port. The lock guards pure set
/// operations only; callers bind the listener after `reserve` returns and
/// call `release` if the bind fails, so the lock is never held across I/O.
#[derive(Debug)]
pub struct PortTable {
    min: u16,
    max: u16,
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortTable {
    /// `min <= max` is the caller's contract, validated at server construction.
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Reserve `requested`, or the lowest free port in range when
    /// `requested` is 0.
    pub fn reserve(&self, requested: u16) -> Result<u16, PortGrantError> {
        if requested == 0 {
            return self.reserve_from(self.min);
        }
        if requested < self.min || requested > self.max {
            return Err(PortGrantError::NotAllowed(requested));
        }
        let mut reserved = self.lock();
        if !reserved.insert(requested) {
            return Err(PortGrantError::Taken(requested));
        }
        Ok(requested)
    }

    /// Reserve the lowest free port at or above `floor`. Used on the retry
    /// path when an auto-assigned port turned out to be unbindable.
    pub fn reserve_from(&self, floor: u16) -> Result<u16, PortGrantError> {
        let floor = floor.max(self.min);
        let mut reserved = self.lock();
        for port in floor..=self.max {
            if reserved.insert(port) {
                return Ok(port);
            }
        }
        Err(PortGrantError::Exhausted)
    }

    /// Drop a reservation. Returns false if the port was not reserved.
    pub fn release(&self, port: u16) -> bool {
        self.lock().remove(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // Set ops cannot leave the table inconsistent, so a poisoned lock
        // is safe to take over.
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_assign_picks_lowest_free() {
        let table = PortTable::new(35100, 35109);

        assert_eq!(table.reserve(0), Ok(35100));
        assert_eq!(table.reserve(0), Ok(35101));

        table.release(35100);
        assert_eq!(table.reserve(0), Ok(35100));
    }

    #[test]
    fn explicit_port_must_be_in_range() {
        let table = PortTable::new(35100, 35109);

        assert_eq!(table.reserve(35099), Err(PortGrantError::NotAllowed(35099)));
        assert_eq!(table.reserve(35110), Err(PortGrantError::NotAllowed(35110)));
        assert_eq!(table.reserve(35109), Ok(35109));
    }

    #[test]
    fn explicit_port_already_taken() {
        let table = PortTable::new(35100, 35109);

        assert_eq!(table.reserve(35105), Ok(35105));
        assert_eq!(table.reserve(35105), Err(PortGrantError::Taken(35105)));

        // Auto-assignment walks around the hole.
        assert_eq!(table.reserve(0), Ok(35100));
        assert_eq!(table.reserve_from(35105), Ok(35106));
    }

    #[test]
    fn exhaustion_and_release() {
        let table = PortTable::new(35100, 35101);

        assert_eq!(table.reserve(0), Ok(35100));
        assert_eq!(table.reserve(0), Ok(35101));
        assert_eq!(table.reserve(0), Err(PortGrantError::Exhausted));

        assert!(table.release(35100));
        assert_eq!(table.reserve(0), Ok(35100));
    }

    #[test]
    fn release_unknown_port_is_noop() {
        let table = PortTable::new(35100, 35101);
        assert!(!table.release(35100));
        assert_eq!(table.reserved_count(), 0);
    }

    #[test]
    fn single_port_range() {
        let table = PortTable::new(35100, 35100);
        assert_eq!(table.reserve(0), Ok(35100));
        assert_eq!(table.reserve(0), Err(PortGrantError::Exhausted));
    }
}
