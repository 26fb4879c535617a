//! Process-wide exclusive use of a line.
//!
//! A scan and a live capture must never read the same line at the same time;
//! both take a [`LineLease`] first.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

static HELD: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("line {0} is already in use by a scan or capture")]
    Busy(String),
}

/// Released on drop.
#[derive(Debug)]
pub struct LineLease {
    line: String,
}

impl LineLease {
    pub fn acquire(line: &str) -> Result<Self, LeaseError> {
        let mut held = HELD.lock();
        if !held.insert(line.to_string()) {
            return Err(LeaseError::Busy(line.to_string()));
        }
        log::debug!("lease on {line} acquired");
        Ok(Self {
            line: line.to_string(),
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn is_held(line: &str) -> bool {
        HELD.lock().contains(line)
    }
}

impl Drop for LineLease {
    fn drop(&mut self) {
        HELD.lock().remove(&self.line);
        log::debug!("lease on {} released", self.line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let first = LineLease::acquire("lease-test-line").unwrap();
        assert!(LineLease::is_held("lease-test-line"));
        assert_eq!(
            LineLease::acquire("lease-test-line").unwrap_err(),
            LeaseError::Busy("lease-test-line".into())
        );
        let other = LineLease::acquire("lease-test-other").unwrap();
        assert_eq!(other.line(), "lease-test-other");

        drop(first);
        assert!(!LineLease::is_held("lease-test-line"));
        assert!(LineLease::acquire("lease-test-line").is_ok());
    }
}
