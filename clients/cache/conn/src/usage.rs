//! Connection checkout gate.
//!
//! A connection is handed to at most one owner at a time. The gate is a
//! three-state atomic rather than a bool because transaction-scoped
//! checkouts behave differently from plain ones: a transaction holds its
//! connection across many operations and releases it only when the
//! transaction completes, so transactional acquire is reentrant and
//! transactional release here is a no-op.

use std::sync::atomic::{AtomicU8, Ordering};

/// Checkout state of a connection
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageState {
    /// Available for checkout
    Free = 0,
    /// Checked out by a plain (per-operation) owner
    InUse = 1,
    /// Checked out by a transaction
    InUseForTransaction = 2,
}

impl UsageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => UsageState::InUse,
            2 => UsageState::InUseForTransaction,
            _ => UsageState::Free,
        }
    }
}

/// Lock-free checkout gate over [`UsageState`]
#[derive(Debug, Default)]
pub struct UsageGate(AtomicU8);

impl UsageGate {
    /// New gate in the `Free` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, as a snapshot
    pub fn state(&self) -> UsageState {
        UsageState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempt to acquire (`want_in_use = true`) or release the gate.
    ///
    /// Plain convention (`for_transaction = false`): acquire succeeds only
    /// via a compare-and-set from `Free` to `InUse`; release always resets
    /// to `Free` and succeeds.
    ///
    /// Transactional convention (`for_transaction = true`): acquire fails
    /// against a plain owner, succeeds without a state change when the
    /// transaction already holds the gate, and otherwise compare-and-sets
    /// `Free` to `InUseForTransaction`. Release returns `true` without
    /// touching the state; the transaction completion path frees the gate
    /// through the plain convention.
    pub fn set_and_get_being_used(&self, want_in_use: bool, for_transaction: bool) -> bool {
        if !for_transaction {
            if want_in_use {
                self.0
                    .compare_exchange(
                        UsageState::Free as u8,
                        UsageState::InUse as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            } else {
                self.0.store(UsageState::Free as u8, Ordering::Release);
                true
            }
        } else if want_in_use {
            match self.state() {
                UsageState::InUse => false,
                UsageState::InUseForTransaction => true,
                UsageState::Free => self
                    .0
                    .compare_exchange(
                        UsageState::Free as u8,
                        UsageState::InUseForTransaction as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok(),
            }
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_acquire_release() {
        let gate = UsageGate::new();
        assert!(gate.set_and_get_being_used(true, false));
        assert_eq!(gate.state(), UsageState::InUse);
        // second acquire loses
        assert!(!gate.set_and_get_being_used(true, false));

        assert!(gate.set_and_get_being_used(false, false));
        assert_eq!(gate.state(), UsageState::Free);
        assert!(gate.set_and_get_being_used(true, false));
    }

    #[test]
    fn test_plain_release_is_unconditional() {
        let gate = UsageGate::new();
        assert!(gate.set_and_get_being_used(false, false));
        assert_eq!(gate.state(), UsageState::Free);
    }

    #[test]
    fn test_transactional_acquire_is_reentrant() {
        let gate = UsageGate::new();
        assert!(gate.set_and_get_being_used(true, true));
        assert_eq!(gate.state(), UsageState::InUseForTransaction);
        assert!(gate.set_and_get_being_used(true, true));
        assert_eq!(gate.state(), UsageState::InUseForTransaction);
    }

    #[test]
    fn test_transactional_release_is_deferred() {
        let gate = UsageGate::new();
        assert!(gate.set_and_get_being_used(true, true));
        // no-op release keeps the transaction's hold
        assert!(gate.set_and_get_being_used(false, true));
        assert_eq!(gate.state(), UsageState::InUseForTransaction);
        // transaction completion frees through the plain path
        assert!(gate.set_and_get_being_used(false, false));
        assert_eq!(gate.state(), UsageState::Free);
    }

    #[test]
    fn test_cross_convention_conflicts() {
        let gate = UsageGate::new();
        assert!(gate.set_and_get_being_used(true, false));
        // transaction cannot take a plainly-owned connection
        assert!(!gate.set_and_get_being_used(true, true));
        assert!(gate.set_and_get_being_used(false, false));

        assert!(gate.set_and_get_being_used(true, true));
        // plain owner cannot take a transaction-owned connection
        assert!(!gate.set_and_get_being_used(true, false));
    }
}
