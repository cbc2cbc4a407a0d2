// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stability tags: compatibility markers that flow with an object in the
//! wire format (`spec.md` §3, §GLOSSARY), grounded in
//! `original_source/binderlib/base/Stability.c`.

use crate::error::StatusCode;

/// Stability level, encoded as a bitmask so that "is at least this stable"
/// can be checked with a bitwise AND, matching the original's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Stability {
    Undeclared = 0,
    Vendor = 0b0000_0011,
    System = 0b0000_1100,
    Vintf = 0b0011_1111,
}

impl Stability {
    pub fn from_repr(v: i16) -> Option<Stability> {
        match v {
            0 => Some(Stability::Undeclared),
            0b0000_0011 => Some(Stability::Vendor),
            0b0000_1100 => Some(Stability::System),
            0b0011_1111 => Some(Stability::Vintf),
            _ => None,
        }
    }

    pub fn repr(self) -> i16 {
        self as i16
    }

    /// The stability level assigned to objects created by this compilation
    /// unit. A fixed constant in this build, mirroring `getLocalLevel()`
    /// (which NuttX/Vela hardcodes to `STABILITY_SYSTEM` for the system
    /// image this runtime targets).
    pub fn default_for_context() -> Stability {
        Stability::System
    }

    fn is_declared(self) -> bool {
        matches!(
            self,
            Stability::Vendor | Stability::System | Stability::Vintf
        )
    }

    /// Checks whether `self` satisfies the stability `required` by a
    /// caller, i.e. `self` is at least as restrictive/compatible as
    /// `required`.
    pub fn satisfies(self, required: Stability) -> bool {
        (self.repr() & required.repr()) == required.repr() && self.is_declared()
    }

    /// Mirrors `Stability_setRepr`: validates a transition from `current`
    /// to `self`, optionally allowing a downgrade.
    pub fn validate_transition(
        current: Stability,
        setting: Stability,
        allow_downgrade: bool,
    ) -> Result<(), StatusCode> {
        if current == setting {
            return Ok(());
        }
        let has_already_been_set = current != Stability::Undeclared;
        let is_allowed_downgrade = allow_downgrade && current.satisfies(setting);
        if has_already_been_set && !is_allowed_downgrade {
            return Err(StatusCode::BadType);
        }
        Ok(())
    }
}

impl Default for Stability {
    fn default() -> Self {
        Stability::Undeclared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vintf_satisfies_every_declared_level() {
        assert!(Stability::Vintf.satisfies(Stability::Vendor));
        assert!(Stability::Vintf.satisfies(Stability::System));
        assert!(Stability::Vintf.satisfies(Stability::Vintf));
    }

    #[test]
    fn vendor_does_not_satisfy_system() {
        assert!(!Stability::Vendor.satisfies(Stability::System));
    }

    #[test]
    fn transition_from_undeclared_always_allowed() {
        assert!(Stability::validate_transition(Stability::Undeclared, Stability::System, false).is_ok());
    }

    #[test]
    fn transition_between_declared_levels_rejected_without_downgrade() {
        assert_eq!(
            Stability::validate_transition(Stability::System, Stability::Vendor, false),
            Err(StatusCode::BadType)
        );
    }

    #[test]
    fn allowed_downgrade_succeeds() {
        assert!(Stability::validate_transition(Stability::Vintf, Stability::System, true).is_ok());
    }
}
