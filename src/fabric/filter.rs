// src/fabric/filter.rs
//! Stateless send filter
//!
//! A single ordered rule list evaluated on every send: the first rule whose
//! source and destination patterns both match decides accept or reject, and
//! an empty or non-matching table accepts. Rule positions are 1-based in the
//! guest-facing interface.

use alloc::vec::Vec;

use crate::abi::{Address, TablesRule, DOMID_ANY, PORT_ANY};
use crate::errors::Result;
use crate::sync::{LockRank, RankedRwLock};

/// One accept/reject rule over `(src, dst)` address patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterRule {
    /// Whether matching traffic is allowed through.
    pub accept: bool,
    /// Sender pattern; domain and/or port may be wildcards.
    pub src: Address,
    /// Destination pattern; domain and/or port may be wildcards.
    pub dst: Address,
}

impl FilterRule {
    /// Decode the guest representation.
    #[must_use]
    pub fn from_wire(rule: &TablesRule) -> Self {
        Self { accept: rule.accept != 0, src: rule.src, dst: rule.dst }
    }

    /// Encode for the guest.
    #[must_use]
    pub fn to_wire(&self) -> TablesRule {
        TablesRule { src: self.src, dst: self.dst, accept: u32::from(self.accept) }
    }

    fn matches(&self, src: &Address, dst: &Address) -> bool {
        (self.src.domain == DOMID_ANY || self.src.domain == src.domain)
            && (self.src.port == PORT_ANY || self.src.port == src.port)
            && (self.dst.domain == DOMID_ANY || self.dst.domain == dst.domain)
            && (self.dst.port == PORT_ANY || self.dst.port == dst.port)
    }

    fn same_patterns(&self, other: &FilterRule) -> bool {
        self.src.domain == other.src.domain
            && self.src.port == other.src.port
            && self.dst.domain == other.dst.domain
            && self.dst.port == other.dst.port
    }
}

/// The process-wide ordered rule table.
pub struct FilterTable {
    rules: RankedRwLock<Vec<FilterRule>>,
}

impl FilterTable {
    /// Create an empty table (everything accepted).
    #[must_use]
    pub const fn new() -> Self {
        Self { rules: RankedRwLock::new(LockRank::Filter, Vec::new()) }
    }

    /// Insert `rule` at 1-based `position`, clamped to the end of the list.
    ///
    /// # Errors
    ///
    /// `NoMemory` if the table cannot grow.
    pub fn add(&self, rule: FilterRule, position: u32) -> Result<()> {
        let mut rules = self.rules.write();
        rules.try_reserve(1)?;
        let index = (position.saturating_sub(1) as usize).min(rules.len());
        rules.insert(index, rule);
        log::info!(
            "filter: {} {} -> {} inserted at {}",
            if rule.accept { "ACCEPT" } else { "REJECT" },
            DisplayPattern(rule.src),
            DisplayPattern(rule.dst),
            index + 1,
        );
        Ok(())
    }

    /// Delete the rule at 1-based `position`. Returns whether one existed.
    pub fn del_at(&self, position: u32) -> bool {
        let mut rules = self.rules.write();
        let index = position.wrapping_sub(1) as usize;
        if position == 0 || index >= rules.len() {
            return false;
        }
        let rule = rules.remove(index);
        log::info!(
            "filter: deleted rule {} ({} {} -> {})",
            position,
            if rule.accept { "ACCEPT" } else { "REJECT" },
            DisplayPattern(rule.src),
            DisplayPattern(rule.dst),
        );
        true
    }

    /// Delete the first rule whose patterns equal `rule`'s (the accept bit
    /// is not compared). Returns whether one existed.
    pub fn del_matching(&self, rule: &FilterRule) -> bool {
        let mut rules = self.rules.write();
        if let Some(index) = rules.iter().position(|r| r.same_patterns(rule)) {
            rules.remove(index);
            return true;
        }
        false
    }

    /// Remove every rule.
    pub fn flush(&self) {
        let mut rules = self.rules.write();
        log::info!("filter: flushing {} rules", rules.len());
        rules.clear();
    }

    /// Copy out up to `max` rules starting at 0-based `start`, returning
    /// how many were produced.
    ///
    /// # Errors
    ///
    /// `NoMemory` if the output buffer cannot grow.
    pub fn list(&self, start: u32, max: u32, out: &mut Vec<FilterRule>) -> Result<u32> {
        let rules = self.rules.read();
        let window = rules
            .iter()
            .skip(start as usize)
            .take(max as usize);
        out.try_reserve(window.clone().count())?;
        let mut produced = 0;
        for rule in window {
            out.push(*rule);
            produced += 1;
        }
        Ok(produced)
    }

    /// Evaluate a send: `true` to accept. First match wins; the default is
    /// accept.
    #[must_use]
    pub fn check(&self, src: &Address, dst: &Address) -> bool {
        let rules = self.rules.read();
        for rule in rules.iter() {
            if rule.matches(src, dst) {
                return rule.accept;
            }
        }
        true
    }

    /// Number of rules currently installed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FilterTable {
    fn default() -> Self {
        Self::new()
    }
}

struct DisplayPattern(Address);

impl core::fmt::Display for DisplayPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0.domain == DOMID_ANY {
            f.write_str("*")?;
        } else {
            write!(f, "{}", self.0.domain)?;
        }
        f.write_str(":")?;
        if self.0.port == PORT_ANY {
            f.write_str("*")
        } else {
            write!(f, "{}", self.0.port)
        }
    }
}
