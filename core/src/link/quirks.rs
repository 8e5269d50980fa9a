//! Device quirk policy — per-device-family behavior as data, not branches
//!
//! Some device families require an attribute-cache invalidation before
//! parameter negotiation, some must skip it, and a few cannot negotiate a
//! larger transfer unit at all. Those differences live in a rule table keyed
//! on device identity classification, injected into the lifecycle, so a new
//! quirk is a new rule rather than a new code path.

use crate::link::transport::LinkTarget;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Behavior flags applied during bring-up for a matched device family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQuirks {
    /// Invalidate the cached attribute table right after link-up
    pub invalidate_cache_on_connect: bool,
    /// Skip parameter negotiation entirely
    pub skip_mtu_negotiation: bool,
}

/// How a rule matches a device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMatcher {
    /// Advertised name starts with the given prefix
    NamePrefix(String),
    /// Address starts with the given prefix (vendor OUI, typically)
    AddressPrefix(String),
}

impl DeviceMatcher {
    fn matches(&self, target: &LinkTarget) -> bool {
        match self {
            DeviceMatcher::NamePrefix(prefix) => target
                .name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str())),
            DeviceMatcher::AddressPrefix(prefix) => target.address.starts_with(prefix.as_str()),
        }
    }
}

/// One classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuirkRule {
    pub matcher: DeviceMatcher,
    pub quirks: DeviceQuirks,
}

/// Rule table. First matching rule wins; no match yields defaults.
#[derive(Debug, Default)]
pub struct QuirkTable {
    rules: RwLock<Vec<QuirkRule>>,
}

impl QuirkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<QuirkRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Append a rule. Later rules only apply where earlier ones did not match.
    pub fn add_rule(&self, matcher: DeviceMatcher, quirks: DeviceQuirks) {
        let mut rules = self.rules.write();
        rules.push(QuirkRule { matcher, quirks });
    }

    /// Classify a target into its quirk set.
    pub fn classify(&self, target: &LinkTarget) -> DeviceQuirks {
        let rules = self.rules.read();
        for rule in rules.iter() {
            if rule.matcher.matches(target) {
                debug!("Quirk rule matched for {}: {:?}", target.address, rule.quirks);
                return rule.quirks;
            }
        }
        DeviceQuirks::default()
    }
}
