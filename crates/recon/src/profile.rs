//! Billing profile resolver.
//!
//! Classifies a stored profile identifier into the kind of recurring-billing
//! authorization the subscription uses. Pure string classification; the
//! legacy denylist comes from configuration.

use serde::Serialize;

use crate::config::ProcessorConfig;

/// Billing agreement identifiers carry this prefix; everything else is a
/// processor-hosted recurring profile.
const AGREEMENT_PREFIX: &str = "B-";

/// Kind of recurring-billing authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileKind {
    /// Processor-hosted schedule; the processor triggers each charge.
    StandardRecurring,
    /// Merchant-initiated billing agreement; we trigger each charge.
    ReferenceAgreement,
    /// No stored authorization; the customer renews manually.
    Unknown,
}

/// Whether the identifier uses a format the processor still issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FormatVersion {
    Current,
    Legacy,
}

/// A classified billing profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingProfile {
    pub id: String,
    pub kind: ProfileKind,
    pub format: FormatVersion,
}

/// Classifies profile identifiers.
#[derive(Debug, Clone, Default)]
pub struct ProfileResolver {
    legacy_denylist: Vec<String>,
}

impl ProfileResolver {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            legacy_denylist: config.legacy_profile_denylist.clone(),
        }
    }

    pub fn resolve(&self, id: &str) -> BillingProfile {
        let kind = if id.is_empty() {
            ProfileKind::Unknown
        } else if id.starts_with(AGREEMENT_PREFIX) {
            ProfileKind::ReferenceAgreement
        } else {
            ProfileKind::StandardRecurring
        };

        let format = if self.legacy_denylist.iter().any(|entry| entry == id) {
            FormatVersion::Legacy
        } else {
            FormatVersion::Current
        };

        BillingProfile {
            id: id.to_string(),
            kind,
            format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_prefix_classifies_as_reference_agreement() {
        let resolver = ProfileResolver::default();
        assert_eq!(resolver.resolve("B-123").kind, ProfileKind::ReferenceAgreement);
    }

    #[test]
    fn other_identifiers_classify_as_standard_recurring() {
        let resolver = ProfileResolver::default();
        assert_eq!(resolver.resolve("I-ABC987").kind, ProfileKind::StandardRecurring);
    }

    #[test]
    fn empty_identifier_classifies_as_unknown() {
        let resolver = ProfileResolver::default();
        assert_eq!(resolver.resolve("").kind, ProfileKind::Unknown);
    }

    #[test]
    fn denylisted_identifiers_are_flagged_legacy() {
        let resolver = ProfileResolver {
            legacy_denylist: vec!["I-OLD123".to_string()],
        };
        assert_eq!(resolver.resolve("I-OLD123").format, FormatVersion::Legacy);
        assert_eq!(resolver.resolve("I-NEW456").format, FormatVersion::Current);
    }
}
