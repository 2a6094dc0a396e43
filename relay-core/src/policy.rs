//! Usage policy for the shared default credential.
//!
//! A conversation with its own key is always allowed. Otherwise the shared
//! key is used until the conversation's counter reaches the ceiling.

use crate::types::ConversationSettings;
use relay_common::util::mask_secret;
use relay_common::Error;
use std::fmt;

/// Why a request may not go ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    NoCredential,
    QuotaExhausted { used: u64, limit: u64 },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredential => f.write_str("no credential available"),
            Self::QuotaExhausted { .. } => f.write_str("default credential quota exhausted"),
        }
    }
}

impl From<DenialReason> for Error {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::NoCredential => Error::NoCredential,
            DenialReason::QuotaExhausted { used, limit } => Error::QuotaExhausted { used, limit },
        }
    }
}

/// Outcome of a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    UseOverrideCredential,
    UseDefaultCredential,
    Denied(DenialReason),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }

    /// Whether serving this request counts against the default-key quota.
    pub fn uses_default(&self) -> bool {
        matches!(self, Self::UseDefaultCredential)
    }

    /// Turn a denial into the matching error.
    pub fn require(self) -> relay_common::Result<Self> {
        match self {
            Self::Denied(reason) => Err(reason.into()),
            allowed => Ok(allowed),
        }
    }
}

#[derive(Clone)]
pub struct UsagePolicy {
    default_credential: Option<String>,
    /// Zero means no ceiling.
    usage_ceiling: u64,
}

impl UsagePolicy {
    pub fn new(default_credential: Option<String>, usage_ceiling: u64) -> Self {
        Self {
            default_credential: default_credential.filter(|k| !k.is_empty()),
            usage_ceiling,
        }
    }

    pub fn has_default_credential(&self) -> bool {
        self.default_credential.is_some()
    }

    pub fn ceiling(&self) -> u64 {
        self.usage_ceiling
    }

    /// Decide whether a request for a conversation in this state may proceed.
    /// Pure: no I/O and no clock.
    pub fn decide(&self, settings: &ConversationSettings) -> Authorization {
        if settings.credential_override.is_some() {
            return Authorization::UseOverrideCredential;
        }
        if self.default_credential.is_none() {
            return Authorization::Denied(DenialReason::NoCredential);
        }
        let used = settings.default_credential_usage_count;
        if self.usage_ceiling > 0 && used >= self.usage_ceiling {
            return Authorization::Denied(DenialReason::QuotaExhausted {
                used,
                limit: self.usage_ceiling,
            });
        }
        Authorization::UseDefaultCredential
    }

    /// The key to call the model with under the given decision.
    pub fn credential_for<'a>(
        &'a self,
        settings: &'a ConversationSettings,
        authorization: Authorization,
    ) -> Option<&'a str> {
        match authorization {
            Authorization::UseOverrideCredential => settings.credential_override.as_deref(),
            Authorization::UseDefaultCredential => self.default_credential.as_deref(),
            Authorization::Denied(_) => None,
        }
    }

    /// Requests left on the default key, or `None` when no limit applies.
    pub fn remaining(&self, settings: &ConversationSettings) -> Option<u64> {
        if settings.credential_override.is_some() || self.usage_ceiling == 0 {
            return None;
        }
        Some(
            self.usage_ceiling
                .saturating_sub(settings.default_credential_usage_count),
        )
    }
}

impl fmt::Debug for UsagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsagePolicy")
            .field(
                "default_credential",
                &self.default_credential.as_deref().map(mask_secret),
            )
            .field("usage_ceiling", &self.usage_ceiling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn state(override_key: Option<&str>, used: u64) -> ConversationSettings {
        ConversationSettings {
            credential_override: override_key.map(String::from),
            selected_model: "models/m".into(),
            default_credential_usage_count: used,
        }
    }

    #[test_case(Some("own-key"), Some("shared"), 99, Authorization::UseOverrideCredential ; "override ignores quota")]
    #[test_case(Some("own-key"), None, 0, Authorization::UseOverrideCredential ; "override without default")]
    #[test_case(None, None, 0, Authorization::Denied(DenialReason::NoCredential) ; "nothing configured")]
    #[test_case(None, Some("shared"), 4, Authorization::UseDefaultCredential ; "under ceiling")]
    #[test_case(None, Some("shared"), 5, Authorization::Denied(DenialReason::QuotaExhausted { used: 5, limit: 5 }) ; "at ceiling")]
    #[test_case(None, Some("shared"), 8, Authorization::Denied(DenialReason::QuotaExhausted { used: 8, limit: 5 }) ; "past ceiling")]
    fn decide(override_key: Option<&str>, default: Option<&str>, used: u64, expected: Authorization) {
        let policy = UsagePolicy::new(default.map(String::from), 5);
        assert_eq!(policy.decide(&state(override_key, used)), expected);
    }

    #[test]
    fn zero_ceiling_means_unlimited() {
        let policy = UsagePolicy::new(Some("shared".into()), 0);
        assert_eq!(policy.decide(&state(None, 10_000)), Authorization::UseDefaultCredential);
        assert_eq!(policy.remaining(&state(None, 10_000)), None);
    }

    #[test]
    fn empty_default_counts_as_missing() {
        let policy = UsagePolicy::new(Some(String::new()), 5);
        assert!(!policy.has_default_credential());
        assert_eq!(
            policy.decide(&state(None, 0)),
            Authorization::Denied(DenialReason::NoCredential)
        );
    }

    #[test]
    fn credential_selection() {
        let policy = UsagePolicy::new(Some("shared".into()), 5);
        let own = state(Some("own"), 0);
        let shared = state(None, 0);
        assert_eq!(policy.credential_for(&own, policy.decide(&own)), Some("own"));
        assert_eq!(policy.credential_for(&shared, policy.decide(&shared)), Some("shared"));
        assert_eq!(
            policy.credential_for(&shared, Authorization::Denied(DenialReason::NoCredential)),
            None
        );
    }

    #[test]
    fn remaining_counts_down() {
        let policy = UsagePolicy::new(Some("shared".into()), 5);
        assert_eq!(policy.remaining(&state(None, 2)), Some(3));
        assert_eq!(policy.remaining(&state(None, 7)), Some(0));
        assert_eq!(policy.remaining(&state(Some("own"), 7)), None);
    }

    #[test]
    fn require_maps_denials_to_errors() {
        assert!(Authorization::UseDefaultCredential.require().is_ok());
        let err = Authorization::Denied(DenialReason::QuotaExhausted { used: 5, limit: 5 })
            .require()
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExhausted { used: 5, limit: 5 }));
        assert!(err.is_user_facing());
        assert_eq!(DenialReason::NoCredential.to_string(), "no credential available");
    }
}
