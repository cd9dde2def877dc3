//! Conversation policy flags.

use crate::version::Version;

/// Policy flags controlling how a conversation negotiates and sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Accept and offer protocol version 2.
    pub allow_v2: bool,
    /// Accept and offer protocol version 3.
    pub allow_v3: bool,
    /// Refuse to send plaintext; emit a query message instead.
    pub require_encryption: bool,
    /// Append the whitespace tag to outbound plaintext.
    pub send_whitespace_tag: bool,
    /// Start the AKE when a whitespace tag is seen in inbound plaintext.
    pub whitespace_start_ake: bool,
    /// Start the AKE when an OTR error message is received.
    pub error_start_ake: bool,
}

impl Default for Policy {
    /// Both protocol versions allowed, nothing else enabled.
    fn default() -> Self {
        Self {
            allow_v2: true,
            allow_v3: true,
            require_encryption: false,
            send_whitespace_tag: false,
            whitespace_start_ake: false,
            error_start_ake: false,
        }
    }
}

impl Policy {
    /// True if at least one protocol version is allowed.
    pub fn is_otr_enabled(&self) -> bool {
        self.allow_v2 || self.allow_v3
    }

    /// Whether `version` is acceptable under this policy.
    pub fn allows(&self, version: Version) -> bool {
        match version {
            Version::V2 => self.allow_v2,
            Version::V3 => self.allow_v3,
        }
    }

    /// Pick the highest allowed version out of an offered set.
    pub fn best_version(&self, offered: &[Version]) -> Option<Version> {
        if self.allow_v3 && offered.contains(&Version::V3) {
            Some(Version::V3)
        } else if self.allow_v2 && offered.contains(&Version::V2) {
            Some(Version::V2)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_version_prefers_v3() {
        let policy = Policy::default();
        let best = policy.best_version(&[Version::V2, Version::V3]);
        assert_eq!(best, Some(Version::V3));
    }

    #[test]
    fn test_best_version_respects_policy() {
        let policy = Policy {
            allow_v3: false,
            ..Policy::default()
        };
        let best = policy.best_version(&[Version::V2, Version::V3]);
        assert_eq!(best, Some(Version::V2));
    }

    #[test]
    fn test_no_common_version() {
        let policy = Policy {
            allow_v2: false,
            ..Policy::default()
        };
        assert_eq!(policy.best_version(&[Version::V2]), None);
    }
}
