//! User-configurable dispatch overrides.
//!
//! Overrides map a high-level operator to a policy string. Keys are either a qualified name
//! (`core::scaled_dot_product_attention`), which wins, or a bare name, which applies to every
//! namespace declaring an operator of that name:
//!
//! * `""` or `"default"`: consult every executor in registration order;
//! * `"force=<executor>"`, or a bare executor name: consult only that executor's rules;
//! * `"fallback"`: never substitute, always run the reference implementation.
//!
//! ```
//! use opswap::executor::{SubstitutionOverrides, SubstitutionPolicy};
//!
//! let overrides: SubstitutionOverrides =
//!     serde_json::from_str(r#"{ "scaled_dot_product_attention": "force=flash" }"#).unwrap();
//! assert_eq!(
//!     overrides.policy("scaled_dot_product_attention"),
//!     SubstitutionPolicy::Force { executor: "flash".into() }
//! );
//! ```

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Per-operator dispatch policies, typically loaded from a JSON or config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstitutionOverrides {
    #[serde(flatten)]
    overrides: HashMap<String, SubstitutionPolicy>,
}

impl SubstitutionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: &str, policy: SubstitutionPolicy) -> Self {
        self.overrides.insert(op.to_string(), policy);
        self
    }

    /// Returns the policy configured for `op`, or [`SubstitutionPolicy::Default`].
    pub fn policy(&self, op: &str) -> SubstitutionPolicy {
        self.overrides
            .get(op)
            .cloned()
            .unwrap_or(SubstitutionPolicy::Default)
    }

    /// Policy for one operator: the qualified key first, then the bare name.
    pub fn policy_for(&self, qualified_name: &str, name: &str) -> SubstitutionPolicy {
        self.overrides
            .get(qualified_name)
            .or_else(|| self.overrides.get(name))
            .cloned()
            .unwrap_or(SubstitutionPolicy::Default)
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// How candidates are chosen for one high-level operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubstitutionPolicy {
    #[default]
    Default,
    Force {
        executor: String,
    },
    Fallback,
}

impl SubstitutionPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("default") {
            return Ok(SubstitutionPolicy::Default);
        }
        if trimmed.eq_ignore_ascii_case("fallback") {
            return Ok(SubstitutionPolicy::Fallback);
        }
        if let Some(rest) = trimmed.strip_prefix("force=") {
            let executor = rest.trim();
            if executor.is_empty() {
                return Err(anyhow!("force override requires an executor name"));
            }
            return Ok(SubstitutionPolicy::Force {
                executor: executor.to_string(),
            });
        }
        if trimmed.contains(['=', '(', ')', ' ']) {
            return Err(anyhow!("unrecognised substitution policy: {}", trimmed));
        }
        // Bare names force that executor.
        Ok(SubstitutionPolicy::Force {
            executor: trimmed.to_string(),
        })
    }
}

impl<'de> Deserialize<'de> for SubstitutionPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SubstitutionPolicy::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for SubstitutionPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            SubstitutionPolicy::Default => serializer.serialize_str("default"),
            SubstitutionPolicy::Force { executor } => {
                serializer.serialize_str(&format!("force={executor}"))
            }
            SubstitutionPolicy::Fallback => serializer.serialize_str("fallback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_strings() {
        assert_eq!(SubstitutionPolicy::parse("").unwrap(), SubstitutionPolicy::Default);
        assert_eq!(
            SubstitutionPolicy::parse(" Default ").unwrap(),
            SubstitutionPolicy::Default
        );
        assert_eq!(
            SubstitutionPolicy::parse("fallback").unwrap(),
            SubstitutionPolicy::Fallback
        );
        assert_eq!(
            SubstitutionPolicy::parse("force= flash").unwrap(),
            SubstitutionPolicy::Force {
                executor: "flash".into()
            }
        );
        assert_eq!(
            SubstitutionPolicy::parse("flash").unwrap(),
            SubstitutionPolicy::Force {
                executor: "flash".into()
            }
        );
        assert!(SubstitutionPolicy::parse("force=").is_err());
        assert!(SubstitutionPolicy::parse("benchmark(cache=4)").is_err());
    }

    #[test]
    fn overrides_round_trip_through_json() {
        let overrides: SubstitutionOverrides =
            serde_json::from_str(r#"{ "add": "fallback", "scaled_dot_product_attention": "flash" }"#)
                .unwrap();
        assert_eq!(overrides.policy("add"), SubstitutionPolicy::Fallback);
        assert_eq!(overrides.policy("missing"), SubstitutionPolicy::Default);

        let json = serde_json::to_string(&overrides).unwrap();
        let reparsed: SubstitutionOverrides = serde_json::from_str(&json).unwrap();
        assert_eq!(
            reparsed.policy("scaled_dot_product_attention"),
            SubstitutionPolicy::Force {
                executor: "flash".into()
            }
        );

        let invalid = serde_json::from_str::<SubstitutionOverrides>(r#"{ "add": "force=" }"#);
        assert!(invalid.is_err());
    }

    #[test]
    fn qualified_keys_take_precedence_over_bare_names() {
        let overrides = SubstitutionOverrides::new()
            .with("attention", SubstitutionPolicy::Fallback)
            .with("alpha::attention", SubstitutionPolicy::Default);
        assert_eq!(
            overrides.policy_for("alpha::attention", "attention"),
            SubstitutionPolicy::Default
        );
        assert_eq!(
            overrides.policy_for("beta::attention", "attention"),
            SubstitutionPolicy::Fallback
        );
        assert_eq!(
            overrides.policy_for("beta::other", "other"),
            SubstitutionPolicy::Default
        );
    }
}
