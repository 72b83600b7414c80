//! Label policy collaborator.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use stategraph_storage::{LabelValue, Labels};

/// Longest accepted label key.
pub const MAX_LABEL_KEY_LEN: usize = 128;

/// Decides whether a label map may be stored on a state.
pub trait LabelValidator: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn validate(&self, labels: &Labels) -> Result<(), String>;
}

/// Accepts any structurally valid label map.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllLabels;

impl LabelValidator for AllowAllLabels {
    fn validate(&self, labels: &Labels) -> Result<(), String> {
        check_keys(labels)
    }
}

fn check_keys(labels: &Labels) -> Result<(), String> {
    for key in labels.keys() {
        if key.is_empty() {
            return Err("label keys must not be empty".into());
        }
        if key.len() > MAX_LABEL_KEY_LEN {
            return Err(format!("label key '{key}' exceeds {MAX_LABEL_KEY_LEN} bytes"));
        }
        if key.chars().any(char::is_control) {
            return Err(format!("label key {key:?} contains control characters"));
        }
    }
    Ok(())
}

/// Declarative label rules, loaded from the `[labels]` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelPolicy {
    pub max_keys: Option<usize>,
    /// When non-empty, only these keys are accepted.
    pub allowed_keys: Vec<String>,
    /// Keys starting with any of these prefixes are rejected.
    pub reserved_prefixes: Vec<String>,
    /// Keys whose value must be one of the listed strings.
    pub enums: BTreeMap<String, Vec<String>>,
    pub max_value_len: Option<usize>,
}

impl LabelPolicy {
    pub fn check(&self, labels: &Labels) -> Result<(), String> {
        check_keys(labels)?;
        if let Some(max) = self.max_keys {
            if labels.len() > max {
                return Err(format!("{} labels given, at most {max} allowed", labels.len()));
            }
        }
        for (key, value) in labels {
            if !self.allowed_keys.is_empty() && !self.allowed_keys.iter().any(|k| k == key) {
                return Err(format!("label key '{key}' is not allowed"));
            }
            if let Some(prefix) = self
                .reserved_prefixes
                .iter()
                .find(|p| key.starts_with(p.as_str()))
            {
                return Err(format!("label key '{key}' uses reserved prefix '{prefix}'"));
            }
            if let Some(allowed) = self.enums.get(key) {
                let ok = matches!(value, LabelValue::String(s) if allowed.contains(s));
                if !ok {
                    return Err(format!(
                        "label '{key}' must be one of [{}], got {value}",
                        allowed.join(", ")
                    ));
                }
            }
            if let (Some(max), LabelValue::String(s)) = (self.max_value_len, value) {
                if s.chars().count() > max {
                    return Err(format!("label '{key}' value exceeds {max} characters"));
                }
            }
        }
        Ok(())
    }
}

/// [`LabelValidator`] backed by an immutable [`LabelPolicy`] snapshot.
///
/// [`PolicyLabelValidator::replace`] swaps the whole snapshot; validations
/// already running keep the snapshot they started with.
#[derive(Debug, Default)]
pub struct PolicyLabelValidator {
    policy: RwLock<Arc<LabelPolicy>>,
}

impl PolicyLabelValidator {
    pub fn new(policy: LabelPolicy) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn snapshot(&self) -> Arc<LabelPolicy> {
        match self.policy.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, policy: LabelPolicy) {
        let next = Arc::new(policy);
        match self.policy.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

impl LabelValidator for PolicyLabelValidator {
    fn validate(&self, labels: &Labels) -> Result<(), String> {
        self.snapshot().check(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, LabelValue)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn s(v: &str) -> LabelValue {
        LabelValue::String(v.into())
    }

    #[test]
    fn allow_all_still_rejects_empty_keys() {
        assert!(AllowAllLabels.validate(&labels(&[("env", s("prod"))])).is_ok());
        assert!(AllowAllLabels.validate(&labels(&[("", s("prod"))])).is_err());
    }

    #[test]
    fn policy_rules() {
        let mut enums = BTreeMap::new();
        enums.insert("env".to_string(), vec!["dev".to_string(), "prod".to_string()]);
        let policy = LabelPolicy {
            max_keys: Some(2),
            allowed_keys: vec![],
            reserved_prefixes: vec!["stategraph.".into()],
            enums,
            max_value_len: Some(8),
        };
        assert!(policy.check(&labels(&[("env", s("prod"))])).is_ok());
        assert!(policy.check(&labels(&[("env", s("qa"))])).is_err());
        assert!(policy.check(&labels(&[("env", LabelValue::Bool(true))])).is_err());
        assert!(policy.check(&labels(&[("stategraph.owner", s("x"))])).is_err());
        assert!(policy.check(&labels(&[("team", s("platform-core"))])).is_err());
        assert!(policy
            .check(&labels(&[("a", s("1")), ("b", s("2")), ("c", s("3"))]))
            .is_err());
    }

    #[test]
    fn allowed_keys_restrict_when_set() {
        let policy = LabelPolicy {
            allowed_keys: vec!["env".into()],
            ..Default::default()
        };
        assert!(policy.check(&labels(&[("env", s("x"))])).is_ok());
        assert!(policy.check(&labels(&[("team", s("x"))])).is_err());
    }

    #[test]
    fn replace_swaps_snapshot() {
        let v = PolicyLabelValidator::new(LabelPolicy::default());
        let before = v.snapshot();
        assert!(v.validate(&labels(&[("team", s("x"))])).is_ok());
        v.replace(LabelPolicy {
            allowed_keys: vec!["env".into()],
            ..Default::default()
        });
        assert!(v.validate(&labels(&[("team", s("x"))])).is_err());
        // Old snapshot is untouched.
        assert!(before.allowed_keys.is_empty());
    }
}
