//! Admission policy: caller classes, rate limits, and the rule predicate.
//!
//! The predicate is plain data: an ordered list of [`PolicyRule`] checks over
//! the structured fields of a [`TaskSpec`]. The first rule that denies wins.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::{CallerId, Priority, TaskSpec};

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Bucket size.
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            refill_per_sec: 10.0,
            burst: 20,
        }
    }
}

/// Limits shared by every caller mapped to the class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerClass {
    #[serde(default)]
    pub rate_limit: RateLimit,

    /// Highest priority a caller in this class may request.
    #[serde(default = "default_ceiling")]
    pub priority_ceiling: Priority,
}

fn default_ceiling() -> Priority {
    Priority::High
}

impl Default for CallerClass {
    fn default() -> Self {
        Self {
            rate_limit: RateLimit::default(),
            priority_ceiling: Priority::High,
        }
    }
}

/// One predicate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PolicyRule {
    /// Every requested tag must be in this set.
    AllowTags { tags: BTreeSet<String> },
    /// None of the requested tags may be in this set.
    DenyTags { tags: BTreeSet<String> },
    /// Deny when all of these tags are requested together.
    DenyTagCombination { tags: BTreeSet<String> },
    /// Upper bound on the declared duration.
    MaxEstimatedDuration { max_ms: u64 },
    /// Upper bound on the payload size.
    MaxPayloadBytes { max_bytes: usize },
    /// Deny requests at or above `priority` that lack `tag`.
    RequireTagForPriority { priority: Priority, tag: String },
}

impl PolicyRule {
    /// Evaluate the rule, returning a denial message on failure.
    pub fn check(&self, spec: &TaskSpec) -> Result<(), String> {
        match self {
            Self::AllowTags { tags } => {
                match spec.capability_tags.iter().find(|t| !tags.contains(*t)) {
                    Some(tag) => Err(format!("capability tag '{tag}' is not allowed")),
                    None => Ok(()),
                }
            }
            Self::DenyTags { tags } => {
                match spec.capability_tags.iter().find(|t| tags.contains(*t)) {
                    Some(tag) => Err(format!("capability tag '{tag}' is denied")),
                    None => Ok(()),
                }
            }
            Self::DenyTagCombination { tags } => {
                if !tags.is_empty() && tags.is_subset(&spec.capability_tags) {
                    let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
                    Err(format!("tag combination [{}] is denied", joined.join(", ")))
                } else {
                    Ok(())
                }
            }
            Self::MaxEstimatedDuration { max_ms } => {
                if spec.estimated_duration_ms > *max_ms {
                    Err(format!(
                        "estimated duration {}ms exceeds limit {}ms",
                        spec.estimated_duration_ms, max_ms
                    ))
                } else {
                    Ok(())
                }
            }
            Self::MaxPayloadBytes { max_bytes } => {
                if spec.payload.len() > *max_bytes {
                    Err(format!(
                        "payload of {} bytes exceeds limit {} bytes",
                        spec.payload.len(),
                        max_bytes
                    ))
                } else {
                    Ok(())
                }
            }
            Self::RequireTagForPriority { priority, tag } => {
                if spec.priority >= *priority && !spec.capability_tags.contains(tag) {
                    Err(format!(
                        "priority {:?} requires capability tag '{tag}'",
                        spec.priority
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Immutable admission policy; swapped whole on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Class applied to callers with no explicit mapping.
    #[serde(default = "default_class_name")]
    pub default_class: String,

    /// Named caller classes.
    #[serde(default)]
    pub classes: HashMap<String, CallerClass>,

    /// Caller to class-name mapping.
    #[serde(default)]
    pub callers: HashMap<CallerId, String>,

    /// Ordered predicate rules.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

fn default_class_name() -> String {
    "standard".to_string()
}

impl Default for Policy {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(default_class_name(), CallerClass::default());
        Self {
            default_class: default_class_name(),
            classes,
            callers: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

impl Policy {
    /// Name of the class a caller belongs to.
    pub fn class_name_for(&self, caller: &CallerId) -> &str {
        self.callers
            .get(caller)
            .map(String::as_str)
            .unwrap_or(&self.default_class)
    }

    /// Resolve the class a caller belongs to, falling back to defaults.
    pub fn class_for(&self, caller: &CallerId) -> CallerClass {
        self.classes
            .get(self.class_name_for(caller))
            .cloned()
            .unwrap_or_default()
    }

    /// Run the priority ceiling and then every rule in order.
    pub fn evaluate(&self, caller: &CallerId, spec: &TaskSpec) -> Result<(), String> {
        let class = self.class_for(caller);
        if spec.priority > class.priority_ceiling {
            return Err(format!(
                "priority {:?} exceeds ceiling {:?} for class '{}'",
                spec.priority,
                class.priority_ceiling,
                self.class_name_for(caller)
            ));
        }
        for rule in &self.rules {
            rule.check(spec)?;
        }
        Ok(())
    }
}
