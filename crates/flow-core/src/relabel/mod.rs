//! Relabeling rules and the fingerprint-keyed cache fronting them.
//!
//! Rules follow the Prometheus relabeling model: each rule concatenates the
//! values of its source labels, matches the result against an anchored
//! regex, and either rewrites a target label or decides the fate of the
//! whole series.

mod cache;

pub use cache::{RelabelCache, RelabelCacheError};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::series::Labels;

/// What a rule does with its match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Set `target_label` from the replacement template.
    #[default]
    Replace,
    /// Keep the series only if the regex matches.
    Keep,
    /// Drop the series if the regex matches.
    Drop,
    /// Drop every label whose name matches the regex.
    LabelDrop,
    /// Keep only labels whose name matches the regex.
    LabelKeep,
}

/// One relabeling rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    /// Labels whose values are joined by `separator` into the match input.
    pub source_labels: Vec<String>,
    /// Separator between source label values.
    pub separator: String,
    /// Regex the joined value (or label name) is matched against. Anchored.
    pub regex: String,
    /// Label written by `replace`.
    pub target_label: String,
    /// Replacement template; capture groups expand as `$1`, `${name}`.
    pub replacement: String,
    /// Rule action.
    pub action: Action,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            regex: "(.*)".to_string(),
            target_label: String::new(),
            replacement: "$1".to_string(),
            action: Action::Replace,
        }
    }
}

/// Rule compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The rule's regex is invalid.
    #[error("invalid relabel regex `{pattern}`: {source}")]
    BadRegex {
        /// The offending pattern.
        pattern: String,
        /// Underlying regex error.
        source: regex::Error,
    },

    /// `replace` requires a target label.
    #[error("relabel rule with action `replace` needs a target_label")]
    MissingTargetLabel,
}

/// A rule with its regex compiled and anchored.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    source_labels: Vec<String>,
    separator: String,
    regex: Regex,
    target_label: String,
    replacement: String,
    action: Action,
}

impl CompiledRule {
    /// Compile a single rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] for an invalid regex or a `replace` rule with
    /// no target label.
    pub fn compile(rule: &Rule) -> Result<Self, RuleError> {
        let regex = Regex::new(&format!("^(?:{})$", rule.regex)).map_err(|source| {
            RuleError::BadRegex { pattern: rule.regex.clone(), source }
        })?;
        if rule.action == Action::Replace && rule.target_label.is_empty() {
            return Err(RuleError::MissingTargetLabel);
        }
        Ok(Self {
            source_labels: rule.source_labels.clone(),
            separator: rule.separator.clone(),
            regex,
            target_label: rule.target_label.clone(),
            replacement: rule.replacement.clone(),
            action: rule.action,
        })
    }

    fn source_value(&self, labels: &Labels) -> String {
        let values: Vec<&str> = self
            .source_labels
            .iter()
            .map(|name| labels.get(name).unwrap_or(""))
            .collect();
        values.join(&self.separator)
    }
}

/// Compile a rule list.
///
/// # Errors
///
/// Returns the first [`RuleError`] hit.
pub fn compile(rules: &[Rule]) -> Result<Vec<CompiledRule>, RuleError> {
    rules.iter().map(CompiledRule::compile).collect()
}

/// Apply rules to a label set.
///
/// Returns `None` when a `keep`/`drop` rule rejects the series or when the
/// surviving label set is empty; otherwise the rewritten labels.
#[must_use]
pub fn process(labels: Labels, rules: &[CompiledRule]) -> Option<Labels> {
    let mut labels = labels;
    for rule in rules {
        match rule.action {
            Action::Keep => {
                if !rule.regex.is_match(&rule.source_value(&labels)) {
                    return None;
                }
            }
            Action::Drop => {
                if rule.regex.is_match(&rule.source_value(&labels)) {
                    return None;
                }
            }
            Action::Replace => {
                let value = rule.source_value(&labels);
                let Some(captures) = rule.regex.captures(&value) else {
                    // Non-matching replace rules are no-ops.
                    continue;
                };
                let mut replacement = String::new();
                captures.expand(&rule.replacement, &mut replacement);
                if replacement.is_empty() {
                    labels.remove(&rule.target_label);
                } else {
                    labels.set(rule.target_label.clone(), replacement);
                }
            }
            Action::LabelDrop => {
                labels.retain(|l| !rule.regex.is_match(&l.name));
            }
            Action::LabelKeep => {
                labels.retain(|l| rule.regex.is_match(&l.name));
            }
        }
    }
    if labels.is_empty() {
        return None;
    }
    Some(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> Labels {
        Labels::from_pairs([
            ("__name__", "http_requests_total"),
            ("env", "dev"),
            ("job", "api"),
        ])
    }

    #[test]
    fn test_drop_matching_series() {
        let rules = compile(&[Rule {
            source_labels: vec!["env".into()],
            regex: "dev".into(),
            action: Action::Drop,
            ..Rule::default()
        }])
        .unwrap();
        assert_eq!(process(series(), &rules), None);
    }

    #[test]
    fn test_keep_non_matching_drops() {
        let rules = compile(&[Rule {
            source_labels: vec!["env".into()],
            regex: "prod".into(),
            action: Action::Keep,
            ..Rule::default()
        }])
        .unwrap();
        assert_eq!(process(series(), &rules), None);
    }

    #[test]
    fn test_replace_rewrites_target() {
        let rules = compile(&[Rule {
            source_labels: vec!["env".into(), "job".into()],
            regex: "(.+);(.+)".into(),
            target_label: "env_job".into(),
            replacement: "$1/$2".into(),
            ..Rule::default()
        }])
        .unwrap();
        let out = process(series(), &rules).unwrap();
        assert_eq!(out.get("env_job"), Some("dev/api"));
    }

    #[test]
    fn test_replace_without_match_is_noop() {
        let rules = compile(&[Rule {
            source_labels: vec!["env".into()],
            regex: "prod".into(),
            target_label: "tier".into(),
            replacement: "x".into(),
            ..Rule::default()
        }])
        .unwrap();
        assert_eq!(process(series(), &rules), Some(series()));
    }

    #[test]
    fn test_empty_replacement_removes_label() {
        let rules = compile(&[Rule {
            source_labels: vec!["env".into()],
            regex: "(?:dev)".into(),
            target_label: "env".into(),
            replacement: String::new(),
            ..Rule::default()
        }])
        .unwrap();
        let out = process(series(), &rules).unwrap();
        assert_eq!(out.get("env"), None);
    }

    #[test]
    fn test_labelkeep_emptying_set_is_drop() {
        let rules = compile(&[Rule {
            regex: "nothing_matches".into(),
            action: Action::LabelKeep,
            ..Rule::default()
        }])
        .unwrap();
        assert_eq!(process(series(), &rules), None);
    }

    #[test]
    fn test_labeldrop() {
        let rules = compile(&[Rule {
            regex: "env|job".into(),
            action: Action::LabelDrop,
            ..Rule::default()
        }])
        .unwrap();
        let out = process(series(), &rules).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("__name__"), Some("http_requests_total"));
    }

    #[test]
    fn test_bad_regex_is_rejected() {
        assert!(matches!(
            compile(&[Rule { regex: "(".into(), ..Rule::default() }]),
            Err(RuleError::BadRegex { .. })
        ));
    }

    #[test]
    fn test_replace_needs_target() {
        assert!(matches!(
            compile(&[Rule::default()]),
            Err(RuleError::MissingTargetLabel)
        ));
    }
}
