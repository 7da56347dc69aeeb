//! Declarative mapping from event action to derived cache keys

use crate::helpers::{render_key_template, validate_key_template};
use crate::{InvalidationAction, InvalidationError, InvalidationEvent, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event action → key templates purged when that action is seen.
///
/// Deserializes from a plain map, e.g.
/// `{"usage_updated": ["usage:daily:{subject}", "usage:top:last24h"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidationRules {
    rules: BTreeMap<String, Vec<String>>,
}

impl Default for InvalidationRules {
    /// Every aggregate a recorded hit can change, plus the client record.
    fn default() -> Self {
        Self::empty()
            .with_rule(
                InvalidationAction::UsageUpdated,
                [
                    "usage:daily:{subject}",
                    "usage:top:last24h",
                    "client:{subject}",
                ],
            )
            .with_rule(InvalidationAction::ClientUpdated, ["client:{subject}"])
    }
}

impl InvalidationRules {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Replace the templates for `action`.
    pub fn with_rule<I, T>(mut self, action: InvalidationAction, templates: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.rules.insert(
            action.as_str().to_string(),
            templates.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn templates(&self, action: &InvalidationAction) -> &[String] {
        self.rules
            .get(action.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn actions(&self) -> impl Iterator<Item = InvalidationAction> + '_ {
        self.rules.keys().map(|k| InvalidationAction::from(k.as_str()))
    }

    pub fn has_rule(&self, action: &InvalidationAction) -> bool {
        self.rules.contains_key(action.as_str())
    }

    /// Concrete keys to purge for `event`, in template order, without duplicates.
    /// Unknown actions map to nothing.
    pub fn keys_for(&self, event: &InvalidationEvent) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for template in self.templates(&event.action) {
            let key = render_key_template(template, &event.subject_id);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Keys from `expected` that an event of `action` on `subject` would NOT purge.
    ///
    /// An empty result means the rule set is complete for those keys.
    pub fn uncovered<'a>(
        &self,
        action: &InvalidationAction,
        subject: &str,
        expected: &'a [String],
    ) -> Vec<&'a String> {
        let event = InvalidationEvent {
            action: action.clone(),
            subject_id: subject.to_string(),
            timestamp: 0,
        };
        let purged = self.keys_for(&event);
        expected.iter().filter(|k| !purged.contains(k)).collect()
    }

    pub fn validate(&self) -> Result<()> {
        for (action, templates) in &self.rules {
            if templates.is_empty() {
                return Err(InvalidationError::Configuration(format!(
                    "rule for action '{}' has no key templates",
                    action
                )));
            }
            if let Some(bad) = templates.iter().find(|t| !validate_key_template(t)) {
                return Err(InvalidationError::Configuration(format!(
                    "invalid key template '{}' for action '{}'",
                    bad, action
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_cover_usage_aggregates() {
        let rules = InvalidationRules::default();
        let keys = rules.keys_for(&InvalidationEvent::usage_updated("c1"));
        assert_eq!(
            keys,
            vec![
                "usage:daily:c1".to_string(),
                "usage:top:last24h".to_string(),
                "client:c1".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_action_maps_to_nothing() {
        let rules = InvalidationRules::default();
        let event = InvalidationEvent::new(InvalidationAction::Custom("nope".into()), "c1");
        assert!(rules.keys_for(&event).is_empty());
        assert!(!rules.has_rule(&event.action));
    }

    #[test]
    fn test_keys_are_deduplicated() {
        let rules = InvalidationRules::empty().with_rule(
            InvalidationAction::UsageUpdated,
            ["a:{subject}", "a:{subject}", "b"],
        );
        let keys = rules.keys_for(&InvalidationEvent::usage_updated("x"));
        assert_eq!(keys, vec!["a:x".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_uncovered_reports_missing_keys() {
        let rules = InvalidationRules::default();
        let expected = vec![
            "usage:daily:c1".to_string(),
            "usage:weekly:c1".to_string(),
        ];
        let missing = rules.uncovered(&InvalidationAction::UsageUpdated, "c1", &expected);
        assert_eq!(missing, vec![&"usage:weekly:c1".to_string()]);
    }

    #[test]
    fn test_validate() {
        assert!(InvalidationRules::default().validate().is_ok());

        let empty_rule =
            InvalidationRules::empty().with_rule(InvalidationAction::UsageUpdated, Vec::<String>::new());
        assert!(matches!(
            empty_rule.validate(),
            Err(InvalidationError::Configuration(_))
        ));

        let bad_template = InvalidationRules::empty()
            .with_rule(InvalidationAction::UsageUpdated, ["usage:{client}"]);
        assert!(bad_template.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_plain_map() {
        let json = r#"{"usage_updated":["usage:daily:{subject}"],"plan_changed":["plan:{subject}"]}"#;
        let rules: InvalidationRules = serde_json::from_str(json).unwrap();

        assert_eq!(
            rules.templates(&InvalidationAction::UsageUpdated),
            &["usage:daily:{subject}".to_string()]
        );
        assert!(rules.has_rule(&InvalidationAction::Custom("plan_changed".into())));
        assert_eq!(rules.actions().count(), 2);
    }
}
