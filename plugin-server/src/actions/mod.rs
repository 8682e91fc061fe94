use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use common_types::element::{chain_to_elements, Element};
use common_types::{PluginEvent, TeamId};

use crate::store::{ActionRepository, StoreError};

pub type ActionId = i32;

/// A server-side label: an event matches an action when any one of the
/// action's steps matches in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub team_id: TeamId,
    pub name: String,
    pub deleted: bool,
    pub steps: Vec<ActionStep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionStep {
    pub id: i32,
    pub action_id: ActionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_matching: Option<UrlMatching>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMatching {
    Contains,
    Regex,
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub key: String,
    pub value: Value,
    #[serde(default = "PropertyOperator::default")]
    pub operator: PropertyOperator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOperator {
    #[default]
    Exact,
    IsNot,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    IsSet,
    IsNotSet,
    Gt,
    Lt,
}

impl ActionStep {
    fn matches(&self, event: &PluginEvent, elements: &[Element]) -> bool {
        if let Some(step_event) = &self.event {
            if step_event != &event.event {
                return false;
            }
        }

        if let Some(url_pattern) = &self.url {
            let Some(current_url) = event
                .properties
                .get("$current_url")
                .and_then(Value::as_str)
            else {
                return false;
            };
            let matching = self.url_matching.unwrap_or(UrlMatching::Contains);
            if !match_url(url_pattern, current_url, matching) {
                return false;
            }
        }

        if self.tag_name.is_some() || self.text.is_some() || self.href.is_some() {
            let element_matches = elements.iter().any(|el| {
                self.tag_name
                    .as_ref()
                    .map(|t| el.tag_name.as_ref() == Some(t))
                    .unwrap_or(true)
                    && self
                        .text
                        .as_ref()
                        .map(|t| el.text.as_ref() == Some(t))
                        .unwrap_or(true)
                    && self
                        .href
                        .as_ref()
                        .map(|h| el.href.as_ref() == Some(h))
                        .unwrap_or(true)
            });
            if !element_matches {
                return false;
            }
        }

        self.properties
            .iter()
            .all(|filter| filter.matches(&event.properties))
    }
}

fn match_url(pattern: &str, url: &str, matching: UrlMatching) -> bool {
    match matching {
        UrlMatching::Exact => url == pattern,
        UrlMatching::Contains => {
            // Percent-wildcards come from the UI's "contains" input
            let pattern = regex::escape(pattern).replace("%", ".*").replace("_", ".");
            Regex::new(&pattern)
                .map(|re| re.is_match(url))
                .unwrap_or(false)
        }
        UrlMatching::Regex => Regex::new(pattern)
            .map(|re| re.is_match(url))
            .unwrap_or(false),
    }
}

impl PropertyFilter {
    fn matches(&self, properties: &HashMap<String, Value>) -> bool {
        let value = properties.get(&self.key);

        match self.operator {
            PropertyOperator::IsSet => return value.is_some(),
            PropertyOperator::IsNotSet => return value.is_none(),
            _ => {}
        }

        let Some(value) = value else {
            return false;
        };

        match self.operator {
            PropertyOperator::Exact => values_equal(&self.value, value),
            PropertyOperator::IsNot => !values_equal(&self.value, value),
            PropertyOperator::Icontains => contains_insensitive(&self.value, value),
            PropertyOperator::NotIcontains => !contains_insensitive(&self.value, value),
            PropertyOperator::Regex => regex_match(&self.value, value).unwrap_or(false),
            PropertyOperator::NotRegex => !regex_match(&self.value, value).unwrap_or(true),
            PropertyOperator::Gt => compare_numeric(value, &self.value)
                .map(|ord| ord == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            PropertyOperator::Lt => compare_numeric(value, &self.value)
                .map(|ord| ord == std::cmp::Ordering::Less)
                .unwrap_or(false),
            PropertyOperator::IsSet | PropertyOperator::IsNotSet => unreachable!(),
        }
    }
}

/// Exact matching treats an array filter value as "one of".
fn values_equal(filter_value: &Value, value: &Value) -> bool {
    match filter_value {
        Value::Array(options) => options.iter().any(|o| values_equal(o, value)),
        _ => as_comparable_string(filter_value) == as_comparable_string(value),
    }
}

fn as_comparable_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains_insensitive(filter_value: &Value, value: &Value) -> bool {
    as_comparable_string(value)
        .to_lowercase()
        .contains(&as_comparable_string(filter_value).to_lowercase())
}

fn regex_match(filter_value: &Value, value: &Value) -> Option<bool> {
    let pattern = filter_value.as_str()?;
    let re = Regex::new(pattern).ok()?;
    Some(re.is_match(&as_comparable_string(value)))
}

fn compare_numeric(value: &Value, filter_value: &Value) -> Option<std::cmp::Ordering> {
    let left = value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))?;
    let right = filter_value
        .as_f64()
        .or_else(|| filter_value.as_str().and_then(|s| s.parse().ok()))?;
    left.partial_cmp(&right)
}

/// Per-worker holder of the action match sets, rebuilt by the reload tasks.
pub struct ActionManager {
    repository: Arc<dyn ActionRepository>,
    by_team: HashMap<TeamId, BTreeMap<ActionId, Action>>,
}

impl ActionManager {
    pub fn new(repository: Arc<dyn ActionRepository>) -> Self {
        Self {
            repository,
            by_team: HashMap::new(),
        }
    }

    pub async fn reload_all(&mut self) -> Result<(), StoreError> {
        let actions = self.repository.fetch_all_actions().await?;
        self.by_team.clear();
        for action in actions {
            if action.deleted {
                continue;
            }
            self.by_team
                .entry(action.team_id)
                .or_default()
                .insert(action.id, action);
        }
        Ok(())
    }

    pub async fn reload_action(&mut self, id: ActionId) -> Result<(), StoreError> {
        match self.repository.fetch_action(id).await? {
            Some(action) if !action.deleted => {
                self.by_team
                    .entry(action.team_id)
                    .or_default()
                    .insert(action.id, action);
            }
            _ => {
                warn!(action_id = id, "reloaded action is gone, dropping it");
                self.drop_action(id);
            }
        }
        Ok(())
    }

    pub fn drop_action(&mut self, id: ActionId) {
        for actions in self.by_team.values_mut() {
            actions.remove(&id);
        }
    }

    /// Ids of every action of the event's team that matches, ascending.
    pub fn match_event(&self, event: &PluginEvent) -> Vec<ActionId> {
        let Some(actions) = self.by_team.get(&event.team_id) else {
            return Vec::new();
        };

        let elements = event
            .properties
            .get("$elements_chain")
            .and_then(Value::as_str)
            .map(chain_to_elements)
            .unwrap_or_default();

        actions
            .values()
            .filter(|action| action.steps.iter().any(|step| step.matches(event, &elements)))
            .map(|action| action.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn event(name: &str, properties: Value) -> PluginEvent {
        PluginEvent {
            uuid: Uuid::now_v7(),
            distinct_id: "user".to_string(),
            team_id: 1,
            event: name.to_string(),
            properties: serde_json::from_value(properties).unwrap(),
            ip: None,
            site_url: "".to_string(),
            now: "2024-01-01T00:00:00Z".to_string(),
            sent_at: None,
            timestamp: None,
            offset: None,
        }
    }

    fn step(action_id: ActionId) -> ActionStep {
        ActionStep {
            id: action_id * 10,
            action_id,
            ..Default::default()
        }
    }

    #[test]
    fn event_name_predicate() {
        let step = ActionStep {
            event: Some("$pageview".to_string()),
            ..step(1)
        };
        assert!(step.matches(&event("$pageview", json!({})), &[]));
        assert!(!step.matches(&event("$autocapture", json!({})), &[]));
    }

    #[test]
    fn url_contains_with_percent_wildcard() {
        let step = ActionStep {
            url: Some("example.com/%/signup".to_string()),
            url_matching: Some(UrlMatching::Contains),
            ..step(1)
        };
        let matching = event(
            "$pageview",
            json!({"$current_url": "https://example.com/en/signup"}),
        );
        let not_matching = event("$pageview", json!({"$current_url": "https://example.com/"}));
        assert!(step.matches(&matching, &[]));
        assert!(!step.matches(&not_matching, &[]));
    }

    #[test]
    fn element_predicates_check_the_whole_chain() {
        let step = ActionStep {
            tag_name: Some("button".to_string()),
            text: Some("Sign up".to_string()),
            ..step(1)
        };
        let elements = chain_to_elements(r#"button:text="Sign up"nth-child="1";div.wrapper"#);
        assert!(step.matches(&event("$autocapture", json!({})), &elements));

        let other = chain_to_elements(r#"a:text="Sign up""#);
        assert!(!step.matches(&event("$autocapture", json!({})), &other));
    }

    #[test]
    fn property_filters_all_must_match() {
        let step = ActionStep {
            properties: vec![
                PropertyFilter {
                    key: "$browser".to_string(),
                    value: json!("Chrome"),
                    operator: PropertyOperator::Exact,
                },
                PropertyFilter {
                    key: "price".to_string(),
                    value: json!(100),
                    operator: PropertyOperator::Gt,
                },
            ],
            ..step(1)
        };
        assert!(step.matches(
            &event("purchase", json!({"$browser": "Chrome", "price": 150})),
            &[]
        ));
        assert!(!step.matches(
            &event("purchase", json!({"$browser": "Chrome", "price": 50})),
            &[]
        ));
        assert!(!step.matches(&event("purchase", json!({"price": 150})), &[]));
    }

    #[test]
    fn exact_filter_accepts_one_of_array() {
        let filter = PropertyFilter {
            key: "plan".to_string(),
            value: json!(["free", "trial"]),
            operator: PropertyOperator::Exact,
        };
        let props: HashMap<String, Value> =
            serde_json::from_value(json!({"plan": "trial"})).unwrap();
        assert!(filter.matches(&props));
        let props: HashMap<String, Value> =
            serde_json::from_value(json!({"plan": "paid"})).unwrap();
        assert!(!filter.matches(&props));
    }
}
