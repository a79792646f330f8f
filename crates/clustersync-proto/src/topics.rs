//! Topic templates for the broker transport.
//!
//! Templates use `+` as a single-level placeholder for the counterpart
//! identity, e.g. `sources/hub1/clusters/+/sourceevents`. The last `+` is
//! always the cluster. A template may carry a second, leading `+` for the
//! source: `sources/+/clusters/+/agentevents`.

use serde::{Deserialize, Serialize};

/// Single-level wildcard placeholder.
pub const WILDCARD: &str = "+";

/// Topic templates, one per logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topics {
    /// Source → agent events
    pub source_events: String,
    /// Agent → source events
    pub agent_events: String,
    /// Agent → every source, used for spec resync requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_broadcast: Option<String>,
    /// Source → every agent, used for status resync requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_broadcast: Option<String>,
}

impl Topics {
    /// Check that every template carries the placeholder.
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid template.
    pub fn validate(&self) -> Result<(), TopicError> {
        let templates = [
            ("sourceEvents", Some(&self.source_events)),
            ("agentEvents", Some(&self.agent_events)),
            ("agentBroadcast", self.agent_broadcast.as_ref()),
            ("sourceBroadcast", self.source_broadcast.as_ref()),
        ];

        for (name, template) in templates {
            let Some(template) = template else { continue };
            if template.is_empty() {
                return Err(TopicError::Empty(name.to_string()));
            }
            if wildcard_count(template) == 0 {
                return Err(TopicError::MissingWildcard {
                    name: name.to_string(),
                    template: template.clone(),
                });
            }
        }

        Ok(())
    }

    /// Topics a source subscribes to.
    #[must_use]
    pub fn source_subscriptions(&self, source_id: &str) -> Vec<String> {
        let mut topics = vec![bind_source(&self.agent_events, source_id)];
        if let Some(broadcast) = &self.agent_broadcast {
            topics.push(broadcast.clone());
        }
        topics
    }

    /// Topics an agent subscribes to.
    #[must_use]
    pub fn agent_subscriptions(&self, cluster_name: &str) -> Vec<String> {
        let mut topics = vec![fill_last(&self.source_events, cluster_name)];
        if let Some(broadcast) = &self.source_broadcast {
            topics.push(broadcast.clone());
        }
        topics
    }

    /// The cluster segment of an inbound topic, if it matches a cluster-scoped template.
    #[must_use]
    pub fn cluster_of(&self, topic: &str) -> Option<String> {
        [
            Some(&self.agent_events),
            Some(&self.source_events),
            self.agent_broadcast.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find_map(|template| match_topic(template, topic))
        .and_then(|captures| captures.last().cloned())
    }
}

/// Number of placeholder segments in a template.
#[must_use]
pub fn wildcard_count(template: &str) -> usize {
    template.split('/').filter(|seg| *seg == WILDCARD).count()
}

/// Replace the last placeholder segment with `value`.
#[must_use]
pub fn fill_last(template: &str, value: &str) -> String {
    let mut segments: Vec<&str> = template.split('/').collect();
    if let Some(seg) = segments.iter_mut().rev().find(|seg| **seg == WILDCARD) {
        *seg = value;
    }
    segments.join("/")
}

/// Replace the first placeholder segment with `value`.
#[must_use]
pub fn fill_first(template: &str, value: &str) -> String {
    let mut segments: Vec<&str> = template.split('/').collect();
    if let Some(seg) = segments.iter_mut().find(|seg| **seg == WILDCARD) {
        *seg = value;
    }
    segments.join("/")
}

/// Fill the source segment of a two-placeholder template, leaving the cluster open.
#[must_use]
pub fn bind_source(template: &str, source: &str) -> String {
    if wildcard_count(template) > 1 {
        fill_first(template, source)
    } else {
        template.to_string()
    }
}

/// Fill a cluster-scoped template: cluster in the last placeholder and,
/// for two-placeholder templates, `source` in the first.
#[must_use]
pub fn instantiate(template: &str, cluster: &str, source: &str) -> String {
    fill_last(&bind_source(template, source), cluster)
}

/// Match `topic` against `template`, returning the placeholder captures in order.
#[must_use]
pub fn match_topic(template: &str, topic: &str) -> Option<Vec<String>> {
    let expected: Vec<&str> = template.split('/').collect();
    let actual: Vec<&str> = topic.split('/').collect();
    if expected.len() != actual.len() {
        return None;
    }

    let mut captures = Vec::new();
    for (want, got) in expected.iter().zip(&actual) {
        if *want == WILDCARD {
            if got.is_empty() {
                return None;
            }
            captures.push((*got).to_string());
        } else if want != got {
            return None;
        }
    }

    Some(captures)
}

/// Errors for topic templates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Template is empty
    #[error("topic {0} is empty")]
    Empty(String),
    /// Template has no placeholder
    #[error("topic {name} '{template}' has no '+' placeholder")]
    MissingWildcard {
        /// Template name
        name: String,
        /// Template value
        template: String,
    },
}
