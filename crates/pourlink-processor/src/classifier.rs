//! Topic classification: routes each inbound broker topic to the validator
//! that understands its payload.
//!
//! The route table is built once from the configured [`TopicTable`] and is
//! checked exact-first, so an exact route always wins over a prefix route
//! covering the same topic. This is deliberately simpler than the
//! subscription-time `+`/`#` wildcard matching; the broker decides what we
//! receive, the classifier only decides where it goes.

use pourlink_types::WeightFilter;
use serde::{Deserialize, Serialize};

/// How a route's pattern is compared against a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
}

/// Which validator an inbound topic is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Weight(WeightFilter),
    Concentration,
    RobotEvent,
    /// Command echoes on the control topic or any subtopic below it.
    CommandEcho,
    /// No route; the message is counted and dropped.
    Unclassified,
}

/// Configurable topic names, the TOML `[topics]` table.
///
/// Weight topics are not listed here: they are fixed by
/// [`WeightFilter::broker_topic`], the scale node's publishing contract.
/// `raw_weight_aliases` covers legacy feeds that mirror the raw samples;
/// the default `test` alias is still emitted by the scale calibration
/// script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicTable {
    #[serde(default = "default_concentration")]
    pub concentration: String,
    #[serde(default = "default_scenario")]
    pub scenario: String,
    #[serde(default = "default_command")]
    pub command: String,
    /// Prefix (including the trailing separator) for command subtopics.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_raw_weight_aliases")]
    pub raw_weight_aliases: Vec<String>,
}

fn default_concentration() -> String {
    "concentration/target".to_string()
}
fn default_scenario() -> String {
    "robot/event".to_string()
}
fn default_command() -> String {
    "robot/control".to_string()
}
fn default_command_prefix() -> String {
    "robot/control/".to_string()
}
fn default_raw_weight_aliases() -> Vec<String> {
    vec!["test".to_string()]
}

impl Default for TopicTable {
    fn default() -> Self {
        Self {
            concentration: default_concentration(),
            scenario: default_scenario(),
            command: default_command(),
            command_prefix: default_command_prefix(),
            raw_weight_aliases: default_raw_weight_aliases(),
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    kind: MatchKind,
    category: Category,
}

/// Fixed routing table, exact routes before prefix routes.
#[derive(Debug, Clone)]
pub struct TopicClassifier {
    routes: Vec<Route>,
}

impl TopicClassifier {
    pub fn new(table: &TopicTable) -> Self {
        let mut routes = Vec::new();
        for filter in WeightFilter::all() {
            routes.push(Route {
                pattern: filter.broker_topic().to_string(),
                kind: MatchKind::Exact,
                category: Category::Weight(filter),
            });
        }
        for alias in &table.raw_weight_aliases {
            routes.push(Route {
                pattern: alias.clone(),
                kind: MatchKind::Exact,
                category: Category::Weight(WeightFilter::Raw),
            });
        }
        routes.push(Route {
            pattern: table.concentration.clone(),
            kind: MatchKind::Exact,
            category: Category::Concentration,
        });
        routes.push(Route {
            pattern: table.scenario.clone(),
            kind: MatchKind::Exact,
            category: Category::RobotEvent,
        });
        routes.push(Route {
            pattern: table.command.clone(),
            kind: MatchKind::Exact,
            category: Category::CommandEcho,
        });
        // Prefix routes last: exact matches always win.
        routes.push(Route {
            pattern: table.command_prefix.clone(),
            kind: MatchKind::Prefix,
            category: Category::CommandEcho,
        });
        Self { routes }
    }

    /// Classify one broker topic.
    pub fn classify(&self, topic: &str) -> Category {
        for route in &self.routes {
            let hit = match route.kind {
                MatchKind::Exact => topic == route.pattern,
                MatchKind::Prefix => topic.starts_with(&route.pattern),
            };
            if hit {
                return route.category.clone();
            }
        }
        Category::Unclassified
    }
}

impl Default for TopicClassifier {
    fn default() -> Self {
        Self::new(&TopicTable::default())
    }
}
