//! Group Planner
//!
//! Partitions collected tests into execution groups.
//!
//! Selection options:
//! - Regex pattern matching on test ID
//! - Substring exclusion (`--skip`)
//!
//! Grouping: explicit group name first, then the configured default policy
//! for isolation-marked tests; unmarked tests stay in-process. Groups come
//! out in first-seen order and keep collection order inside.

use crate::config::RunConfig;
use fxhash::FxHashMap;
use isocell_core::{MarkerScope, TestItem};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Group key for isolation-marked tests without an explicit group
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultGrouping {
    /// Every test gets its own worker
    #[default]
    PerTest,
    /// Tests of one module share a worker
    PerModule,
    /// Suite markers group by module, function markers by test
    MarkerScope,
}

/// A group of tests sharing one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGroup {
    /// Group key
    pub key: String,
    /// Members in collection order
    pub items: Vec<TestItem>,
    /// Deadline for the whole group
    pub timeout: Duration,
}

/// Planner output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Isolated groups in first-seen order
    pub groups: Vec<ExecutionGroup>,
    /// Tests run in the controlling process
    pub in_process: Vec<TestItem>,
}

impl Plan {
    /// Total number of planned items
    pub fn len(&self) -> usize {
        self.in_process.len() + self.groups.iter().map(|g| g.items.len()).sum::<usize>()
    }

    /// Whether nothing was planned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Planner switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Treat unmarked tests as marked
    pub isolate_all: bool,
    /// Plan everything in-process
    pub disable_isolation: bool,
    /// Key policy for unnamed isolated tests
    pub default_grouping: DefaultGrouping,
    /// Group timeout when no member overrides it
    pub default_timeout: Duration,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for PlanOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            isolate_all: config.isolate_all,
            disable_isolation: config.disable_isolation,
            default_grouping: config.default_grouping,
            default_timeout: config.default_timeout,
        }
    }
}

/// Keep the items matching `filter` and none of `skip`, re-indexed in
/// collection order
pub fn select(
    items: impl IntoIterator<Item = TestItem>,
    filter: Option<&regex::Regex>,
    skip: &[String],
) -> Vec<TestItem> {
    let mut selected: Vec<TestItem> = items
        .into_iter()
        .filter(|item| {
            // Apply regex filter on test ID
            if let Some(re) = filter {
                if !re.is_match(&item.id) {
                    return false;
                }
            }

            // Apply exclusions
            !skip.iter().any(|s| item.id.contains(s.as_str()))
        })
        .collect();

    selected.sort_by_key(|item| item.index);
    for (index, item) in selected.iter_mut().enumerate() {
        item.index = index;
    }
    selected
}

/// Group key of an item, or `None` when it runs in-process
pub fn group_key(item: &TestItem, options: &PlanOptions) -> Option<String> {
    if options.disable_isolation {
        return None;
    }
    if let Some(group) = &item.group {
        return Some(group.clone());
    }
    if !item.isolated && !options.isolate_all {
        return None;
    }

    let key = match options.default_grouping {
        DefaultGrouping::PerTest => &item.id,
        DefaultGrouping::PerModule => &item.module_key,
        DefaultGrouping::MarkerScope => match item.scope {
            MarkerScope::Suite => &item.module_key,
            MarkerScope::Function => &item.id,
        },
    };
    Some(key.clone())
}

/// Partition items into execution groups
pub fn plan(items: impl IntoIterator<Item = TestItem>, options: &PlanOptions) -> Plan {
    let mut groups: Vec<ExecutionGroup> = Vec::new();
    let mut by_key: FxHashMap<String, usize> = FxHashMap::default();
    let mut in_process = Vec::new();

    let mut items: Vec<TestItem> = items.into_iter().collect();
    items.sort_by_key(|item| item.index);

    for item in items {
        let Some(key) = group_key(&item, options) else {
            in_process.push(item);
            continue;
        };

        let slot = *by_key.entry(key.clone()).or_insert_with(|| {
            groups.push(ExecutionGroup {
                key,
                items: Vec::new(),
                timeout: Duration::ZERO,
            });
            groups.len() - 1
        });
        groups[slot].items.push(item);
    }

    for group in &mut groups {
        group.timeout = group
            .items
            .iter()
            .filter_map(|item| item.timeout)
            .max()
            .unwrap_or(options.default_timeout);
    }

    Plan { groups, in_process }
}
