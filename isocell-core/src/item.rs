//! Collected test items

use crate::{MarkerScope, TestDef};
use std::time::Duration;

/// An immutable, collected test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestItem {
    /// Unique identifier
    pub id: String,
    /// Position in collection order
    pub index: usize,
    /// Originating module
    pub module_key: String,
    /// Explicit group name
    pub group: Option<String>,
    /// Per-group timeout override
    pub timeout: Option<Duration>,
    /// Marked for isolation
    pub isolated: bool,
    /// Where the marker was applied
    pub scope: MarkerScope,
    /// Failure is expected
    pub xfail: bool,
}

impl TestItem {
    /// Build an item from its registration
    pub fn from_def(def: &TestDef, index: usize) -> Self {
        Self {
            id: def.id(),
            index,
            module_key: def.module_path.to_string(),
            group: def.marker.group.map(str::to_string),
            timeout: def.marker.timeout_secs.map(Duration::from_secs),
            isolated: def.marker.isolated,
            scope: def.marker.scope,
            xfail: def.xfail,
        }
    }

    /// Unmarked item, mostly useful for building plans by hand
    pub fn new(id: impl Into<String>, module_key: impl Into<String>, index: usize) -> Self {
        Self {
            id: id.into(),
            index,
            module_key: module_key.into(),
            group: None,
            timeout: None,
            isolated: false,
            scope: MarkerScope::Function,
            xfail: false,
        }
    }

    /// Mark for isolation
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Set an explicit group (implies isolation)
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.isolated = true;
        self.group = Some(group.into());
        self
    }

    /// Override the group timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Record that the marker came from a suite
    pub fn from_suite(mut self) -> Self {
        self.isolated = true;
        self.scope = MarkerScope::Suite;
        self
    }

    /// Expect failure
    pub fn xfail(mut self) -> Self {
        self.xfail = true;
        self
    }
}
