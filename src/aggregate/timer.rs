use serde::{Deserialize, Serialize};

/// A named timer with summed duration and count, plus nested child timers.
///
/// Trees held by accumulators and stored records always start at a
/// synthetic root (empty name) whose children are the real top-level timers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerNode {
    pub name: String,
    pub total_duration_nanos: i64,
    pub count: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TimerNode>,
}

impl TimerNode {
    pub fn new(name: impl Into<String>, total_duration_nanos: i64, count: i64) -> Self {
        Self {
            name: name.into(),
            total_duration_nanos,
            count,
            children: Vec::new(),
        }
    }

    pub fn synthetic_root() -> Self {
        Self::default()
    }

    pub fn with_child(mut self, child: TimerNode) -> Self {
        self.children.push(child);
        self
    }

    /// Merges a real top-level timer (and its subtree) under this root.
    pub fn merge_child(&mut self, timer: &TimerNode) {
        self.child_mut(&timer.name).merge(timer);
    }

    /// Merges `other` into `self`: sums totals, then merges children by name.
    pub fn merge(&mut self, other: &TimerNode) {
        self.total_duration_nanos = self
            .total_duration_nanos
            .saturating_add(other.total_duration_nanos);
        self.count = self.count.saturating_add(other.count);
        for child in &other.children {
            self.merge_child(child);
        }
    }

    pub fn find_child(&self, name: &str) -> Option<&TimerNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.children.is_empty()
    }

    fn child_mut(&mut self, name: &str) -> &mut TimerNode {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.children.push(TimerNode::new(name, 0, 0));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }
}
