use serde::{Deserialize, Serialize};

/// Thread state observed at the leaf of a sampled stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

/// One frame of a sampled stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub line_number: i32,
}

impl StackFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            ..Default::default()
        }
    }
}

/// Node of a merged stack-sample tree, weighted by sample count.
///
/// Two siblings are the same node iff both frame and leaf thread state match.
/// Like timer trees, merged profiles hang off a synthetic root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileNode {
    pub frame: StackFrame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_thread_state: Option<ThreadState>,
    pub sample_count: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProfileNode>,
}

impl ProfileNode {
    pub fn new(frame: StackFrame, sample_count: i64) -> Self {
        Self {
            frame,
            leaf_thread_state: None,
            sample_count,
            children: Vec::new(),
        }
    }

    pub fn synthetic_root() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: ThreadState) -> Self {
        self.leaf_thread_state = Some(state);
        self
    }

    pub fn with_child(mut self, child: ProfileNode) -> Self {
        self.children.push(child);
        self
    }

    /// Merges `other` into `self`, summing sample counts and merging children.
    pub fn merge(&mut self, other: &ProfileNode) {
        self.sample_count = self.sample_count.saturating_add(other.sample_count);
        for child in &other.children {
            self.child_mut(&child.frame, child.leaf_thread_state)
                .merge(child);
        }
    }

    pub fn find_child(&self, frame: &StackFrame, state: Option<ThreadState>) -> Option<&ProfileNode> {
        self.children
            .iter()
            .find(|c| c.frame == *frame && c.leaf_thread_state == state)
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ProfileNode::node_count).sum::<usize>()
    }

    fn child_mut(&mut self, frame: &StackFrame, state: Option<ThreadState>) -> &mut ProfileNode {
        let idx = match self
            .children
            .iter()
            .position(|c| c.frame == *frame && c.leaf_thread_state == state)
        {
            Some(idx) => idx,
            None => {
                let mut node = ProfileNode::new(frame.clone(), 0);
                node.leaf_thread_state = state;
                self.children.push(node);
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(state: ThreadState, samples: i64) -> ProfileNode {
        let run = StackFrame::new("java.lang.Thread", "run");
        let handle = StackFrame::new("com.example.Handler", "handle");
        ProfileNode::synthetic_root().with_child(
            ProfileNode::new(run, samples)
                .with_child(ProfileNode::new(handle, samples).with_state(state)),
        )
    }

    #[test]
    fn test_merge_sums_matching_frames() {
        let mut root = ProfileNode::synthetic_root();
        root.merge(&sample(ThreadState::Runnable, 3));
        root.merge(&sample(ThreadState::Runnable, 2));

        assert_eq!(root.children.len(), 1);
        let run = &root.children[0];
        assert_eq!(run.sample_count, 5);
        assert_eq!(run.children.len(), 1);
        assert_eq!(run.children[0].sample_count, 5);
    }

    #[test]
    fn test_leaf_state_is_part_of_identity() {
        let mut root = ProfileNode::synthetic_root();
        root.merge(&sample(ThreadState::Runnable, 3));
        root.merge(&sample(ThreadState::Blocked, 1));

        let run = &root.children[0];
        assert_eq!(run.sample_count, 4);
        assert_eq!(run.children.len(), 2);

        let handle = StackFrame::new("com.example.Handler", "handle");
        let blocked = run
            .find_child(&handle, Some(ThreadState::Blocked))
            .unwrap();
        assert_eq!(blocked.sample_count, 1);
        assert_eq!(root.node_count(), 4);
    }
}
