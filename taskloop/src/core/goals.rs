//! Sub-goal stack edits.
//!
//! Every operation takes `(sub_goals, current_index)` and returns a fresh
//! [`GoalStack`]. Operations are total: out-of-range indices are clamped or
//! ignored, and an empty list always yields an empty list focused at `0`.
//! Only [`reorder_goals`] can fail, when its permutation is not a bijection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Ordered sub-goals plus the focused position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStack {
    pub goals: Vec<String>,
    pub current: usize,
}

impl GoalStack {
    pub fn new(goals: Vec<String>, current: usize) -> Self {
        let current = clamp_index(goals.len(), current);
        Self { goals, current }
    }

    pub fn current_goal(&self) -> Option<&str> {
        self.goals.get(self.current).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GoalError {
    #[error("permutation {permutation:?} is not a bijection over 0..{len}")]
    InvalidPermutation { permutation: Vec<usize>, len: usize },
}

/// Clamp `index` into `[0, len - 1]`, or `0` for an empty list.
pub fn clamp_index(len: usize, index: usize) -> usize {
    if len == 0 { 0 } else { index.min(len - 1) }
}

/// Insert `items` at `index` (append when `None`). The focus is clamped into
/// the new bounds.
pub fn insert_goals(
    goals: &[String],
    current: usize,
    items: &[String],
    index: Option<usize>,
) -> GoalStack {
    let at = index.unwrap_or(goals.len()).min(goals.len());
    let mut next = Vec::with_capacity(goals.len() + items.len());
    next.extend_from_slice(&goals[..at]);
    next.extend_from_slice(items);
    next.extend_from_slice(&goals[at..]);
    GoalStack::new(next, current)
}

/// Remove the goals at `indices`. Out-of-range and duplicate indices are ignored.
///
/// If the focused goal is removed, focus stays at the same list position (or
/// the last goal if that position no longer exists). Otherwise focus shifts
/// left by the number of removals before it.
pub fn remove_goals(goals: &[String], current: usize, indices: &[usize]) -> GoalStack {
    if goals.is_empty() {
        return GoalStack::default();
    }
    let current = clamp_index(goals.len(), current);
    let removed: BTreeSet<usize> = indices
        .iter()
        .copied()
        .filter(|&i| i < goals.len())
        .collect();

    let next: Vec<String> = goals
        .iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(_, goal)| goal.clone())
        .collect();

    let focus = if removed.contains(&current) {
        current
    } else {
        current - removed.range(..current).count()
    };
    GoalStack::new(next, focus)
}

/// Reorder goals so that `next[i] = goals[permutation[i]]`. Focus follows the
/// focused goal to its new position.
pub fn reorder_goals(
    goals: &[String],
    current: usize,
    permutation: &[usize],
) -> Result<GoalStack, GoalError> {
    if goals.is_empty() {
        return Ok(GoalStack::default());
    }
    if !is_bijection(permutation, goals.len()) {
        return Err(GoalError::InvalidPermutation {
            permutation: permutation.to_vec(),
            len: goals.len(),
        });
    }
    let current = clamp_index(goals.len(), current);
    let next = permutation.iter().map(|&i| goals[i].clone()).collect();
    let focus = permutation
        .iter()
        .position(|&i| i == current)
        .unwrap_or_default();
    Ok(GoalStack::new(next, focus))
}

/// Move focus to `index`, clamped into bounds.
pub fn set_current(goals: &[String], index: usize) -> GoalStack {
    GoalStack::new(goals.to_vec(), index)
}

fn is_bijection(permutation: &[usize], len: usize) -> bool {
    if permutation.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &i in permutation {
        if i >= len || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}

/// Immutable view used to diff a goal stack before and after an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalSnapshot {
    pub goal: String,
    pub sub_goals: Vec<String>,
    pub current_index: usize,
}

/// Structured difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reordered: bool,
    pub focus: Option<(Option<String>, Option<String>)>,
}

impl GoalDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.reordered && self.focus.is_none()
    }
}

/// Compute added/removed/reordered/focus changes between two snapshots.
///
/// Duplicated goal texts are matched by multiplicity.
pub fn diff_goals(before: &GoalSnapshot, after: &GoalSnapshot) -> GoalDiff {
    let mut unmatched_after: Vec<Option<&String>> = after.sub_goals.iter().map(Some).collect();
    let mut removed = Vec::new();
    let mut kept_before = Vec::new();
    for goal in &before.sub_goals {
        match unmatched_after.iter().position(|g| *g == Some(goal)) {
            Some(pos) => {
                unmatched_after[pos] = None;
                kept_before.push(goal.clone());
            }
            None => removed.push(goal.clone()),
        }
    }
    let added: Vec<String> = unmatched_after.into_iter().flatten().cloned().collect();

    let mut pending_added = added.clone();
    let kept_after: Vec<String> = after
        .sub_goals
        .iter()
        .filter(|goal| match pending_added.iter().position(|g| g == *goal) {
            Some(pos) => {
                pending_added.remove(pos);
                false
            }
            None => true,
        })
        .cloned()
        .collect();

    let focus_before = before.sub_goals.get(before.current_index).cloned();
    let focus_after = after.sub_goals.get(after.current_index).cloned();
    let focus = (focus_before != focus_after).then_some((focus_before, focus_after));

    GoalDiff {
        added,
        removed,
        reordered: kept_before != kept_after,
        focus,
    }
}

/// Render a human-readable change log for audit output.
pub fn summarize_diff(before: &GoalSnapshot, after: &GoalSnapshot) -> String {
    let diff = diff_goals(before, after);
    if diff.is_empty() {
        return "sub-goals unchanged".to_string();
    }
    let mut lines = Vec::new();
    if !diff.added.is_empty() {
        lines.push(format!("added: {}", quote_all(&diff.added)));
    }
    if !diff.removed.is_empty() {
        lines.push(format!("removed: {}", quote_all(&diff.removed)));
    }
    if diff.reordered {
        lines.push(format!("reordered: {}", quote_all(&after.sub_goals)));
    }
    if let Some((from, to)) = &diff.focus {
        lines.push(format!(
            "focus: {} -> {}",
            describe_focus(from.as_deref()),
            describe_focus(to.as_deref())
        ));
    }
    lines.join("\n")
}

/// A parsed `update_goals` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalEdit {
    Insert {
        items: Vec<String>,
        index: Option<usize>,
    },
    Remove {
        indices: Vec<usize>,
    },
    Reorder {
        permutation: Vec<usize>,
    },
    Focus {
        index: usize,
    },
}

impl GoalEdit {
    /// Read `{op, items?, index?, indices?, permutation?}` tool arguments.
    pub fn from_arguments(arguments: &Map<String, Value>) -> Result<Self, String> {
        let op = arguments
            .get("op")
            .and_then(Value::as_str)
            .ok_or("missing 'op'")?;
        match op {
            "insert" => Ok(GoalEdit::Insert {
                items: string_list(arguments, "items")?,
                index: optional_index(arguments, "index")?,
            }),
            "remove" => Ok(GoalEdit::Remove {
                indices: index_list(arguments, "indices")?,
            }),
            "reorder" => Ok(GoalEdit::Reorder {
                permutation: index_list(arguments, "permutation")?,
            }),
            "focus" => Ok(GoalEdit::Focus {
                index: optional_index(arguments, "index")?.ok_or("focus requires 'index'")?,
            }),
            other => Err(format!("unknown op '{other}'")),
        }
    }

    pub fn apply(&self, goals: &[String], current: usize) -> Result<GoalStack, GoalError> {
        Ok(match self {
            GoalEdit::Insert { items, index } => insert_goals(goals, current, items, *index),
            GoalEdit::Remove { indices } => remove_goals(goals, current, indices),
            GoalEdit::Reorder { permutation } => reorder_goals(goals, current, permutation)?,
            GoalEdit::Focus { index } => set_current(goals, *index),
        })
    }
}

fn string_list(arguments: &Map<String, Value>, key: &str) -> Result<Vec<String>, String> {
    let items = arguments
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("'{key}' must be an array of strings"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("'{key}' must contain only strings"))
        })
        .collect()
}

fn index_list(arguments: &Map<String, Value>, key: &str) -> Result<Vec<usize>, String> {
    let items = arguments
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("'{key}' must be an array of indices"))?;
    items.iter().map(|item| as_index(item, key)).collect()
}

fn optional_index(arguments: &Map<String, Value>, key: &str) -> Result<Option<usize>, String> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => as_index(value, key).map(Some),
    }
}

fn as_index(value: &Value, key: &str) -> Result<usize, String> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| format!("'{key}' must hold non-negative integers"))
}

fn quote_all(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("'{item}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_focus(goal: Option<&str>) -> String {
    match goal {
        Some(goal) => format!("'{goal}'"),
        None => "(none)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn goals(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn snapshot(items: &[&str], current: usize) -> GoalSnapshot {
        GoalSnapshot {
            goal: "task".to_string(),
            sub_goals: goals(items),
            current_index: current,
        }
    }

    #[test]
    fn removing_focused_first_goal_keeps_position() {
        let stack = remove_goals(&goals(&["a", "b", "c"]), 0, &[0]);
        assert_eq!(stack.goals, goals(&["b", "c"]));
        assert_eq!(stack.current, 0);
    }

    #[test]
    fn removing_focused_last_goal_moves_to_new_last() {
        let stack = remove_goals(&goals(&["a", "b", "c"]), 2, &[2]);
        assert_eq!(stack.goals, goals(&["a", "b"]));
        assert_eq!(stack.current, 1);
    }

    #[test]
    fn removing_before_focus_shifts_left() {
        let stack = remove_goals(&goals(&["a", "b", "c", "d"]), 3, &[0, 2]);
        assert_eq!(stack.goals, goals(&["b", "d"]));
        assert_eq!(stack.current_goal(), Some("d"));
    }

    #[test]
    fn remove_ignores_out_of_range_and_duplicates() {
        let stack = remove_goals(&goals(&["a", "b"]), 1, &[7, 0, 0]);
        assert_eq!(stack.goals, goals(&["b"]));
        assert_eq!(stack.current, 0);
    }

    #[test]
    fn insert_appends_when_index_unset() {
        let stack = insert_goals(&goals(&["a"]), 0, &goals(&["b", "c"]), None);
        assert_eq!(stack.goals, goals(&["a", "b", "c"]));
        assert_eq!(stack.current, 0);
    }

    #[test]
    fn insert_clamps_index_past_end() {
        let stack = insert_goals(&goals(&["a"]), 0, &goals(&["z"]), Some(10));
        assert_eq!(stack.goals, goals(&["a", "z"]));
    }

    #[test]
    fn insert_into_empty_focuses_first() {
        let stack = insert_goals(&[], 5, &goals(&["a"]), Some(0));
        assert_eq!(stack.goals, goals(&["a"]));
        assert_eq!(stack.current, 0);
    }

    #[test]
    fn reorder_moves_focus_with_item() {
        let stack = reorder_goals(&goals(&["a", "b", "c"]), 0, &[2, 0, 1]).expect("reorder");
        assert_eq!(stack.goals, goals(&["c", "a", "b"]));
        assert_eq!(stack.current_goal(), Some("a"));
    }

    #[test]
    fn reorder_rejects_non_bijection() {
        let err = reorder_goals(&goals(&["a", "b"]), 0, &[0, 0]).unwrap_err();
        assert!(err.to_string().contains("not a bijection"));
        assert!(reorder_goals(&goals(&["a", "b"]), 0, &[0]).is_err());
        assert!(reorder_goals(&goals(&["a", "b"]), 0, &[0, 2]).is_err());
    }

    #[test]
    fn operations_on_empty_list_are_empty() {
        assert_eq!(remove_goals(&[], 3, &[0]), GoalStack::default());
        assert_eq!(
            reorder_goals(&[], 3, &[1, 0]).expect("empty"),
            GoalStack::default()
        );
        assert_eq!(set_current(&[], 9), GoalStack::default());
    }

    #[test]
    fn set_current_clamps() {
        let stack = set_current(&goals(&["a", "b"]), 9);
        assert_eq!(stack.current, 1);
    }

    #[test]
    fn summary_reports_each_change_kind() {
        let before = snapshot(&["a", "b", "c"], 0);
        let after = snapshot(&["c", "b", "d"], 1);
        let summary = summarize_diff(&before, &after);
        assert!(summary.contains("added: 'd'"));
        assert!(summary.contains("removed: 'a'"));
        assert!(summary.contains("reordered: 'c', 'b', 'd'"));
        assert!(summary.contains("focus: 'a' -> 'b'"));
    }

    #[test]
    fn summary_for_identical_snapshots() {
        let snap = snapshot(&["a"], 0);
        assert_eq!(summarize_diff(&snap, &snap), "sub-goals unchanged");
    }

    #[test]
    fn removal_alone_is_not_a_reorder() {
        let diff = diff_goals(&snapshot(&["a", "b", "c"], 0), &snapshot(&["a", "c"], 0));
        assert_eq!(diff.removed, goals(&["b"]));
        assert!(!diff.reordered);
        assert!(diff.focus.is_none());
    }

    #[test]
    fn goal_edit_parses_and_applies() {
        let args = serde_json::json!({"op": "insert", "items": ["x"], "index": 1});
        let edit = GoalEdit::from_arguments(args.as_object().expect("object")).expect("edit");
        let stack = edit.apply(&goals(&["a", "b"]), 1).expect("apply");
        assert_eq!(stack.goals, goals(&["a", "x", "b"]));

        let args = serde_json::json!({"op": "reorder", "permutation": [0, 0]});
        let edit = GoalEdit::from_arguments(args.as_object().expect("object")).expect("edit");
        assert!(edit.apply(&goals(&["a", "b"]), 0).is_err());
    }

    #[test]
    fn goal_edit_rejects_malformed_arguments() {
        for args in [
            serde_json::json!({}),
            serde_json::json!({"op": "spin"}),
            serde_json::json!({"op": "insert"}),
            serde_json::json!({"op": "remove", "indices": [-1]}),
            serde_json::json!({"op": "focus"}),
        ] {
            assert!(GoalEdit::from_arguments(args.as_object().expect("object")).is_err());
        }
    }

    proptest! {
        #[test]
        fn remove_then_reinsert_restores_list(
            items in proptest::collection::vec("[a-z]{1,3}", 1..8),
            raw_index in 0usize..8,
            current in 0usize..8,
        ) {
            let index = raw_index % items.len();
            let removed = remove_goals(&items, current, &[index]);
            let restored = insert_goals(
                &removed.goals,
                removed.current,
                &[items[index].clone()],
                Some(index),
            );
            prop_assert_eq!(restored.goals, items);
        }

        #[test]
        fn identity_reorder_is_a_no_op(
            items in proptest::collection::vec("[a-z]{1,3}", 0..8),
            current in 0usize..8,
        ) {
            let current = clamp_index(items.len(), current);
            let identity: Vec<usize> = (0..items.len()).collect();
            let stack = reorder_goals(&items, current, &identity).expect("identity");
            prop_assert_eq!(stack.goals, items);
            prop_assert_eq!(stack.current, current);
        }

        #[test]
        fn focus_always_in_bounds(
            items in proptest::collection::vec("[a-z]{1,3}", 0..8),
            current in 0usize..16,
            indices in proptest::collection::vec(0usize..10, 0..5),
        ) {
            let stack = remove_goals(&items, current, &indices);

            let focused = if items.is_empty() { 0 } else { current.min(items.len() - 1) };
            let kept: Vec<usize> = (0..items.len()).filter(|i| !indices.contains(i)).collect();
            let expected = match kept.iter().position(|&i| i == focused) {
                Some(position) => position,
                None if kept.is_empty() => 0,
                None => focused.min(kept.len() - 1),
            };
            let expected_goals: Vec<String> = kept.iter().map(|&i| items[i].clone()).collect();

            prop_assert_eq!(&stack.goals, &expected_goals);
            prop_assert_eq!(stack.current, expected);
            prop_assert!(stack.goals.is_empty() || stack.current < stack.goals.len());
        }
    }
}
