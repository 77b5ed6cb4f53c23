use serde::{Deserialize, Serialize};

use crate::contract::StoredObject;

pub const DEFAULT_KEY_PREFIX: &str = "assignment";
pub const DEFAULT_KEY_SUFFIX: &str = ".txt";
pub const DEFAULT_SIZE_BUDGET: u64 = 20;

/// Which objects the cleanup action may remove, and how much of them may stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub key_prefix: String,
    pub key_suffix: String,
    pub size_budget: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_suffix: DEFAULT_KEY_SUFFIX.to_string(),
            size_budget: DEFAULT_SIZE_BUDGET,
        }
    }
}

impl CleanupPolicy {
    pub fn is_eligible(&self, key: &str) -> bool {
        key.starts_with(&self.key_prefix) && key.ends_with(&self.key_suffix)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPlan {
    pub delete: Vec<StoredObject>,
    pub eligible_size_before: u64,
    pub eligible_size_after: u64,
}

impl CleanupPlan {
    pub fn is_noop(&self) -> bool {
        self.delete.is_empty()
    }
}

/// Picks eligible objects largest-first until the eligible total fits the
/// budget. Planning against a listing that already fits yields no deletions,
/// so repeated runs converge.
pub fn plan_cleanup(objects: &[StoredObject], policy: &CleanupPolicy) -> CleanupPlan {
    let mut eligible: Vec<&StoredObject> = objects
        .iter()
        .filter(|object| policy.is_eligible(&object.key))
        .collect();
    eligible.sort_by(|left, right| {
        right
            .size
            .cmp(&left.size)
            .then_with(|| left.key.cmp(&right.key))
    });

    let before: u64 = eligible.iter().map(|object| object.size).sum();
    let mut remaining = before;
    let mut delete = Vec::new();
    for object in eligible {
        if remaining <= policy.size_budget {
            break;
        }
        remaining -= object.size;
        delete.push(object.clone());
    }

    CleanupPlan {
        delete,
        eligible_size_before: before,
        eligible_size_after: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(key: &str, size: u64) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            size,
        }
    }

    #[test]
    fn removes_largest_object_when_over_budget() {
        let objects = vec![
            object("assignment1.txt", 19),
            object("assignment2.txt", 28),
            object("plot.svg", 4_000),
        ];

        let plan = plan_cleanup(&objects, &CleanupPolicy::default());
        assert_eq!(plan.delete, vec![object("assignment2.txt", 28)]);
        assert_eq!(plan.eligible_size_before, 47);
        assert_eq!(plan.eligible_size_after, 19);
    }

    #[test]
    fn keeps_removing_until_within_budget() {
        let objects = vec![
            object("assignment1.txt", 15),
            object("assignment2.txt", 15),
            object("assignment3.txt", 15),
        ];

        let plan = plan_cleanup(&objects, &CleanupPolicy::default());
        assert_eq!(plan.delete.len(), 2);
        assert_eq!(plan.eligible_size_after, 15);
    }

    #[test]
    fn plan_is_empty_once_within_budget() {
        let objects = vec![object("assignment3.txt", 2)];
        assert!(plan_cleanup(&objects, &CleanupPolicy::default()).is_noop());
        assert!(plan_cleanup(&[], &CleanupPolicy::default()).is_noop());
    }

    #[test]
    fn ignores_ineligible_keys() {
        let objects = vec![object("plot.svg", 500), object("notes/assignment.txt", 50)];
        assert!(plan_cleanup(&objects, &CleanupPolicy::default()).is_noop());
    }
}
