//! Bundle packer.
//!
//! Groups validated data items into size- and count-bounded bundle plans for
//! the downstream aggregator. Pure and deterministic: the same items in the
//! same order with the same parameters always produce the same plans.

use std::collections::BTreeMap;

use anchorage_primitives::{ByteCount, DataItemId};
use serde::{Deserialize, Serialize};

/// Packing bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerParams {
    /// Cap on the summed size of one plan.
    pub max_total_data_items_byte_count: ByteCount,
    /// Items above this are not packable at all.
    pub max_single_data_item_byte_count: ByteCount,
    /// Cap on the number of items in one plan.
    pub max_data_items_count: usize,
    /// Age at which a member marks its plan overdue.
    pub overdue_threshold_ms: u64,
}

/// One item offered to the packer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannableItem {
    pub id: DataItemId,
    pub byte_count: ByteCount,
    /// Unix milliseconds at which the item was uploaded.
    pub uploaded_timestamp: u64,
}

/// An immutable packing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePlan {
    /// Member ids, ascending by size (stable for equal sizes).
    pub data_item_ids: Vec<DataItemId>,
    pub total_byte_count: ByteCount,
    pub contains_overdue_data_items: bool,
    /// Per-member sizes, for the bundler's accounting.
    pub sizes: BTreeMap<DataItemId, ByteCount>,
}

/// First-fit packing of `items`, in input order, into bounded plans.
///
/// `now_ms` anchors the overdue check so the function stays pure.
pub fn plan_bundles(
    items: impl IntoIterator<Item = PlannableItem>,
    params: &PackerParams,
    now_ms: u64,
) -> Vec<BundlePlan> {
    let mut open: Vec<OpenPlan> = Vec::new();

    for item in items {
        if item.byte_count > params.max_single_data_item_byte_count {
            tracing::warn!(
                id = %item.id,
                byte_count = item.byte_count.as_u64(),
                "discarding item above the single-item cap"
            );
            continue;
        }
        // Oversized-for-a-shared-bundle items ride alone.
        if item.byte_count > params.max_total_data_items_byte_count {
            open.push(OpenPlan::seeded(item, params, now_ms));
            continue;
        }
        let fit = open.iter_mut().find(|plan| plan.accepts(&item, params));
        match fit {
            Some(plan) => plan.push(item, params, now_ms),
            None => open.push(OpenPlan::seeded(item, params, now_ms)),
        }
    }

    open.into_iter().map(OpenPlan::close).collect()
}

#[derive(Debug)]
struct OpenPlan {
    members: Vec<(DataItemId, ByteCount)>,
    total: ByteCount,
    overdue: bool,
}

impl OpenPlan {
    fn seeded(item: PlannableItem, params: &PackerParams, now_ms: u64) -> Self {
        let mut plan = Self {
            members: Vec::new(),
            total: ByteCount(0),
            overdue: false,
        };
        plan.push(item, params, now_ms);
        plan
    }

    fn accepts(&self, item: &PlannableItem, params: &PackerParams) -> bool {
        let remaining = params
            .max_total_data_items_byte_count
            .saturating_sub(self.total);
        item.byte_count <= remaining && self.members.len() + 1 <= params.max_data_items_count
    }

    fn push(&mut self, item: PlannableItem, params: &PackerParams, now_ms: u64) {
        if now_ms.saturating_sub(item.uploaded_timestamp) > params.overdue_threshold_ms {
            self.overdue = true;
        }
        self.total += item.byte_count;
        self.members.push((item.id, item.byte_count));
    }

    fn close(mut self) -> BundlePlan {
        // Ascending by size; sort_by_key is stable, so equal sizes keep
        // their arrival order and the output stays reproducible.
        self.members.sort_by_key(|(_, byte_count)| *byte_count);
        BundlePlan {
            data_item_ids: self.members.iter().map(|(id, _)| *id).collect(),
            total_byte_count: self.total,
            contains_overdue_data_items: self.overdue,
            sizes: self.members.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn params(max_total: u64, max_single: u64, max_count: usize) -> PackerParams {
        PackerParams {
            max_total_data_items_byte_count: ByteCount(max_total),
            max_single_data_item_byte_count: ByteCount(max_single),
            max_data_items_count: max_count,
            overdue_threshold_ms: 60_000,
        }
    }

    fn item(seed: u8, byte_count: u64, uploaded: u64) -> PlannableItem {
        PlannableItem {
            id: DataItemId::from_bytes([seed; 32]),
            byte_count: ByteCount(byte_count),
            uploaded_timestamp: uploaded,
        }
    }

    #[test]
    fn first_fit_example() {
        // Sizes {2, 2, 2, 3} with max_total 5 pack as {2,2} and {2,3}.
        let plans = plan_bundles(
            vec![
                item(1, 2, 1000),
                item(2, 2, 1000),
                item(3, 2, 1000),
                item(4, 3, 1000),
            ],
            &params(5, 10, 10),
            1000,
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].total_byte_count, ByteCount(4));
        assert_eq!(plans[1].total_byte_count, ByteCount(5));
        let sizes: Vec<Vec<u64>> = plans
            .iter()
            .map(|plan| {
                plan.data_item_ids
                    .iter()
                    .map(|id| plan.sizes[id].as_u64())
                    .collect()
            })
            .collect();
        assert_eq!(sizes, vec![vec![2, 2], vec![2, 3]]);
    }

    #[test]
    fn items_above_single_cap_are_discarded() {
        let plans = plan_bundles(
            vec![item(1, 100, 0), item(2, 3, 0)],
            &params(10, 50, 10),
            0,
        );
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].data_item_ids.len(), 1);
    }

    #[test]
    fn items_above_bundle_total_get_dedicated_plans() {
        // 40 exceeds max_total 10 but not max_single 50.
        let plans = plan_bundles(
            vec![item(1, 40, 0), item(2, 40, 0), item(3, 2, 0)],
            &params(10, 50, 10),
            0,
        );
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].total_byte_count, ByteCount(40));
        assert_eq!(plans[1].total_byte_count, ByteCount(40));
        assert_eq!(plans[2].total_byte_count, ByteCount(2));
    }

    #[test]
    fn count_cap_opens_new_plans() {
        let items: Vec<_> = (0..5).map(|i| item(i, 1, 0)).collect();
        let plans = plan_bundles(items, &params(100, 100, 2), 0);
        assert_eq!(plans.len(), 3);
        assert!(plans.iter().all(|plan| plan.data_item_ids.len() <= 2));
    }

    #[test]
    fn overdue_members_mark_their_plan() {
        let plans = plan_bundles(
            vec![item(1, 1, 100), item(2, 1, 99_000)],
            &params(100, 100, 10),
            100_000,
        );
        assert_eq!(plans.len(), 1);
        assert!(plans[0].contains_overdue_data_items);

        let fresh = plan_bundles(vec![item(3, 1, 99_000)], &params(100, 100, 10), 100_000);
        assert!(!fresh[0].contains_overdue_data_items);
    }

    #[test]
    fn ids_sort_ascending_by_size_within_a_plan() {
        let plans = plan_bundles(
            vec![item(1, 9, 0), item(2, 1, 0), item(3, 5, 0)],
            &params(100, 100, 10),
            0,
        );
        let sizes: Vec<u64> = plans[0]
            .data_item_ids
            .iter()
            .map(|id| plans[0].sizes[id].as_u64())
            .collect();
        assert_eq!(sizes, vec![1, 5, 9]);
    }

    #[test]
    fn packing_is_deterministic() {
        let items: Vec<_> = (0..40).map(|i| item(i, u64::from(i % 7) + 1, 0)).collect();
        let a = plan_bundles(items.clone(), &params(12, 6, 5), 0);
        let b = plan_bundles(items, &params(12, 6, 5), 0);
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn plan_invariants_hold(
            sizes in proptest::collection::vec(1u64..64, 0..200),
            max_total in 8u64..128,
            max_count in 1usize..12,
        ) {
            let max_single = max_total / 2 + 8;
            let params = params(max_total, max_single, max_count);
            let items: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| item(i as u8, *size, 0))
                .collect();
            let plans = plan_bundles(items, &params, 0);

            for plan in &plans {
                let sum: u64 = plan.sizes.values().map(|b| b.as_u64()).sum();
                prop_assert_eq!(sum, plan.total_byte_count.as_u64());
                prop_assert!(plan.data_item_ids.len() <= max_count);
                // Either the plan fits the shared cap, or it is a dedicated
                // single-item plan for an over-total item.
                if plan.data_item_ids.len() > 1 {
                    prop_assert!(plan.total_byte_count.as_u64() <= max_total);
                }
                for byte_count in plan.sizes.values() {
                    prop_assert!(*byte_count <= params.max_single_data_item_byte_count);
                }
            }

            // Every admitted item appears exactly once across the plans.
            let packed: usize = plans.iter().map(|plan| plan.data_item_ids.len()).sum();
            let admitted = sizes.iter().filter(|size| **size <= max_single).count();
            prop_assert_eq!(packed, admitted);
        }
    }
}
