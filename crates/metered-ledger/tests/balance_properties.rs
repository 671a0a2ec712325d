// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests for the net balance effect of start + finalize.

use std::sync::Arc;

use metered_config::model::LedgerConfig;
use metered_core::{Feature, Transition, UserId};
use metered_ledger::{Ledger, MemoryBalanceStore, MemoryOperationStore};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Balance after granting `initial`, reserving `estimate` and settling at `cost`.
fn settle_once(initial: u64, estimate: u64, cost: u64, refund: bool, repeats: usize) -> u64 {
    runtime().block_on(async {
        let ledger = Ledger::new(
            Arc::new(MemoryBalanceStore::new()),
            Arc::new(MemoryOperationStore::new()),
            LedgerConfig::default(),
        );
        let user = UserId::new("prop");
        ledger.grant(&user, initial).await.unwrap();
        let id = ledger
            .start(&user, Feature::Text, estimate, serde_json::Value::Null)
            .await
            .unwrap();
        let transition = if refund {
            Transition::refund(None, None)
        } else {
            Transition::success(cost, None)
        };
        for _ in 0..repeats {
            ledger.finalize(&id, transition.clone()).await.unwrap();
        }
        ledger.balance(&user).await.unwrap()
    })
}

proptest! {
    #[test]
    fn success_nets_actual_cost(
        estimate in 0u64..1_000,
        cost in 0u64..1_000,
        slack in 0u64..1_000,
        repeats in 1usize..4,
    ) {
        // Enough headroom that a surcharge is always collectable.
        let initial = estimate.max(cost) + slack + 1;
        let after = settle_once(initial, estimate, cost, false, repeats);
        prop_assert_eq!(after, initial - cost);
    }

    #[test]
    fn refund_nets_zero(
        estimate in 0u64..1_000,
        slack in 0u64..1_000,
        repeats in 1usize..4,
    ) {
        let initial = estimate + slack;
        prop_assume!(initial > 0);
        let after = settle_once(initial, estimate, 0, true, repeats);
        prop_assert_eq!(after, initial);
    }

    #[test]
    fn balance_never_goes_negative(
        initial in 1u64..100,
        estimate in 0u64..100,
        cost in 0u64..500,
    ) {
        prop_assume!(estimate <= initial);
        let after = settle_once(initial, estimate, cost, false, 1);
        prop_assert_eq!(after, initial.saturating_sub(cost));
    }
}
