//! Reconciliation of a batch response against what was submitted.
//!
//! The server is the tiebreaker: whatever it says about a record wins over
//! local state. This module only decides; applying the plan to the store is
//! the write queue's job.
//!
//! # Rules
//!
//! 1. Every submitted client id lands in exactly one of `synced`,
//!    `rejected` or `unanswered`, in submission order
//! 2. If the server reports a record more than once, a success beats any
//!    failure (the server has the record, so it is synced); among failures
//!    the first reason is kept
//! 3. Outcomes for ids that were not submitted are collected in `unknown`
//!    and otherwise ignored
//! 4. A record with no outcome stays pending, exactly as after a
//!    transport failure

use crate::{BatchResponse, ClientId, Outcome, ServerId, SubmitBatch};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A record the server refused, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub client_id: ClientId,
    pub reason: String,
}

/// A record the server stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub client_id: ClientId,
    pub server_id: ServerId,
}

/// What to do with each submitted record after a batch round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    /// Mark these synced
    pub synced: Vec<Acknowledgment>,
    /// Leave pending, remember the reason
    pub rejected: Vec<Rejection>,
    /// Submitted but not mentioned in the response; leave pending
    pub unanswered: Vec<ClientId>,
    /// Mentioned in the response but never submitted; ignored
    pub unknown: Vec<ClientId>,
}

impl SyncPlan {
    /// True when every submitted record was accepted.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.unanswered.is_empty()
    }

    /// Number of submitted records that remain pending after this plan.
    pub fn still_pending(&self) -> usize {
        self.rejected.len() + self.unanswered.len()
    }
}

/// Build the plan for `submitted` given the server's `response`.
pub fn reconcile(submitted: &SubmitBatch, response: &BatchResponse) -> SyncPlan {
    let submitted_ids: HashSet<&str> = submitted.client_ids().map(String::as_str).collect();

    let mut verdicts: HashMap<&str, &Outcome> = HashMap::new();
    let mut unknown = Vec::new();
    let mut seen_unknown = HashSet::new();

    for result in &response.results {
        let id = result.client_id.as_str();
        if !submitted_ids.contains(id) {
            if seen_unknown.insert(id) {
                unknown.push(result.client_id.clone());
            }
            continue;
        }

        let replace = match verdicts.get(id) {
            None => true,
            Some(existing) => {
                matches!(existing, Outcome::Failure { .. }) && result.is_success()
            }
        };
        if replace {
            verdicts.insert(id, &result.outcome);
        }
    }

    let mut plan = SyncPlan {
        unknown,
        ..SyncPlan::default()
    };

    let mut planned = HashSet::new();
    for id in submitted.client_ids() {
        // a batch should not contain an id twice, but never plan one twice
        if !planned.insert(id.as_str()) {
            continue;
        }
        match verdicts.get(id.as_str()) {
            Some(Outcome::Success { server_id }) => plan.synced.push(Acknowledgment {
                client_id: id.clone(),
                server_id: server_id.clone(),
            }),
            Some(Outcome::Failure { reason }) => plan.rejected.push(Rejection {
                client_id: id.clone(),
                reason: reason.clone(),
            }),
            None => plan.unanswered.push(id.clone()),
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutboundRecord, Payload, RecordOutcome};

    fn batch(ids: &[&str]) -> SubmitBatch {
        let records: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| OutboundRecord::new(*id, Payload::new(), i as u64))
            .collect();
        SubmitBatch::from_records(&records)
    }

    fn response(results: Vec<RecordOutcome>) -> BatchResponse {
        BatchResponse { results }
    }

    #[test]
    fn all_accepted() {
        let plan = reconcile(
            &batch(&["a", "b"]),
            &response(vec![
                RecordOutcome::success("a", "srv-1"),
                RecordOutcome::success("b", "srv-2"),
            ]),
        );

        assert!(plan.is_complete());
        assert_eq!(plan.synced.len(), 2);
        assert_eq!(plan.synced[1].server_id, "srv-2");
    }

    #[test]
    fn one_rejected_does_not_block_others() {
        let plan = reconcile(
            &batch(&["a", "b", "c"]),
            &response(vec![
                RecordOutcome::success("a", "srv-1"),
                RecordOutcome::failure("b", "unknown account"),
                RecordOutcome::success("c", "srv-3"),
            ]),
        );

        let synced: Vec<_> = plan.synced.iter().map(|a| a.client_id.as_str()).collect();
        assert_eq!(synced, vec!["a", "c"]);
        assert_eq!(
            plan.rejected,
            vec![Rejection {
                client_id: "b".into(),
                reason: "unknown account".into()
            }]
        );
        assert_eq!(plan.still_pending(), 1);
    }

    #[test]
    fn missing_outcome_stays_pending() {
        let plan = reconcile(
            &batch(&["a", "b"]),
            &response(vec![RecordOutcome::success("a", "srv-1")]),
        );
        assert_eq!(plan.unanswered, vec!["b".to_string()]);
        assert!(!plan.is_complete());
    }

    #[test]
    fn success_beats_failure_for_same_id() {
        let plan = reconcile(
            &batch(&["a"]),
            &response(vec![
                RecordOutcome::failure("a", "duplicate"),
                RecordOutcome::success("a", "srv-1"),
                RecordOutcome::failure("a", "duplicate again"),
            ]),
        );
        assert_eq!(plan.synced.len(), 1);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn first_failure_reason_kept() {
        let plan = reconcile(
            &batch(&["a"]),
            &response(vec![
                RecordOutcome::failure("a", "first"),
                RecordOutcome::failure("a", "second"),
            ]),
        );
        assert_eq!(plan.rejected[0].reason, "first");
    }

    #[test]
    fn unknown_ids_are_reported_once() {
        let plan = reconcile(
            &batch(&["a"]),
            &response(vec![
                RecordOutcome::success("zzz", "srv-9"),
                RecordOutcome::success("a", "srv-1"),
                RecordOutcome::failure("zzz", "again"),
            ]),
        );
        assert_eq!(plan.unknown, vec!["zzz".to_string()]);
        assert_eq!(plan.synced.len(), 1);
    }

    #[test]
    fn empty_response_leaves_everything_pending() {
        let plan = reconcile(&batch(&["a", "b"]), &BatchResponse::default());
        assert_eq!(plan.unanswered.len(), 2);
        assert!(plan.synced.is_empty());
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_outcome(ids: usize) -> impl Strategy<Value = RecordOutcome> {
            (0..ids + 2, any::<bool>()).prop_map(|(i, ok)| {
                let id = format!("c-{i}");
                if ok {
                    RecordOutcome::success(id, format!("srv-{i}"))
                } else {
                    RecordOutcome::failure(id, "rejected")
                }
            })
        }

        proptest! {
            #[test]
            fn prop_every_submitted_id_planned_once(
                n in 1usize..8,
                outcomes in prop::collection::vec(arb_outcome(8), 0..16),
            ) {
                let ids: Vec<String> = (0..n).map(|i| format!("c-{i}")).collect();
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                let submitted = batch(&refs);
                let plan = reconcile(&submitted, &response(outcomes));

                let mut planned: Vec<String> = plan
                    .synced
                    .iter()
                    .map(|a| a.client_id.clone())
                    .chain(plan.rejected.iter().map(|r| r.client_id.clone()))
                    .chain(plan.unanswered.iter().cloned())
                    .collect();
                planned.sort();
                let mut expected = ids.clone();
                expected.sort();
                prop_assert_eq!(planned, expected);

                for unknown in &plan.unknown {
                    prop_assert!(!ids.contains(unknown));
                }
            }

            #[test]
            fn prop_reconcile_deterministic(
                outcomes in prop::collection::vec(arb_outcome(4), 0..10),
            ) {
                let submitted = batch(&["c-0", "c-1", "c-2", "c-3"]);
                let response = response(outcomes);
                prop_assert_eq!(reconcile(&submitted, &response), reconcile(&submitted, &response));
            }
        }
    }
}
