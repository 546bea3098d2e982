//! Bulk writes packed into payload-bounded windows.
//!
//! Items are packed greedily by serialized size plus a fixed per-item
//! overhead. When the provider still rejects a window as too large, the
//! window shrinks by one item and the same remaining items are resubmitted;
//! a single item that is still too large is reported terminal. Every input
//! item ends with exactly one [`ItemOutcome`].

use std::ops::Range;

use async_trait::async_trait;
use entable_storage::{BatchOp, BatchSubmission, TableStore};
use entable_types::{KeyPair, PropertyBag};
use futures::StreamExt;
use futures::stream;
use tracing::{debug, warn};

use crate::config::BatchLimits;
use crate::error::{EngineError, EngineResult};
use crate::registry::Entity;
use crate::table::Table;

/// Provider response to one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowResult {
    /// Accepted; one outcome per item, in order.
    Accepted(Vec<ItemOutcome>),
    /// Rejected as a whole for exceeding the payload ceiling.
    TooLarge,
}

/// Final status of one input item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    /// The provider processed the item but refused it (e.g. key occupied).
    Rejected(String),
    /// Too large to submit even alone.
    PayloadTooLarge,
    /// The window carrying the item failed.
    Failed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded)
    }
}

/// Destination of batched items.
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    type Item: Send + Sync;

    /// Serialized size of an item, without the per-item overhead.
    fn item_size(&self, item: &Self::Item) -> usize;

    /// Items with different groups never share a window.
    fn group<'a>(&self, _item: &'a Self::Item) -> Option<&'a str> {
        None
    }

    async fn submit(&self, window: &[Self::Item]) -> EngineResult<WindowResult>;
}

/// One accepted provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedWindow {
    /// Index of the first item, in submission order. Table bulk writes
    /// submit items sorted by partition key, so this is not an input index.
    pub start: usize,
    pub len: usize,
    /// Estimated bytes, overhead included.
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<ItemOutcome>,
    /// Accepted submissions ordered by `start`.
    pub windows: Vec<SubmittedWindow>,
    /// How many times a window was shrunk after a too-large response.
    pub shrinks: usize,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(ItemOutcome::is_success)
    }

    /// Indices and outcomes of items that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &ItemOutcome)> {
        self.outcomes.iter().enumerate().filter(|(_, o)| !o.is_success())
    }
}

/// Windows planned from item costs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowPlan {
    pub windows: Vec<Range<usize>>,
    /// Items whose cost alone exceeds the byte ceiling.
    pub oversized: Vec<usize>,
}

/// Greedy packing of `costs` (overhead already included) under `limits`.
pub fn plan_windows(costs: &[usize], limits: &BatchLimits) -> WindowPlan {
    plan_grouped(costs, limits, |_, _| true)
}

fn plan_grouped(
    costs: &[usize],
    limits: &BatchLimits,
    same_group: impl Fn(usize, usize) -> bool,
) -> WindowPlan {
    let mut plan = WindowPlan::default();
    let mut start = 0;
    let mut bytes = 0;
    let mut count = 0;

    for (i, &cost) in costs.iter().enumerate() {
        if limits.max_bytes.is_some_and(|max| cost > max) {
            if count > 0 {
                plan.windows.push(start..i);
            }
            plan.oversized.push(i);
            (start, bytes, count) = (i + 1, 0, 0);
            continue;
        }
        let fits = count == 0
            || (limits.max_count.is_none_or(|max| count < max)
                && limits.max_bytes.is_none_or(|max| bytes + cost <= max)
                && same_group(start, i));
        if !fits {
            plan.windows.push(start..i);
            (start, bytes, count) = (i, 0, 0);
        }
        bytes += cost;
        count += 1;
    }
    if count > 0 {
        plan.windows.push(start..costs.len());
    }
    plan
}

#[derive(Default)]
struct WindowRun {
    outcomes: Vec<(usize, ItemOutcome)>,
    windows: Vec<SubmittedWindow>,
    shrinks: usize,
}

/// Packs `items` into windows and submits them, at most
/// `limits.parallelism` windows in flight.
pub async fn run_batches<S: BatchSubmitter>(
    submitter: &S,
    items: &[S::Item],
    limits: &BatchLimits,
) -> EngineResult<BatchReport> {
    limits.validate()?;
    let costs: Vec<usize> = items
        .iter()
        .map(|item| submitter.item_size(item) + limits.per_item_overhead)
        .collect();
    let plan = plan_grouped(&costs, limits, |a, b| {
        submitter.group(&items[a]) == submitter.group(&items[b])
    });
    debug!(
        items = items.len(),
        windows = plan.windows.len(),
        oversized = plan.oversized.len(),
        "batch planned"
    );

    let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; items.len()];
    for &i in &plan.oversized {
        warn!(item = i, bytes = costs[i], "item exceeds batch ceiling on its own");
        outcomes[i] = Some(ItemOutcome::PayloadTooLarge);
    }

    let runs: Vec<WindowRun> = stream::iter(plan.windows)
        .map(|window| submit_window(submitter, items, &costs, window))
        .buffer_unordered(limits.parallelism)
        .collect()
        .await;

    let mut report = BatchReport::default();
    for run in runs {
        for (i, outcome) in run.outcomes {
            outcomes[i] = Some(outcome);
        }
        report.windows.extend(run.windows);
        report.shrinks += run.shrinks;
    }
    report.windows.sort_by_key(|w| w.start);
    report.outcomes = outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| ItemOutcome::Failed("item was never submitted".into())))
        .collect();
    Ok(report)
}

async fn submit_window<S: BatchSubmitter>(
    submitter: &S,
    items: &[S::Item],
    costs: &[usize],
    window: Range<usize>,
) -> WindowRun {
    let mut run = WindowRun::default();
    let mut cap = window.len();
    let mut pos = window.start;

    while pos < window.end {
        let take = cap.min(window.end - pos);
        let slice = pos..pos + take;
        let bytes: usize = costs[slice.clone()].iter().sum();
        match submitter.submit(&items[slice.clone()]).await {
            Ok(WindowResult::Accepted(results)) => {
                debug!(start = pos, len = take, bytes, "window accepted");
                run.windows.push(SubmittedWindow {
                    start: pos,
                    len: take,
                    bytes,
                });
                let mut results = results.into_iter();
                for i in slice {
                    let outcome = results.next().unwrap_or_else(|| {
                        ItemOutcome::Failed("provider returned no result for item".into())
                    });
                    run.outcomes.push((i, outcome));
                }
                pos += take;
            }
            Ok(WindowResult::TooLarge) if take > 1 => {
                cap = take - 1;
                run.shrinks += 1;
                debug!(start = pos, from = take, to = cap, "window too large, shrinking");
            }
            Ok(WindowResult::TooLarge) => {
                warn!(item = pos, bytes, "single item rejected as too large");
                run.outcomes.push((pos, ItemOutcome::PayloadTooLarge));
                pos += 1;
            }
            Err(e) => {
                warn!(start = pos, len = take, error = %e, "window submission failed");
                for i in slice {
                    run.outcomes.push((i, ItemOutcome::Failed(e.to_string())));
                }
                pos += take;
            }
        }
    }
    run
}

/// Submits [`BatchOp`]s to a table, one partition per window.
struct TableSubmitter<'a> {
    store: &'a dyn TableStore,
    table: &'a str,
}

#[async_trait]
impl BatchSubmitter for TableSubmitter<'_> {
    type Item = BatchOp;

    fn item_size(&self, item: &BatchOp) -> usize {
        item.payload_size()
    }

    fn group<'a>(&self, item: &'a BatchOp) -> Option<&'a str> {
        Some(&item.keys.partition_key)
    }

    async fn submit(&self, window: &[BatchOp]) -> EngineResult<WindowResult> {
        Ok(match self.store.submit_batch(self.table, window).await? {
            BatchSubmission::Applied(results) => WindowResult::Accepted(
                results
                    .into_iter()
                    .map(|r| {
                        if r.is_success() {
                            ItemOutcome::Succeeded
                        } else {
                            ItemOutcome::Rejected(format!("{r:?}"))
                        }
                    })
                    .collect(),
            ),
            BatchSubmission::PayloadTooLarge => WindowResult::TooLarge,
        })
    }
}

impl<E: Entity> Table<E> {
    /// Bulk insert. Bypasses blob spill; occupied keys are reported per item.
    ///
    /// Bulk writes cannot run modifiers, so tables that register any are
    /// refused with a configuration error before anything is written.
    pub async fn insert_many(&self, entities: &[E], limits: &BatchLimits) -> EngineResult<BatchReport> {
        let ops = self.bulk_ops(entities, BatchOp::insert)?;
        self.run_bulk(ops, limits).await
    }

    /// Bulk insert-or-replace. Bypasses blob spill; refused on tables with
    /// modifiers.
    pub async fn upsert_many(&self, entities: &[E], limits: &BatchLimits) -> EngineResult<BatchReport> {
        let ops = self.bulk_ops(entities, BatchOp::upsert)?;
        self.run_bulk(ops, limits).await
    }

    /// Bulk unconditional delete; refused on tables with modifiers.
    pub async fn delete_many(&self, keys: &[KeyPair], limits: &BatchLimits) -> EngineResult<BatchReport> {
        let ops = keys.iter().map(|k| BatchOp::delete(k.clone(), None)).collect();
        self.run_bulk(ops, limits).await
    }

    fn bulk_ops(
        &self,
        entities: &[E],
        op: fn(KeyPair, PropertyBag) -> BatchOp,
    ) -> EngineResult<Vec<BatchOp>> {
        entities
            .iter()
            .map(|entity| -> EngineResult<BatchOp> {
                let bag = self.registration().mapper().to_bag(entity)?;
                let keys = self.registration().key_spec().derive(&bag)?;
                Ok(op(keys, bag))
            })
            .collect()
    }

    /// Orders ops by partition so windows stay single-partition, then maps
    /// outcomes back to input order. Window `start`s keep indexing the
    /// partition-sorted submission order.
    async fn run_bulk(&self, ops: Vec<BatchOp>, limits: &BatchLimits) -> EngineResult<BatchReport> {
        let modifiers = self.registration().modifier_names();
        if !modifiers.is_empty() {
            return Err(EngineError::Configuration(format!(
                "table `{}` has modifiers ({}); bulk writes would bypass them",
                self.name(),
                modifiers.join(", ")
            )));
        }
        let mut order: Vec<usize> = (0..ops.len()).collect();
        order.sort_by(|&a, &b| ops[a].keys.partition_key.cmp(&ops[b].keys.partition_key));
        let mut slots: Vec<Option<BatchOp>> = ops.into_iter().map(Some).collect();
        let sorted: Vec<BatchOp> = order.iter().filter_map(|&i| slots[i].take()).collect();

        let submitter = TableSubmitter {
            store: self.store(),
            table: self.name(),
        };
        let mut report = run_batches(&submitter, &sorted, limits).await?;

        let mut outcomes = vec![ItemOutcome::Failed("item was never submitted".into()); order.len()];
        for (position, outcome) in report.outcomes.into_iter().enumerate() {
            outcomes[order[position]] = outcome;
        }
        report.outcomes = outcomes;
        Ok(report)
    }
}
