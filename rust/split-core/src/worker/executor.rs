// rust/split-core/src/worker/executor.rs

//! Local execution of pipeline trees.
//!
//! Every node becomes a boxed iterator. In split mode each source node pulls
//! index ranges from the dispatcher instead of walking its own element space,
//! and every enclosing repeat contributes one counter to the epoch path sent
//! with those requests.

use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};
use twox_hash::XxHash64;

use crate::dispatcher::{DispatcherClient, SourceId, Split, SplitRequest, SplitResponse};
use crate::error::{Result, SplitError};
use crate::pipeline::{DatasetFn, Element, ElementIter, PipelineNode};

/// Consecutive empty passes of an infinite repeat taken without sleeping.
/// A worker that fell behind skips stale repetitions this way.
const FREE_EMPTY_PASSES: u32 = 256;

/// Shared state of one worker task.
pub(crate) struct TaskContext {
    pub(crate) client: Arc<dyn DispatcherClient>,
    pub(crate) job_id: String,
    pub(crate) worker_id: String,
    /// Worker-wide stop flag.
    pub(crate) stop: Arc<AtomicBool>,
    /// Set once the dispatcher answered `EndOfJob`.
    pub(crate) job_done: AtomicBool,
    pub(crate) empty_pass_backoff: Duration,
    pub(crate) max_empty_pass_backoff: Duration,
}

impl TaskContext {
    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.job_done.load(Ordering::Relaxed)
    }

    fn backoff(&self, consecutive_empty: u32) -> Duration {
        let factor = 1u32 << consecutive_empty.min(16);
        self.empty_pass_backoff
            .saturating_mul(factor)
            .min(self.max_empty_pass_backoff)
    }
}

#[derive(Clone)]
pub(crate) enum ExecMode {
    /// Every source walks its whole element space.
    Local,
    /// Sources pull splits for this task.
    Split(Arc<TaskContext>),
}

impl ExecMode {
    fn should_stop(&self) -> bool {
        match self {
            ExecMode::Local => false,
            ExecMode::Split(ctx) => ctx.should_stop(),
        }
    }
}

/// Runs `node` locally over its whole element space.
pub fn execute_local(node: &PipelineNode) -> Result<ElementIter> {
    let mut next_source = 0;
    build(node, &ExecMode::Local, &mut next_source, &[])
}

/// Builds the iterator for `node`.
///
/// `next_source` is the id of the first source in this subtree and is
/// advanced past every source it contains. `epochs` holds one iteration
/// counter per enclosing repeat, outermost first.
pub(crate) fn build(
    node: &PipelineNode,
    mode: &ExecMode,
    next_source: &mut u32,
    epochs: &[Arc<AtomicU64>],
) -> Result<ElementIter> {
    let iter: ElementIter = match node {
        PipelineNode::Range { .. } | PipelineNode::TensorSlices(_) | PipelineNode::FromTensors(_) => {
            let source = SourceId(*next_source);
            *next_source += 1;
            match mode {
                ExecMode::Local => {
                    let node = node.clone();
                    let len = node.source_len().unwrap_or(0);
                    Box::new((0..len).map(move |i| node.source_element(i)))
                }
                ExecMode::Split(ctx) => Box::new(SplitSource {
                    node: node.clone(),
                    source,
                    epochs: epochs.to_vec(),
                    ctx: ctx.clone(),
                    current: None,
                    retries: 0,
                    done: false,
                }),
            }
        }
        PipelineNode::Map { input, func } => {
            let func = func.clone();
            let input = build(input, mode, next_source, epochs)?;
            Box::new(input.map(move |item| item.and_then(|e| func(e))))
        }
        PipelineNode::Filter { input, predicate } => {
            let predicate = predicate.clone();
            let input = build(input, mode, next_source, epochs)?;
            Box::new(input.filter_map(move |item| match item {
                Ok(e) => match predicate(&e) {
                    Ok(true) => Some(Ok(e)),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                },
                Err(e) => Some(Err(e)),
            }))
        }
        PipelineNode::Repeat { input, count } => {
            let base_source = *next_source;
            *next_source += input.source_count();
            let mut epochs = epochs.to_vec();
            epochs.push(Arc::new(AtomicU64::new(0)));
            Box::new(RepeatIter {
                input: input.clone(),
                count: *count,
                mode: mode.clone(),
                base_source,
                epochs,
                current: None,
                produced: false,
                empty_passes: 0,
                done: false,
            })
        }
        PipelineNode::Shuffle {
            input,
            buffer_size,
            seed,
        } => {
            let rng = seeded_rng(*seed, epochs);
            let input = build(input, mode, next_source, epochs)?;
            Box::new(ShuffleIter {
                input,
                buffer: Vec::with_capacity(*buffer_size),
                buffer_size: *buffer_size,
                rng,
                input_done: false,
            })
        }
        PipelineNode::Interleave {
            input,
            func,
            cycle_length,
            block_length,
        } => {
            let input = build(input, mode, next_source, epochs)?;
            Box::new(InterleaveIter::new(input, func.clone(), *cycle_length, *block_length))
        }
        PipelineNode::ParallelInterleave {
            input,
            func,
            cycle_length,
            ..
        } => {
            let input = build(input, mode, next_source, epochs)?;
            Box::new(InterleaveIter::new(input, func.clone(), *cycle_length, 1))
        }
        PipelineNode::FlatMap { input, func } => {
            let input = build(input, mode, next_source, epochs)?;
            Box::new(InterleaveIter::new(input, func.clone(), 1, 1))
        }
        PipelineNode::Zip(inputs) => {
            let children = build_all(inputs, mode, next_source, epochs)?;
            Box::new(ZipIter {
                children,
                done: false,
            })
        }
        PipelineNode::Concatenate(inputs) => {
            let children = build_all(inputs, mode, next_source, epochs)?;
            Box::new(children.into_iter().flatten())
        }
        PipelineNode::SampleFromDatasets {
            inputs,
            weights,
            seed,
        } => {
            let rng = seeded_rng(*seed, epochs);
            let children = build_all(inputs, mode, next_source, epochs)?;
            Box::new(SampleIter::new(children, weights.to_vec(), rng)?)
        }
        PipelineNode::ChooseFromDatasets { inputs, selector } => {
            let selector = build(selector, mode, next_source, epochs)?;
            let children = build_all(inputs, mode, next_source, epochs)?;
            let exhausted = vec![false; children.len()];
            Box::new(ChooseIter {
                selector,
                children,
                exhausted,
            })
        }
        PipelineNode::DataService(source) => source.open()?,
    };
    Ok(iter)
}

fn build_all(
    inputs: &[PipelineNode],
    mode: &ExecMode,
    next_source: &mut u32,
    epochs: &[Arc<AtomicU64>],
) -> Result<Vec<ElementIter>> {
    inputs
        .iter()
        .map(|input| build(input, mode, next_source, epochs))
        .collect()
}

/// Derives a per-pass RNG so that every repetition reshuffles differently
/// while staying reproducible for a fixed seed.
fn seeded_rng(seed: Option<u64>, epochs: &[Arc<AtomicU64>]) -> StdRng {
    match seed {
        Some(seed) => {
            let mut hasher = XxHash64::with_seed(seed);
            for epoch in epochs {
                hasher.write_u64(epoch.load(Ordering::Relaxed));
            }
            StdRng::seed_from_u64(hasher.finish())
        }
        None => StdRng::from_entropy(),
    }
}

/// Source leaf fed by dispatcher splits.
struct SplitSource {
    node: PipelineNode,
    source: SourceId,
    epochs: Vec<Arc<AtomicU64>>,
    ctx: Arc<TaskContext>,
    /// Split being produced and the next index to emit.
    current: Option<(Split, u64)>,
    /// Consecutive `Retry` answers.
    retries: u32,
    done: bool,
}

impl SplitSource {
    fn epoch_path(&self) -> Vec<u64> {
        self.epochs.iter().map(|e| e.load(Ordering::Relaxed)).collect()
    }

    fn complete(&self, split: &Split) {
        let ctx = &self.ctx;
        match ctx.client.complete_split(&ctx.job_id, &ctx.worker_id, split.id) {
            Ok(true) => {}
            Ok(false) => debug!(
                worker_id = %ctx.worker_id,
                split_id = split.id,
                "Split lease was revoked before completion"
            ),
            Err(e) => debug!(worker_id = %ctx.worker_id, split_id = split.id, error = %e, "Failed to complete split"),
        }
    }
}

impl Drop for SplitSource {
    fn drop(&mut self) {
        // A stopping worker leaves its last split leased so that it is
        // released and redelivered. Otherwise the rest of the split is no
        // longer wanted downstream.
        if let Some((split, _)) = self.current.take() {
            if !self.ctx.stop.load(Ordering::Relaxed) {
                self.complete(&split);
            }
        }
    }
}

impl Iterator for SplitSource {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        loop {
            if self.done {
                return None;
            }

            // A split is completed once the element after its last one is
            // asked for, i.e. after the downstream consumer took that element.
            if let Some((split, index)) = self.current.take() {
                if index < split.range.end {
                    let item = self.node.source_element(index);
                    self.current = Some((split, index + 1));
                    return Some(item);
                }
                self.complete(&split);
            }

            if self.ctx.should_stop() {
                self.done = true;
                return None;
            }

            let request = SplitRequest::new(self.source, self.epoch_path());
            let ctx = &self.ctx;
            match ctx.client.get_next_split(&ctx.job_id, &ctx.worker_id, &request) {
                Ok(SplitResponse::Split(split)) => {
                    trace!(source = %self.source, split_id = split.id, "Received split");
                    let start = split.range.start;
                    self.current = Some((split, start));
                    self.retries = 0;
                }
                Ok(SplitResponse::Retry) => {
                    trace!(source = %self.source, retries = self.retries, "Waiting for an outstanding split");
                    thread::sleep(ctx.backoff(self.retries));
                    self.retries = self.retries.saturating_add(1);
                }
                Ok(SplitResponse::EndOfEpoch) => {
                    self.done = true;
                    return None;
                }
                Ok(SplitResponse::EndOfJob) => {
                    ctx.job_done.store(true, Ordering::Relaxed);
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Re-runs its input, rebuilding it for every pass.
struct RepeatIter {
    input: Arc<PipelineNode>,
    count: Option<u64>,
    mode: ExecMode,
    /// Id of the first source under this repeat.
    base_source: u32,
    /// Enclosing counters followed by this repeat's own counter.
    epochs: Vec<Arc<AtomicU64>>,
    current: Option<ElementIter>,
    produced: bool,
    empty_passes: u32,
    done: bool,
}

impl RepeatIter {
    fn pass(&self) -> &AtomicU64 {
        // Always non-empty: `build` pushes this repeat's counter.
        &self.epochs[self.epochs.len() - 1]
    }

    fn start_pass(&mut self) -> Result<()> {
        let mut next_source = self.base_source;
        self.current = Some(build(&self.input, &self.mode, &mut next_source, &self.epochs)?);
        self.produced = false;
        Ok(())
    }

    fn end_pass(&mut self) -> bool {
        self.current = None;
        if self.mode.should_stop() {
            return false;
        }

        if self.produced {
            self.empty_passes = 0;
        } else {
            match &self.mode {
                // A pass that produced nothing locally will never produce.
                ExecMode::Local => return false,
                ExecMode::Split(ctx) if self.count.is_none() => {
                    self.empty_passes = self.empty_passes.saturating_add(1);
                    if self.empty_passes > FREE_EMPTY_PASSES {
                        thread::sleep(ctx.backoff(self.empty_passes - FREE_EMPTY_PASSES - 1));
                    }
                }
                ExecMode::Split(_) => {}
            }
        }

        let pass = self.pass().fetch_add(1, Ordering::Relaxed) + 1;
        trace!(pass, "Repeat advanced");
        true
    }
}

impl Iterator for RepeatIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        loop {
            if self.done {
                return None;
            }

            if self.current.is_none() {
                let pass = self.pass().load(Ordering::Relaxed);
                if self.count.is_some_and(|n| pass >= n) {
                    self.done = true;
                    return None;
                }
                if let Err(e) = self.start_pass() {
                    self.done = true;
                    return Some(Err(e));
                }
            }

            if let Some(item) = self.current.as_mut().and_then(Iterator::next) {
                self.produced = true;
                return Some(item);
            }

            if !self.end_pass() {
                self.done = true;
            }
        }
    }
}

struct ShuffleIter {
    input: ElementIter,
    buffer: Vec<Result<Element>>,
    buffer_size: usize,
    rng: StdRng,
    input_done: bool,
}

impl Iterator for ShuffleIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        while !self.input_done && self.buffer.len() < self.buffer_size {
            match self.input.next() {
                Some(item) => self.buffer.push(item),
                None => self.input_done = true,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(i))
    }
}

/// Round-robin over up to `cycle_length` open inner datasets, taking
/// `block_length` elements from each in turn.
struct InterleaveIter {
    input: ElementIter,
    func: DatasetFn,
    slots: VecDeque<ElementIter>,
    cycle_length: usize,
    block_length: usize,
    /// Elements taken from the front slot in the current block.
    taken: usize,
    input_done: bool,
}

impl InterleaveIter {
    fn new(input: ElementIter, func: DatasetFn, cycle_length: usize, block_length: usize) -> Self {
        Self {
            input,
            func,
            slots: VecDeque::with_capacity(cycle_length),
            cycle_length: cycle_length.max(1),
            block_length: block_length.max(1),
            taken: 0,
            input_done: false,
        }
    }

    /// Opens inner datasets until the cycle is full or the input ends.
    fn fill(&mut self) -> Result<()> {
        while !self.input_done && self.slots.len() < self.cycle_length {
            match self.input.next() {
                Some(outer) => {
                    let inner = (self.func)(outer?)?;
                    self.slots.push_back(execute_local(&inner)?);
                }
                None => self.input_done = true,
            }
        }
        Ok(())
    }

    fn rotate(&mut self) {
        if let Some(slot) = self.slots.pop_front() {
            self.slots.push_back(slot);
        }
        self.taken = 0;
    }
}

impl Iterator for InterleaveIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        loop {
            if let Err(e) = self.fill() {
                return Some(Err(e));
            }
            let slot = self.slots.front_mut()?;
            match slot.next() {
                Some(item) => {
                    self.taken += 1;
                    if self.taken >= self.block_length {
                        self.rotate();
                    }
                    return Some(item);
                }
                None => {
                    self.slots.pop_front();
                    self.taken = 0;
                }
            }
        }
    }
}

struct ZipIter {
    children: Vec<ElementIter>,
    done: bool,
}

impl Iterator for ZipIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        if self.done {
            return None;
        }
        let mut fields = Vec::with_capacity(self.children.len());
        let mut error = None;
        // Children are pulled in order so a short child stops the pull
        // before its siblings are asked for more. A failed field still
        // advances every sibling, so later tuples stay aligned.
        for child in &mut self.children {
            match child.next() {
                Some(Ok(e)) => fields.push(e),
                Some(Err(e)) => {
                    error.get_or_insert(e);
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        match error {
            Some(e) => Some(Err(e)),
            None if self.done => None,
            None => Some(Ok(Element::Tuple(fields))),
        }
    }
}

struct SampleIter {
    children: Vec<ElementIter>,
    weights: Vec<f64>,
    dist: Option<WeightedIndex<f64>>,
    rng: StdRng,
}

impl SampleIter {
    fn new(children: Vec<ElementIter>, weights: Vec<f64>, rng: StdRng) -> Result<Self> {
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| SplitError::invalid_pipeline(format!("sample_from_datasets weights: {e}")))?;
        Ok(Self {
            children,
            weights,
            dist: Some(dist),
            rng,
        })
    }

    /// Removes an exhausted child from the draw.
    fn drop_child(&mut self, index: usize) {
        self.weights[index] = 0.0;
        self.dist = WeightedIndex::new(&self.weights).ok();
    }
}

impl Iterator for SampleIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        loop {
            let index = self.dist.as_ref()?.sample(&mut self.rng);
            match self.children[index].next() {
                Some(item) => return Some(item),
                None => self.drop_child(index),
            }
        }
    }
}

struct ChooseIter {
    selector: ElementIter,
    children: Vec<ElementIter>,
    exhausted: Vec<bool>,
}

impl Iterator for ChooseIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        loop {
            if self.exhausted.iter().all(|&e| e) {
                return None;
            }
            let choice = match self.selector.next()? {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };
            let index = match choice.as_int() {
                Ok(i) if i >= 0 && (i as usize) < self.children.len() => i as usize,
                Ok(i) => {
                    return Some(Err(SplitError::execution(format!(
                        "selector value {i} is out of range for {} datasets",
                        self.children.len()
                    ))))
                }
                Err(e) => return Some(Err(e)),
            };
            if self.exhausted[index] {
                continue;
            }
            match self.children[index].next() {
                Some(item) => return Some(item),
                None => self.exhausted[index] = true,
            }
        }
    }
}
