// rust/split-core/src/dispatcher/provider.rs

//! Split providers.
//!
//! The dispatcher mirrors each pipeline with a tree of providers: one
//! [`SourceProvider`] per source node and one composite per operator that
//! routes requests to the child owning the requested source. Composites
//! enforce the composition rules:
//!
//! - repeat: a request for a newer iteration resets the child subtree, an
//!   older iteration is stale and gets end-of-epoch;
//! - zip: once a one-to-one child is exhausted, its siblings are capped at
//!   the number of elements it was issued;
//! - concatenate: a request to child `j` closes every child before it.
//!
//! Everything here runs under the owning job's mutex.

use std::collections::VecDeque;
use std::ops::Range;

use tracing::debug;

use super::split::{IndexRange, SourceId, Split, SplitChunks, SplitRequest};
use crate::error::{Result, SplitError};
use crate::pipeline::{Cardinality, PipelineNode};

/// Hands out fixed-size index ranges of one source.
#[derive(Debug)]
pub(crate) struct SourceProvider {
    source: SourceId,
    kind: &'static str,
    chunks: SplitChunks,
    /// Released splits, served before fresh ones. Survives resets.
    pending: VecDeque<Split>,
}

impl SourceProvider {
    fn new(source: SourceId, kind: &'static str, len: u64, split_size: u64) -> Self {
        Self {
            source,
            kind,
            chunks: SplitChunks::new(len, split_size),
            pending: VecDeque::new(),
        }
    }

    fn next(&mut self, request: &SplitRequest, next_id: &mut u64) -> Option<Split> {
        if let Some(mut split) = self.pending.pop_front() {
            debug!(
                source = %self.source,
                split_id = split.id,
                ordinal = split.ordinal,
                attempt = split.attempt,
                "Redelivering released split"
            );
            split.epoch = request.epoch.clone();
            return Some(split);
        }

        let ordinal = self.chunks.issued();
        let range: IndexRange = self.chunks.next()?;
        let id = *next_id;
        *next_id += 1;

        Some(Split {
            id,
            source: self.source,
            epoch: request.epoch.clone(),
            range,
            ordinal,
            attempt: 0,
        })
    }

    fn is_exhausted(&self) -> bool {
        self.chunks.is_done() && self.pending.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct PassThroughProvider {
    /// Map and shuffle emit exactly one element per input element.
    one_to_one: bool,
    child: Box<SplitProvider>,
}

#[derive(Debug)]
pub(crate) struct RepeatProvider {
    count: Option<u64>,
    current: u64,
    /// Splits handed out by the child since the current iteration began.
    issued_this_pass: u64,
    /// The input has no elements at all.
    empty: bool,
    child: Box<SplitProvider>,
}

impl RepeatProvider {
    fn next(&mut self, request: &SplitRequest, depth: usize, next_id: &mut u64) -> Result<Option<Split>> {
        let wanted = *request.epoch.get(depth).ok_or_else(|| {
            SplitError::invalid_pipeline(format!(
                "split request for {} has no repeat iteration at depth {depth}",
                request.source
            ))
        })?;

        if wanted < self.current {
            return Ok(None);
        }
        if wanted > self.current {
            if self.count.is_some_and(|n| wanted >= n) {
                return Ok(None);
            }
            debug!(from = self.current, to = wanted, depth, "Repeat iteration advanced");
            self.child.reset();
            self.current = wanted;
            self.issued_this_pass = 0;
        }

        let split = self.child.next(request, depth + 1, next_id)?;
        if split.is_some() {
            self.issued_this_pass += 1;
        }
        Ok(split)
    }

    fn is_exhausted(&self) -> bool {
        if self.empty {
            return true;
        }
        match self.count {
            // A whole pass without a single split means every later pass is
            // empty too.
            None => self.issued_this_pass == 0 && self.child.is_exhausted(),
            Some(0) => true,
            Some(n) => self.current + 1 >= n && self.child.is_exhausted(),
        }
    }

    fn reset(&mut self) {
        self.current = 0;
        self.issued_this_pass = 0;
    }
}

#[derive(Debug)]
pub(crate) struct ZipProvider {
    children: Vec<SplitProvider>,
    /// Children whose issued index count equals their element count.
    cappable: Vec<bool>,
    /// Elements issued per child since the last reset, first deliveries only.
    issued: Vec<u64>,
    cap: Option<u64>,
}

impl ZipProvider {
    fn new(children: Vec<SplitProvider>) -> Self {
        let cappable = children.iter().map(|c| c.is_one_to_one()).collect();
        let issued = vec![0; children.len()];
        Self {
            children,
            cappable,
            issued,
            cap: None,
        }
    }

    fn is_capped(&self, i: usize) -> bool {
        self.cappable[i] && self.cap.is_some_and(|cap| self.issued[i] >= cap)
    }

    fn next(&mut self, request: &SplitRequest, depth: usize, next_id: &mut u64) -> Result<Option<Split>> {
        let i = route(&self.children, request.source)?;
        if self.is_capped(i) {
            return Ok(None);
        }

        let mut split = self.children[i].next(request, depth, next_id)?;
        if let Some(split) = split.as_mut() {
            if split.attempt == 0 {
                if let (true, Some(cap)) = (self.cappable[i], self.cap) {
                    split.range.truncate(cap - self.issued[i]);
                }
                self.issued[i] += split.range.len();
            }
        }

        if self.cappable[i] && self.children[i].is_exhausted() {
            let count = self.issued[i];
            let cap = self.cap.map_or(count, |cap| cap.min(count));
            if self.cap != Some(cap) {
                debug!(child = i, cap, "Zip capped at exhausted child");
                self.cap = Some(cap);
            }
        }

        Ok(split)
    }

    fn reset(&mut self) {
        self.issued.iter_mut().for_each(|n| *n = 0);
        self.cap = None;
    }
}

#[derive(Debug)]
pub(crate) struct ConcatenateProvider {
    children: Vec<SplitProvider>,
    /// Children before this index are closed for the current pass.
    active: usize,
}

impl ConcatenateProvider {
    fn next(&mut self, request: &SplitRequest, depth: usize, next_id: &mut u64) -> Result<Option<Split>> {
        let i = route(&self.children, request.source)?;
        if i < self.active {
            return Ok(None);
        }
        if i > self.active {
            debug!(closed = self.active, opened = i, "Concatenate moved to next input");
            self.active = i;
        }
        self.children[i].next(request, depth, next_id)
    }
}

#[derive(Debug)]
pub(crate) struct ChooseProvider {
    selector: Box<SplitProvider>,
    children: Vec<SplitProvider>,
}

/// Dispatcher-side mirror of a pipeline node.
#[derive(Debug)]
pub(crate) enum SplitProvider {
    Source(SourceProvider),
    PassThrough(PassThroughProvider),
    Repeat(RepeatProvider),
    Zip(ZipProvider),
    Concatenate(ConcatenateProvider),
    Sample(Vec<SplitProvider>),
    Choose(ChooseProvider),
    /// Interleave, parallel interleave and flat_map: only the input is split.
    Interleave(Box<SplitProvider>),
}

/// A provider tree with the source range covered by each node.
#[derive(Debug)]
pub(crate) struct ProviderTree {
    root: SplitProvider,
    num_sources: u32,
}

impl ProviderTree {
    /// Builds providers for every node of `node`.
    ///
    /// Fails with `UnsupportedTopology` when a node has no splitting rule.
    pub(crate) fn build(node: &PipelineNode, split_size: u64) -> Result<Self> {
        let mut next_source = 0;
        let root = SplitProvider::build(node, split_size, &mut next_source)?;
        Ok(Self {
            root,
            num_sources: next_source,
        })
    }

    pub(crate) fn num_sources(&self) -> u32 {
        self.num_sources
    }

    /// Returns the next split for `request`, or `None` at the end of its epoch.
    pub(crate) fn next(&mut self, request: &SplitRequest, next_id: &mut u64) -> Result<Option<Split>> {
        if request.source.0 >= self.num_sources {
            return Err(SplitError::invalid_pipeline(format!(
                "{} does not exist; pipeline has {} sources",
                request.source, self.num_sources
            )));
        }
        self.root.next(request, 0, next_id)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.root.is_exhausted()
    }

    /// Whether every provider between the root and `source` is exhausted.
    pub(crate) fn path_exhausted(&self, source: SourceId) -> bool {
        self.root.path_exhausted(source)
    }

    /// Returns a released split to its source's pending pool.
    pub(crate) fn requeue(&mut self, split: Split) -> bool {
        self.root.requeue(split)
    }

    pub(crate) fn pending(&self) -> usize {
        self.root.pending()
    }

    /// Iteration of the outermost repeat, if any.
    pub(crate) fn outer_iteration(&self) -> Option<u64> {
        self.root.outer_iteration()
    }
}

impl SplitProvider {
    fn build(node: &PipelineNode, split_size: u64, next_source: &mut u32) -> Result<Self> {
        let build_all = |inputs: &[PipelineNode], next_source: &mut u32| -> Result<Vec<SplitProvider>> {
            inputs
                .iter()
                .map(|input| Self::build(input, split_size, next_source))
                .collect()
        };

        let provider = match node {
            PipelineNode::Range { .. } | PipelineNode::TensorSlices(_) | PipelineNode::FromTensors(_) => {
                let source = SourceId(*next_source);
                *next_source += 1;
                let len = node.source_len().unwrap_or(0);
                Self::Source(SourceProvider::new(source, node.kind_name(), len, split_size))
            }
            PipelineNode::Map { input, .. }
            | PipelineNode::Filter { input, .. }
            | PipelineNode::Shuffle { input, .. } => Self::PassThrough(PassThroughProvider {
                one_to_one: !matches!(node, PipelineNode::Filter { .. }),
                child: Box::new(Self::build(input, split_size, next_source)?),
            }),
            PipelineNode::Repeat { input, count } => Self::Repeat(RepeatProvider {
                count: *count,
                current: 0,
                issued_this_pass: 0,
                empty: input.cardinality() == Cardinality::Finite(0),
                child: Box::new(Self::build(input, split_size, next_source)?),
            }),
            PipelineNode::Interleave { input, .. }
            | PipelineNode::ParallelInterleave { input, .. }
            | PipelineNode::FlatMap { input, .. } => {
                Self::Interleave(Box::new(Self::build(input, split_size, next_source)?))
            }
            PipelineNode::Zip(inputs) => Self::Zip(ZipProvider::new(build_all(inputs, next_source)?)),
            PipelineNode::Concatenate(inputs) => Self::Concatenate(ConcatenateProvider {
                children: build_all(inputs, next_source)?,
                active: 0,
            }),
            PipelineNode::SampleFromDatasets { inputs, .. } => Self::Sample(build_all(inputs, next_source)?),
            PipelineNode::ChooseFromDatasets { inputs, selector } => {
                let selector = Box::new(Self::build(selector, split_size, next_source)?);
                Self::Choose(ChooseProvider {
                    selector,
                    children: build_all(inputs, next_source)?,
                })
            }
            PipelineNode::DataService(source) => {
                return Err(SplitError::unsupported_topology(
                    node.kind_name(),
                    format!(
                        "'{}' is read from another service job and cannot be split",
                        source.name()
                    ),
                ));
            }
        };
        Ok(provider)
    }

    fn children(&self) -> Vec<&SplitProvider> {
        match self {
            Self::Source(_) => Vec::new(),
            Self::PassThrough(p) => vec![p.child.as_ref()],
            Self::Repeat(r) => vec![r.child.as_ref()],
            Self::Interleave(input) => vec![input.as_ref()],
            Self::Zip(z) => z.children.iter().collect(),
            Self::Concatenate(c) => c.children.iter().collect(),
            Self::Sample(children) => children.iter().collect(),
            Self::Choose(c) => std::iter::once(c.selector.as_ref()).chain(c.children.iter()).collect(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut SplitProvider> {
        match self {
            Self::Source(_) => Vec::new(),
            Self::PassThrough(p) => vec![p.child.as_mut()],
            Self::Repeat(r) => vec![r.child.as_mut()],
            Self::Interleave(input) => vec![input.as_mut()],
            Self::Zip(z) => z.children.iter_mut().collect(),
            Self::Concatenate(c) => c.children.iter_mut().collect(),
            Self::Sample(children) => children.iter_mut().collect(),
            Self::Choose(c) => std::iter::once(c.selector.as_mut())
                .chain(c.children.iter_mut())
                .collect(),
        }
    }

    /// Source ids covered by this subtree.
    fn sources(&self) -> Range<u32> {
        match self {
            Self::Source(s) => s.source.0..s.source.0 + 1,
            _ => {
                let children = self.children();
                match (children.first(), children.last()) {
                    (Some(first), Some(last)) => first.sources().start..last.sources().end,
                    _ => 0..0,
                }
            }
        }
    }

    fn next(&mut self, request: &SplitRequest, depth: usize, next_id: &mut u64) -> Result<Option<Split>> {
        match self {
            Self::Source(s) => Ok(s.next(request, next_id)),
            Self::PassThrough(p) => p.child.next(request, depth, next_id),
            Self::Interleave(input) => input.next(request, depth, next_id),
            Self::Repeat(r) => r.next(request, depth, next_id),
            Self::Zip(z) => z.next(request, depth, next_id),
            Self::Concatenate(c) => c.next(request, depth, next_id),
            Self::Sample(children) => {
                let i = route(children, request.source)?;
                children[i].next(request, depth, next_id)
            }
            Self::Choose(c) => {
                if c.selector.sources().contains(&request.source.0) {
                    return c.selector.next(request, depth, next_id);
                }
                let i = route(&c.children, request.source)?;
                c.children[i].next(request, depth, next_id)
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        match self {
            Self::Source(s) => s.is_exhausted(),
            Self::PassThrough(p) => p.child.is_exhausted(),
            Self::Interleave(input) => input.is_exhausted(),
            Self::Repeat(r) => r.is_exhausted(),
            Self::Zip(z) => z.children.iter().any(|c| c.is_exhausted()),
            Self::Concatenate(c) => c.children.last().map_or(true, |last| last.is_exhausted()),
            Self::Sample(children) => children.iter().all(|c| c.is_exhausted()),
            Self::Choose(c) => c.selector.is_exhausted(),
        }
    }

    /// Starts a new pass over this subtree. Pending splits are kept.
    fn reset(&mut self) {
        match self {
            Self::Source(s) => s.chunks.reset(),
            Self::Repeat(r) => r.reset(),
            Self::Zip(z) => z.reset(),
            Self::Concatenate(c) => c.active = 0,
            _ => {}
        }
        for child in self.children_mut() {
            child.reset();
        }
    }

    fn path_exhausted(&self, source: SourceId) -> bool {
        if !self.is_exhausted() {
            return false;
        }
        match self {
            Self::Source(_) => true,
            _ => self
                .children()
                .into_iter()
                .find(|c| c.sources().contains(&source.0))
                .is_some_and(|c| c.path_exhausted(source)),
        }
    }

    fn requeue(&mut self, mut split: Split) -> bool {
        if let Self::Source(s) = self {
            if s.source != split.source {
                return false;
            }
            debug!(
                source = %s.source,
                kind = s.kind,
                split_id = split.id,
                "Split returned to pending pool"
            );
            split.attempt += 1;
            s.pending.push_back(split);
            return true;
        }
        match self
            .children_mut()
            .into_iter()
            .find(|c| c.sources().contains(&split.source.0))
        {
            Some(child) => child.requeue(split),
            None => false,
        }
    }

    fn pending(&self) -> usize {
        match self {
            Self::Source(s) => s.pending.len(),
            _ => self.children().iter().map(|c| c.pending()).sum(),
        }
    }

    fn outer_iteration(&self) -> Option<u64> {
        match self {
            Self::Repeat(r) => Some(r.current),
            _ => self.children().iter().find_map(|c| c.outer_iteration()),
        }
    }

    /// Whether issued index counts equal produced element counts for this
    /// subtree and it cannot repeat forever.
    fn is_one_to_one(&self) -> bool {
        match self {
            Self::Source(_) => true,
            Self::PassThrough(p) => p.one_to_one && p.child.is_one_to_one(),
            Self::Repeat(r) => r.count.is_some() && r.child.is_one_to_one(),
            _ => false,
        }
    }
}

fn route(children: &[SplitProvider], source: SourceId) -> Result<usize> {
    children
        .iter()
        .position(|c| c.sources().contains(&source.0))
        .ok_or_else(|| SplitError::invalid_pipeline(format!("no provider owns {source}")))
}
