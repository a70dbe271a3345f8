// rust/split-core/src/pipeline/mod.rs

//! Pipeline definitions.
//!
//! A [`PipelineNode`] is an immutable tree describing how elements are
//! produced: sources (`Range`, `TensorSlices`, `FromTensors`), per-element
//! transformations and the composite operators. Trees are cheap to clone;
//! children live behind `Arc`.
//!
//! ```
//! use split_core::pipeline::{Element, PipelineNode};
//!
//! let ds = PipelineNode::range(0, 10)
//!     .map(|e| Ok(Element::Int(e.as_int()? * 2)))
//!     .repeat(3);
//! assert_eq!(ds.kind_name(), "RepeatDataset");
//! ```

mod element;
pub mod spec;

pub use element::Element;
pub use spec::PipelineSpec;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};

/// Stream of elements produced by an executing pipeline.
pub type ElementIter = Box<dyn Iterator<Item = Result<Element>> + Send>;

pub type ElementFn = Arc<dyn Fn(Element) -> Result<Element> + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&Element) -> Result<bool> + Send + Sync>;
/// Builds the inner dataset of an interleave or flat_map for one outer element.
pub type DatasetFn = Arc<dyn Fn(Element) -> Result<PipelineNode> + Send + Sync>;

/// How a registered pipeline is spread over the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Every worker produces the whole dataset.
    ParallelEpochs,
    /// Workers share one pass; each element is produced once per epoch.
    #[default]
    DistributedEpoch,
}

impl std::str::FromStr for ProcessingMode {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parallel_epochs" => Ok(Self::ParallelEpochs),
            "distributed_epoch" => Ok(Self::DistributedEpoch),
            other => Err(SplitError::config(format!(
                "unknown processing mode '{other}' (expected parallel_epochs or distributed_epoch)"
            ))),
        }
    }
}

/// Statically known number of elements of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Finite(u64),
    Infinite,
    Unknown,
}

/// Opens a stream over the output of another service job.
#[derive(Clone)]
pub struct ServiceSource {
    name: String,
    open: Arc<dyn Fn() -> Result<ElementIter> + Send + Sync>,
}

impl ServiceSource {
    pub fn new(
        name: impl Into<String>,
        open: impl Fn() -> Result<ElementIter> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            open: Arc::new(open),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open(&self) -> Result<ElementIter> {
        (self.open)()
    }
}

/// A node of an input pipeline.
#[derive(Clone)]
pub enum PipelineNode {
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    TensorSlices(Arc<Vec<Element>>),
    FromTensors(Element),
    Map {
        input: Arc<PipelineNode>,
        func: ElementFn,
    },
    Filter {
        input: Arc<PipelineNode>,
        predicate: Predicate,
    },
    /// `count: None` repeats forever.
    Repeat {
        input: Arc<PipelineNode>,
        count: Option<u64>,
    },
    Shuffle {
        input: Arc<PipelineNode>,
        buffer_size: usize,
        seed: Option<u64>,
    },
    Interleave {
        input: Arc<PipelineNode>,
        func: DatasetFn,
        cycle_length: usize,
        block_length: usize,
    },
    ParallelInterleave {
        input: Arc<PipelineNode>,
        func: DatasetFn,
        cycle_length: usize,
        num_parallel_calls: usize,
    },
    FlatMap {
        input: Arc<PipelineNode>,
        func: DatasetFn,
    },
    Zip(Arc<Vec<PipelineNode>>),
    Concatenate(Arc<Vec<PipelineNode>>),
    SampleFromDatasets {
        inputs: Arc<Vec<PipelineNode>>,
        weights: Arc<Vec<f64>>,
        seed: Option<u64>,
    },
    ChooseFromDatasets {
        inputs: Arc<Vec<PipelineNode>>,
        selector: Arc<PipelineNode>,
    },
    DataService(ServiceSource),
}

impl PipelineNode {
    pub fn range(start: i64, stop: i64) -> Self {
        Self::range_with_step(start, stop, 1)
    }

    pub fn range_with_step(start: i64, stop: i64, step: i64) -> Self {
        Self::Range { start, stop, step }
    }

    pub fn from_tensor_slices<E: Into<Element>>(values: impl IntoIterator<Item = E>) -> Self {
        Self::TensorSlices(Arc::new(values.into_iter().map(Into::into).collect()))
    }

    pub fn from_tensors(value: impl Into<Element>) -> Self {
        Self::FromTensors(value.into())
    }

    pub fn map(self, func: impl Fn(Element) -> Result<Element> + Send + Sync + 'static) -> Self {
        Self::Map {
            input: Arc::new(self),
            func: Arc::new(func),
        }
    }

    pub fn filter(self, predicate: impl Fn(&Element) -> Result<bool> + Send + Sync + 'static) -> Self {
        Self::Filter {
            input: Arc::new(self),
            predicate: Arc::new(predicate),
        }
    }

    pub fn repeat(self, count: u64) -> Self {
        Self::Repeat {
            input: Arc::new(self),
            count: Some(count),
        }
    }

    pub fn repeat_forever(self) -> Self {
        Self::Repeat {
            input: Arc::new(self),
            count: None,
        }
    }

    pub fn shuffle(self, buffer_size: usize, seed: Option<u64>) -> Self {
        Self::Shuffle {
            input: Arc::new(self),
            buffer_size,
            seed,
        }
    }

    pub fn interleave(
        self,
        func: impl Fn(Element) -> Result<PipelineNode> + Send + Sync + 'static,
        cycle_length: usize,
        block_length: usize,
    ) -> Self {
        Self::Interleave {
            input: Arc::new(self),
            func: Arc::new(func),
            cycle_length,
            block_length,
        }
    }

    /// Interleave with `num_parallel_calls` open inner datasets, one element each.
    pub fn parallel_interleave(
        self,
        func: impl Fn(Element) -> Result<PipelineNode> + Send + Sync + 'static,
        num_parallel_calls: usize,
    ) -> Self {
        Self::ParallelInterleave {
            input: Arc::new(self),
            func: Arc::new(func),
            cycle_length: num_parallel_calls,
            num_parallel_calls,
        }
    }

    pub fn flat_map(self, func: impl Fn(Element) -> Result<PipelineNode> + Send + Sync + 'static) -> Self {
        Self::FlatMap {
            input: Arc::new(self),
            func: Arc::new(func),
        }
    }

    pub fn concatenate(self, other: PipelineNode) -> Self {
        match self {
            Self::Concatenate(children) => {
                let mut children = children.as_ref().clone();
                children.push(other);
                Self::Concatenate(Arc::new(children))
            }
            first => Self::Concatenate(Arc::new(vec![first, other])),
        }
    }

    pub fn zip(inputs: impl IntoIterator<Item = PipelineNode>) -> Self {
        Self::Zip(Arc::new(inputs.into_iter().collect()))
    }

    pub fn sample_from_datasets(
        inputs: impl IntoIterator<Item = PipelineNode>,
        weights: impl IntoIterator<Item = f64>,
        seed: Option<u64>,
    ) -> Self {
        Self::SampleFromDatasets {
            inputs: Arc::new(inputs.into_iter().collect()),
            weights: Arc::new(weights.into_iter().collect()),
            seed,
        }
    }

    pub fn choose_from_datasets(
        inputs: impl IntoIterator<Item = PipelineNode>,
        selector: PipelineNode,
    ) -> Self {
        Self::ChooseFromDatasets {
            inputs: Arc::new(inputs.into_iter().collect()),
            selector: Arc::new(selector),
        }
    }

    pub fn data_service(source: ServiceSource) -> Self {
        Self::DataService(source)
    }

    /// Dataset type name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Range { .. } => "RangeDataset",
            Self::TensorSlices(_) => "TensorSliceDataset",
            Self::FromTensors(_) => "TensorDataset",
            Self::Map { .. } => "MapDataset",
            Self::Filter { .. } => "FilterDataset",
            Self::Repeat { .. } => "RepeatDataset",
            Self::Shuffle { .. } => "ShuffleDataset",
            Self::Interleave { .. } => "InterleaveDataset",
            Self::ParallelInterleave { .. } => "ParallelInterleaveDataset",
            Self::FlatMap { .. } => "FlatMapDataset",
            Self::Zip(_) => "ZipDataset",
            Self::Concatenate(_) => "ConcatenateDataset",
            Self::SampleFromDatasets { .. } => "SampleFromDatasets",
            Self::ChooseFromDatasets { .. } => "ChooseFromDatasets",
            Self::DataService(_) => "DataServiceDataset",
        }
    }

    /// Whether this node produces elements itself and is split by index range.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            Self::Range { .. } | Self::TensorSlices(_) | Self::FromTensors(_)
        )
    }

    /// Number of elements of a source node.
    pub fn source_len(&self) -> Option<u64> {
        match self {
            Self::Range { start, stop, step } => Some(range_len(*start, *stop, *step)),
            Self::TensorSlices(values) => Some(values.len() as u64),
            Self::FromTensors(_) => Some(1),
            _ => None,
        }
    }

    /// Element at `index` of a source node.
    pub fn source_element(&self, index: u64) -> Result<Element> {
        match self {
            Self::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                if index >= len {
                    return Err(SplitError::execution(format!(
                        "index {index} out of bounds for range of {len} elements"
                    )));
                }
                // In bounds, so the value lies between start and stop.
                let value = *start as i128 + index as i128 * *step as i128;
                Ok(Element::Int(value as i64))
            }
            Self::TensorSlices(values) => values.get(index as usize).cloned().ok_or_else(|| {
                SplitError::execution(format!(
                    "index {index} out of bounds for {} slices",
                    values.len()
                ))
            }),
            Self::FromTensors(value) if index == 0 => Ok(value.clone()),
            other => Err(SplitError::execution(format!(
                "index {index} is not addressable in {}",
                other.kind_name()
            ))),
        }
    }

    /// Children that take part in splitting, in source-numbering order.
    ///
    /// Interleave and flat_map contribute only their input: inner datasets
    /// are built per element and never split. Choose lists the selector
    /// first, then the candidate datasets.
    pub fn split_children(&self) -> Vec<&PipelineNode> {
        match self {
            Self::Range { .. } | Self::TensorSlices(_) | Self::FromTensors(_) | Self::DataService(_) => {
                Vec::new()
            }
            Self::Map { input, .. }
            | Self::Filter { input, .. }
            | Self::Repeat { input, .. }
            | Self::Shuffle { input, .. }
            | Self::Interleave { input, .. }
            | Self::ParallelInterleave { input, .. }
            | Self::FlatMap { input, .. } => vec![input.as_ref()],
            Self::Zip(inputs) | Self::Concatenate(inputs) => inputs.iter().collect(),
            Self::SampleFromDatasets { inputs, .. } => inputs.iter().collect(),
            Self::ChooseFromDatasets { inputs, selector } => {
                std::iter::once(selector.as_ref()).chain(inputs.iter()).collect()
            }
        }
    }

    /// Number of source nodes reachable through [`split_children`](Self::split_children).
    pub fn source_count(&self) -> u32 {
        if self.is_source() {
            return 1;
        }
        self.split_children().iter().map(|c| c.source_count()).sum()
    }

    pub fn cardinality(&self) -> Cardinality {
        use Cardinality::*;
        match self {
            Self::Range { .. } | Self::TensorSlices(_) | Self::FromTensors(_) => {
                Finite(self.source_len().unwrap_or(0))
            }
            Self::Map { input, .. } | Self::Shuffle { input, .. } => input.cardinality(),
            Self::Filter { input, .. } => match input.cardinality() {
                Finite(0) => Finite(0),
                Infinite => Infinite,
                _ => Unknown,
            },
            Self::Repeat { input, count } => match (input.cardinality(), count) {
                (Finite(0), _) | (_, Some(0)) => Finite(0),
                (Finite(n), Some(c)) => Finite(n.saturating_mul(*c)),
                (Unknown, Some(_)) => Unknown,
                _ => Infinite,
            },
            Self::Interleave { input, .. }
            | Self::ParallelInterleave { input, .. }
            | Self::FlatMap { input, .. } => match input.cardinality() {
                Finite(0) => Finite(0),
                _ => Unknown,
            },
            Self::Zip(inputs) => {
                let cards: Vec<_> = inputs.iter().map(|c| c.cardinality()).collect();
                let finite = cards.iter().filter_map(|c| match c {
                    Finite(n) => Some(*n),
                    _ => None,
                });
                match finite.min() {
                    Some(0) => Finite(0),
                    _ if cards.contains(&Unknown) => Unknown,
                    Some(n) => Finite(n),
                    None => Infinite,
                }
            }
            Self::Concatenate(inputs) => inputs.iter().fold(Finite(0), |acc, c| {
                match (acc, c.cardinality()) {
                    (Infinite, _) | (_, Infinite) => Infinite,
                    (Unknown, _) | (_, Unknown) => Unknown,
                    (Finite(a), Finite(b)) => Finite(a.saturating_add(b)),
                }
            }),
            Self::SampleFromDatasets { inputs, .. } => {
                if inputs.iter().all(|c| c.cardinality() == Infinite) {
                    Infinite
                } else {
                    Unknown
                }
            }
            Self::ChooseFromDatasets { selector, .. } => match selector.cardinality() {
                Finite(0) => Finite(0),
                _ => Unknown,
            },
            Self::DataService(_) => Unknown,
        }
    }

    /// Checks operator parameters over the whole tree.
    ///
    /// Splittability is checked separately when the dispatcher builds
    /// split providers.
    pub fn validate(&self) -> Result<()> {
        for child in self.split_children() {
            child.validate()?;
        }

        match self {
            Self::Range { step: 0, .. } => Err(SplitError::invalid_pipeline("range step must be non-zero")),
            Self::Shuffle { buffer_size: 0, .. } => {
                Err(SplitError::invalid_pipeline("shuffle buffer_size must be greater than 0"))
            }
            Self::Interleave {
                cycle_length,
                block_length,
                ..
            } if *cycle_length == 0 || *block_length == 0 => Err(SplitError::invalid_pipeline(
                "interleave cycle_length and block_length must be greater than 0",
            )),
            Self::ParallelInterleave {
                cycle_length,
                num_parallel_calls,
                ..
            } if *cycle_length == 0 || *num_parallel_calls == 0 => Err(SplitError::invalid_pipeline(
                "parallel interleave cycle_length and num_parallel_calls must be greater than 0",
            )),
            Self::Zip(inputs) if inputs.is_empty() => {
                Err(SplitError::invalid_pipeline("zip requires at least one input"))
            }
            Self::Concatenate(inputs) if inputs.is_empty() => {
                Err(SplitError::invalid_pipeline("concatenate requires at least one input"))
            }
            Self::SampleFromDatasets { inputs, weights, .. } => validate_weights(inputs, weights),
            Self::ChooseFromDatasets { inputs, .. } if inputs.is_empty() => Err(
                SplitError::invalid_pipeline("choose_from_datasets requires at least one input"),
            ),
            _ => Ok(()),
        }
    }
}

fn validate_weights(inputs: &[PipelineNode], weights: &[f64]) -> Result<()> {
    if inputs.is_empty() {
        return Err(SplitError::invalid_pipeline(
            "sample_from_datasets requires at least one input",
        ));
    }
    if weights.len() != inputs.len() {
        return Err(SplitError::invalid_pipeline(format!(
            "sample_from_datasets got {} weights for {} inputs",
            weights.len(),
            inputs.len()
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(SplitError::invalid_pipeline(
            "sample_from_datasets weights must be finite and non-negative",
        ));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(SplitError::invalid_pipeline(
            "sample_from_datasets weights must not all be zero",
        ));
    }
    Ok(())
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> u64 {
    if step > 0 && stop > start {
        let span = (stop as i128 - start as i128) as u128;
        span.div_ceil(step as u128) as u64
    } else if step < 0 && stop < start {
        let span = (start as i128 - stop as i128) as u128;
        span.div_ceil(step.unsigned_abs() as u128) as u64
    } else {
        0
    }
}

impl fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { start, stop, step } => f
                .debug_struct("Range")
                .field("start", start)
                .field("stop", stop)
                .field("step", step)
                .finish(),
            Self::TensorSlices(values) => f.debug_tuple("TensorSlices").field(&values.len()).finish(),
            Self::FromTensors(value) => f.debug_tuple("FromTensors").field(value).finish(),
            Self::Repeat { input, count } => f
                .debug_struct("Repeat")
                .field("input", input)
                .field("count", count)
                .finish(),
            Self::Shuffle {
                input, buffer_size, ..
            } => f
                .debug_struct("Shuffle")
                .field("input", input)
                .field("buffer_size", buffer_size)
                .finish(),
            Self::DataService(source) => f.debug_tuple("DataService").field(&source.name).finish(),
            other => {
                let mut t = f.debug_tuple(other.kind_name());
                for child in other.split_children() {
                    t.field(child);
                }
                t.finish()
            }
        }
    }
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSource").field("name", &self.name).finish()
    }
}
