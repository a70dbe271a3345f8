// rust/split-core/src/pipeline/spec.rs

//! Declarative pipeline descriptions.
//!
//! Closures cannot be written in a config file, so [`PipelineSpec`] offers a
//! small set of built-in element operations and compiles into a
//! [`PipelineNode`]. Specs are read from JSON or TOML.
//!
//! ```toml
//! op = "repeat"
//! count = 5
//!
//! [input]
//! op = "range"
//! stop = 20
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Element, PipelineNode};
use crate::error::{Result, SplitError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PipelineSpec {
    Range {
        #[serde(default)]
        start: i64,
        stop: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
    TensorSlices {
        values: Vec<ValueSpec>,
    },
    FromTensors {
        value: ValueSpec,
    },
    Map {
        input: Box<PipelineSpec>,
        func: ElementOp,
    },
    Filter {
        input: Box<PipelineSpec>,
        predicate: PredicateSpec,
    },
    Repeat {
        input: Box<PipelineSpec>,
        /// Absent means forever.
        #[serde(default)]
        count: Option<u64>,
    },
    Shuffle {
        input: Box<PipelineSpec>,
        buffer_size: usize,
        #[serde(default)]
        seed: Option<u64>,
    },
    Interleave {
        input: Box<PipelineSpec>,
        inner: InnerSpec,
        #[serde(default = "default_cycle_length")]
        cycle_length: usize,
        #[serde(default = "default_block_length")]
        block_length: usize,
    },
    ParallelInterleave {
        input: Box<PipelineSpec>,
        inner: InnerSpec,
        #[serde(default = "default_cycle_length")]
        num_parallel_calls: usize,
    },
    FlatMap {
        input: Box<PipelineSpec>,
        inner: InnerSpec,
    },
    Zip {
        inputs: Vec<PipelineSpec>,
    },
    Concatenate {
        inputs: Vec<PipelineSpec>,
    },
    SampleFromDatasets {
        inputs: Vec<PipelineSpec>,
        weights: Vec<f64>,
        #[serde(default)]
        seed: Option<u64>,
    },
    ChooseFromDatasets {
        inputs: Vec<PipelineSpec>,
        selector: Box<PipelineSpec>,
    },
}

fn default_step() -> i64 {
    1
}

fn default_cycle_length() -> usize {
    2
}

fn default_block_length() -> usize {
    1
}

/// Literal element value: an integer or a UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    Int(i64),
    Text(String),
}

impl From<&ValueSpec> for Element {
    fn from(value: &ValueSpec) -> Self {
        match value {
            ValueSpec::Int(v) => Element::Int(*v),
            ValueSpec::Text(s) => Element::Bytes(s.as_bytes().to_vec()),
        }
    }
}

/// Built-in integer element operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum ElementOp {
    Identity,
    Add { value: i64 },
    Mul { value: i64 },
}

impl ElementOp {
    pub fn apply(&self, element: Element) -> Result<Element> {
        match self {
            ElementOp::Identity => Ok(element),
            ElementOp::Add { value } => Ok(Element::Int(element.as_int()?.wrapping_add(*value))),
            ElementOp::Mul { value } => Ok(Element::Int(element.as_int()?.wrapping_mul(*value))),
        }
    }
}

/// Built-in predicate; keeps `x` when `x % divisor == remainder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum PredicateSpec {
    Modulo {
        divisor: i64,
        #[serde(default)]
        remainder: i64,
    },
}

impl PredicateSpec {
    pub fn test(&self, element: &Element) -> Result<bool> {
        match self {
            PredicateSpec::Modulo { divisor, remainder } => {
                Ok(element.as_int()?.rem_euclid(*divisor) == *remainder)
            }
        }
    }
}

/// Inner dataset built from each outer element `x` of an interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum InnerSpec {
    /// `[x]`
    FromTensors,
    /// `range(0, x)`
    Range,
    /// `x` repeated `count` times.
    Repeat { count: u64 },
}

impl InnerSpec {
    pub fn build(&self, element: Element) -> Result<PipelineNode> {
        match self {
            InnerSpec::FromTensors => Ok(PipelineNode::from_tensors(element)),
            InnerSpec::Range => Ok(PipelineNode::range(0, element.as_int()?)),
            InnerSpec::Repeat { count } => Ok(PipelineNode::from_tensors(element).repeat(*count)),
        }
    }
}

impl PipelineSpec {
    /// Compiles the description into a pipeline tree.
    pub fn build(&self) -> Result<PipelineNode> {
        let node = match self {
            PipelineSpec::Range { start, stop, step } => {
                PipelineNode::range_with_step(*start, *stop, *step)
            }
            PipelineSpec::TensorSlices { values } => {
                PipelineNode::from_tensor_slices(values.iter().map(Element::from))
            }
            PipelineSpec::FromTensors { value } => PipelineNode::from_tensors(Element::from(value)),
            PipelineSpec::Map { input, func } => {
                let func = *func;
                input.build()?.map(move |e| func.apply(e))
            }
            PipelineSpec::Filter { input, predicate } => {
                if let PredicateSpec::Modulo { divisor: 0, .. } = predicate {
                    return Err(SplitError::invalid_pipeline("modulo divisor must be non-zero"));
                }
                let predicate = *predicate;
                input.build()?.filter(move |e| predicate.test(e))
            }
            PipelineSpec::Repeat { input, count } => match count {
                Some(n) => input.build()?.repeat(*n),
                None => input.build()?.repeat_forever(),
            },
            PipelineSpec::Shuffle {
                input,
                buffer_size,
                seed,
            } => input.build()?.shuffle(*buffer_size, *seed),
            PipelineSpec::Interleave {
                input,
                inner,
                cycle_length,
                block_length,
            } => {
                let inner = *inner;
                input
                    .build()?
                    .interleave(move |e| inner.build(e), *cycle_length, *block_length)
            }
            PipelineSpec::ParallelInterleave {
                input,
                inner,
                num_parallel_calls,
            } => {
                let inner = *inner;
                input
                    .build()?
                    .parallel_interleave(move |e| inner.build(e), *num_parallel_calls)
            }
            PipelineSpec::FlatMap { input, inner } => {
                let inner = *inner;
                input.build()?.flat_map(move |e| inner.build(e))
            }
            PipelineSpec::Zip { inputs } => PipelineNode::zip(build_all(inputs)?),
            PipelineSpec::Concatenate { inputs } => {
                PipelineNode::Concatenate(std::sync::Arc::new(build_all(inputs)?))
            }
            PipelineSpec::SampleFromDatasets {
                inputs,
                weights,
                seed,
            } => PipelineNode::sample_from_datasets(build_all(inputs)?, weights.iter().copied(), *seed),
            PipelineSpec::ChooseFromDatasets { inputs, selector } => {
                PipelineNode::choose_from_datasets(build_all(inputs)?, selector.build()?)
            }
        };
        node.validate()?;
        Ok(node)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| SplitError::serialization(format!("invalid pipeline JSON: {e}")))
    }

    /// Loads a spec from a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SplitError::io_with_source(path, "failed to read pipeline file", e)
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => contents.parse(),
        }
    }
}

impl FromStr for PipelineSpec {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SplitError::serialization(format!("invalid pipeline TOML: {e}")))
    }
}

fn build_all(specs: &[PipelineSpec]) -> Result<Vec<PipelineNode>> {
    specs.iter().map(PipelineSpec::build).collect()
}
