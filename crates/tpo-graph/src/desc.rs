//! Minimal kernel-description loader.
//!
//! Reads the composite JSON form of a fused kernel (`input_desc`,
//! `op_desc`, `output_desc`, `process`) into a [`Graph`]. Only the fields
//! the optimizer needs are read; everything else is ignored.

use crate::{AttrValue, Attrs, DType, Graph, GraphError, GraphResult, Shape, TensorId};
use serde::Deserialize;

/// Which pipeline a kernel targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Process {
    /// GPU pipeline.
    Cuda,
    /// AI-core pipeline.
    AiCore,
}

impl Process {
    /// Name as written in kernel descriptions.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::AiCore => "aicore",
        }
    }
}

#[derive(Deserialize)]
struct ProcessProbe {
    #[serde(default)]
    process: Option<String>,
}

/// Reads only the `"process"` key. Anything but `"cuda"` selects AI-core.
///
/// # Errors
///
/// Fails if `json` is not a JSON object.
pub fn probe_process(json: &str) -> GraphResult<Process> {
    let probe: ProcessProbe = serde_json::from_str(json)?;
    Ok(match probe.process.as_deref() {
        Some("cuda") => Process::Cuda,
        _ => Process::AiCore,
    })
}

/// One tensor entry.
#[derive(Clone, Debug, Deserialize)]
pub struct TensorDesc {
    /// Unique tensor name.
    pub tensor_name: String,
    /// Element type name.
    pub data_type: String,
    /// Constant extents.
    pub shape: Vec<i64>,
    /// Present for immediate scalar operands.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// One attribute entry.
#[derive(Clone, Debug, Deserialize)]
pub struct AttrDesc {
    /// Attribute key.
    pub name: String,
    /// Attribute value.
    pub value: AttrValue,
}

/// One statement entry.
#[derive(Clone, Debug, Deserialize)]
pub struct OpDesc {
    /// Op name.
    pub name: String,
    /// Attributes; may be `null`.
    #[serde(default)]
    pub attr: Option<Vec<AttrDesc>>,
    /// Operand groups.
    pub input_desc: Vec<Vec<TensorDesc>>,
    /// Results.
    pub output_desc: Vec<TensorDesc>,
}

/// A whole kernel description.
#[derive(Clone, Debug, Deserialize)]
pub struct KernelDesc {
    /// Kernel name.
    #[serde(default)]
    pub op: String,
    /// Target process name.
    #[serde(default)]
    pub process: Option<String>,
    /// Kernel inputs, grouped.
    #[serde(default)]
    pub input_desc: Vec<Vec<TensorDesc>>,
    /// Statements in program order.
    pub op_desc: Vec<OpDesc>,
    /// Kernel outputs.
    #[serde(default)]
    pub output_desc: Vec<TensorDesc>,
}

impl KernelDesc {
    /// Parses a description.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Json`] on malformed input.
    pub fn parse(json: &str) -> GraphResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The pipeline this kernel targets.
    #[must_use]
    pub fn process(&self) -> Process {
        match self.process.as_deref() {
            Some("cuda") => Process::Cuda,
            _ => Process::AiCore,
        }
    }

    /// Lowers the description into a graph.
    ///
    /// Tensors not defined by any statement become kernel inputs, including
    /// immediate scalars.
    ///
    /// # Errors
    ///
    /// Fails on unknown dtypes, multiply defined tensors, statements with
    /// no result, or an inconsistent graph.
    pub fn to_graph(&self) -> GraphResult<Graph> {
        let mut graph = Graph::new();
        for desc in self.input_desc.iter().flatten() {
            let id = declare(&mut graph, desc)?;
            graph.mark_input(id);
        }
        for op in &self.op_desc {
            let mut inputs = Vec::new();
            for desc in op.input_desc.iter().flatten() {
                let id = declare(&mut graph, desc)?;
                if graph.producer(id).is_none() {
                    graph.mark_input(id);
                }
                inputs.push(id);
            }
            let out_desc = op.output_desc.first().ok_or_else(|| GraphError::Arity {
                op: op.name.clone(),
                expected: 1,
                found: 0,
            })?;
            let output = declare(&mut graph, out_desc)?;
            let mut attrs = Attrs::new();
            for attr in op.attr.iter().flatten() {
                attrs.insert(attr.name.clone(), attr.value.clone());
            }
            graph.add_stmt(op.name.clone(), inputs, output, attrs)?;
        }
        for desc in &self.output_desc {
            let id = graph
                .tensor_by_name(&desc.tensor_name)
                .ok_or_else(|| GraphError::UnknownTensor(desc.tensor_name.clone()))?;
            graph.mark_output(id);
        }
        graph.validate()?;
        Ok(graph)
    }
}

fn declare(graph: &mut Graph, desc: &TensorDesc) -> GraphResult<TensorId> {
    if let Some(id) = graph.tensor_by_name(&desc.tensor_name) {
        return Ok(id);
    }
    let dtype = DType::parse(&desc.data_type)?;
    graph.add_tensor(
        desc.tensor_name.clone(),
        dtype,
        Shape::from_static(desc.shape.iter().copied()),
    )
}
