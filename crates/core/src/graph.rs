//! Execution graph construction.
//!
//! [`GraphBuilder`] binds a [`ParameterSet`] to a [`WorkflowTemplate`] and
//! produces the prompt graph the server executes. Construction is pure: the
//! only source of non-determinism is the random seed drawn when an
//! auto-seed parameter meets a batch without a start seed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::BuildError;
use crate::params::{MediaRef, ParamValue, ParameterSet, SeedValue};
use crate::prompt_syntax::{expand_random_syntax, has_random_syntax};
use crate::template::{InputValue, ParamKind, ParameterSpec, WorkflowTemplate};

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// A node of a concrete execution graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub class_type: String,
    pub inputs: BTreeMap<String, InputValue>,
}

/// A fully parameterised prompt graph, ready for submission.
///
/// Serializes to the ComfyUI prompt object (`{"<id>": {class_type, inputs}}`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExecutionGraph(BTreeMap<String, GraphNode>);

impl ExecutionGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.0.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &GraphNode)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(id, node)| {
                    let inputs = node
                        .inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect();
                    (
                        id.clone(),
                        serde_json::json!({
                            "class_type": node.class_type,
                            "inputs": serde_json::Value::Object(inputs),
                        }),
                    )
                })
                .collect(),
        )
    }

    /// Canonical serialized form. Identical graphs yield identical bytes.
    pub fn to_canonical_string(&self) -> String {
        self.to_json().to_string()
    }
}

/// Output of [`GraphBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltGraph {
    pub graph: ExecutionGraph,
    /// Seed written into the graph, when the template exposes one.
    pub seed: Option<u64>,
    /// Prompt text before `<random:…>` expansion, when expansion changed it.
    pub original_prompt: Option<String>,
    /// Parameter values as written into the graph: seeds resolved to fixed
    /// values and prompts expanded.
    pub parameters: ParameterSet,
}

/// Per-run options for a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// First seed of a batch. Auto seeds resolve to `start_seed + iteration`.
    pub start_seed: Option<u64>,
    /// Zero-based index of this run within its batch.
    pub iteration: u32,
}

impl BuildOptions {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn batch(start_seed: u64, iteration: u32) -> Self {
        Self {
            start_seed: Some(start_seed),
            iteration,
        }
    }

    fn auto_seed(&self) -> u64 {
        match self.start_seed {
            Some(start) => start.wrapping_add(u64::from(self.iteration)),
            None => rand::random(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct GraphBuilder<'a> {
    template: &'a WorkflowTemplate,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(template: &'a WorkflowTemplate) -> Self {
        Self { template }
    }

    pub fn build(
        &self,
        params: &ParameterSet,
        options: &BuildOptions,
    ) -> Result<BuiltGraph, BuildError> {
        for (name, _) in params.iter() {
            if self.template.parameter(name).is_none() {
                return Err(BuildError::invalid(
                    name,
                    format!("workflow '{}' has no such parameter", self.template.name()),
                ));
            }
        }

        let mut nodes: BTreeMap<String, GraphNode> = self
            .template
            .nodes()
            .map(|n| {
                (
                    n.id.clone(),
                    GraphNode {
                        class_type: n.class_type.clone(),
                        inputs: n.inputs.clone(),
                    },
                )
            })
            .collect();

        // All auto seeds of one run share a single drawn value.
        let mut drawn_seed: Option<u64> = None;
        let mut job_seed: Option<u64> = None;
        let mut resolved_params = params.clone();
        let mut bound: Vec<(&ParameterSpec, InputValue)> = Vec::new();

        for spec in self.template.parameters() {
            let value = params
                .get(&spec.name)
                .ok_or_else(|| BuildError::invalid(&spec.name, "no value supplied"))?;

            let input = match coerce_seed(spec, value)? {
                Some(seed) => {
                    let resolved = match seed {
                        SeedValue::Fixed(n) => n,
                        SeedValue::Auto => *drawn_seed.get_or_insert_with(|| options.auto_seed()),
                    };
                    job_seed.get_or_insert(resolved);
                    resolved_params.set(
                        spec.name.clone(),
                        ParamValue::Seed(SeedValue::Fixed(resolved)),
                    );
                    seed_input(resolved)
                }
                None => coerce(spec, value)?,
            };
            bound.push((spec, input));
        }

        let prompt_seed = job_seed
            .or_else(|| {
                options
                    .start_seed
                    .map(|s| s.wrapping_add(u64::from(options.iteration)))
            })
            .unwrap_or(u64::from(options.iteration));
        let mut original_prompt = None;

        for (spec, mut input) in bound {
            if matches!(spec.kind, ParamKind::Text { prompt: true }) {
                if let InputValue::Text(text) = &input {
                    if has_random_syntax(text) {
                        let expanded = expand_random_syntax(text, prompt_seed);
                        if original_prompt.is_none() {
                            original_prompt = Some(text.clone());
                        }
                        resolved_params.set(spec.name.clone(), ParamValue::Text(expanded.clone()));
                        input = InputValue::Text(expanded);
                    }
                }
            }

            let node = nodes.get_mut(&spec.node_id).ok_or_else(|| {
                BuildError::malformed(format!("node '{}' disappeared", spec.node_id))
            })?;
            node.inputs.insert(spec.target_input.clone(), input);
        }

        Ok(BuiltGraph {
            graph: ExecutionGraph(nodes),
            seed: job_seed,
            original_prompt,
            parameters: resolved_params,
        })
    }
}

fn seed_input(seed: u64) -> InputValue {
    match i64::try_from(seed) {
        Ok(i) => InputValue::Int(i),
        Err(_) => InputValue::Unsigned(seed),
    }
}

/// `Some` when `spec` is a seed parameter; integers are accepted with `-1`
/// (or any negative) meaning auto.
fn coerce_seed(spec: &ParameterSpec, value: &ParamValue) -> Result<Option<SeedValue>, BuildError> {
    if spec.kind != ParamKind::Seed {
        return Ok(None);
    }
    match value {
        ParamValue::Seed(s) => Ok(Some(*s)),
        ParamValue::Integer(i) if *i < 0 => Ok(Some(SeedValue::Auto)),
        ParamValue::Integer(i) => Ok(Some(SeedValue::Fixed(*i as u64))),
        other => Err(mismatch(spec, other)),
    }
}

fn coerce(spec: &ParameterSpec, value: &ParamValue) -> Result<InputValue, BuildError> {
    let name = spec.name.as_str();
    match (&spec.kind, value) {
        (ParamKind::Integer { min, max }, ParamValue::Integer(i)) => {
            check_range(name, *i, *min, *max)?;
            Ok(InputValue::Int(*i))
        }
        (ParamKind::Float { min, max }, ParamValue::Float(f)) => coerce_float(name, *f, *min, *max),
        (ParamKind::Float { min, max }, ParamValue::Integer(i)) => {
            coerce_float(name, *i as f64, *min, *max)
        }
        (ParamKind::Text { .. }, ParamValue::Text(s)) => Ok(InputValue::Text(s.clone())),
        (ParamKind::Choice { options }, ParamValue::Choice(s) | ParamValue::Text(s)) => {
            if !options.is_empty() && !options.iter().any(|o| o == s) {
                return Err(BuildError::invalid(
                    name,
                    format!("'{s}' is not one of: {}", options.join(", ")),
                ));
            }
            Ok(InputValue::Text(s.clone()))
        }
        (ParamKind::Toggle, ParamValue::Toggle(b)) => Ok(InputValue::Bool(*b)),
        (ParamKind::Image, ParamValue::Image(media)) | (ParamKind::Video, ParamValue::Video(media)) => {
            match media {
                MediaRef::Server(file) if !file.is_empty() => Ok(InputValue::Text(file.clone())),
                MediaRef::Server(_) => Err(BuildError::invalid(name, "file name is empty")),
                MediaRef::Local(path) => Err(BuildError::invalid(
                    name,
                    format!("local file '{}' must be uploaded first", path.display()),
                )),
            }
        }
        (_, other) => Err(mismatch(spec, other)),
    }
}

fn coerce_float(
    name: &str,
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<InputValue, BuildError> {
    if !value.is_finite() {
        return Err(BuildError::invalid(name, "value must be a finite number"));
    }
    check_range(name, value, min, max)?;
    Ok(InputValue::Float(value))
}

fn mismatch(spec: &ParameterSpec, value: &ParamValue) -> BuildError {
    BuildError::invalid(
        &spec.name,
        format!(
            "expected a {} value, got {}",
            spec.kind.label(),
            value.kind_label()
        ),
    )
}

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(
    name: &str,
    value: T,
    min: Option<T>,
    max: Option<T>,
) -> Result<(), BuildError> {
    if let Some(min) = min {
        if value < min {
            return Err(BuildError::invalid(name, format!("{value} is below minimum {min}")));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(BuildError::invalid(name, format!("{value} is above maximum {max}")));
        }
    }
    Ok(())
}
