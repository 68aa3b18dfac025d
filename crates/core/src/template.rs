//! Workflow templates.
//!
//! A template is a ComfyUI workflow in API format whose user-facing knobs
//! are `SwarmInput*` nodes. Every such node carrying an `inputs.title`
//! declares one exposed parameter:
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": ["7", 0], "steps": ["8", 0] } },
//!   "7": { "class_type": "SwarmInputInteger",
//!          "inputs": { "title": "Seed", "value": -1, "view_type": "seed" } }
//! }
//! ```
//!
//! Parsing validates the shape once so that [`crate::graph::GraphBuilder`]
//! can work on typed data instead of trusting raw JSON.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BuildError;
use crate::params::{MediaRef, ParamValue, ParameterSet, SeedValue};

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

/// Prefix shared by every exposed-parameter node class.
pub const SWARM_INPUT_PREFIX: &str = "SwarmInput";

/// Prefix of grouping nodes, which never carry a parameter.
const SWARM_INPUT_GROUP_PREFIX: &str = "SwarmInputGroup";

const SWARM_INPUT_INTEGER: &str = "SwarmInputInteger";
const SWARM_INPUT_FLOAT: &str = "SwarmInputFloat";
const SWARM_INPUT_TEXT: &str = "SwarmInputText";
const SWARM_INPUT_DROPDOWN: &str = "SwarmInputDropdown";
const SWARM_INPUT_BOOLEAN: &str = "SwarmInputBoolean";
const SWARM_INPUT_IMAGE: &str = "SwarmInputImage";
const SWARM_INPUT_VIDEO: &str = "SwarmInputVideo";
const SWARM_LORA_LOADER: &str = "SwarmLoraLoader";

/// `view_type` marking an integer input as a seed.
const VIEW_TYPE_SEED: &str = "seed";

/// `view_type` marking a text input as a generation prompt.
const VIEW_TYPE_PROMPT: &str = "prompt";

// ---------------------------------------------------------------------------
// Input values
// ---------------------------------------------------------------------------

/// A single node input, classified by shape.
///
/// ComfyUI encodes links to other nodes as `[source_node_id, output_index]`;
/// everything that is neither a scalar nor a link is kept as raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX` (large seeds).
    Unsigned(u64),
    Float(f64),
    Text(String),
    Link { node: String, slot: u32 },
    Json(serde_json::Value),
}

impl InputValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Unsigned(u) => Some(*u as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => (*b).into(),
            Self::Int(i) => (*i).into(),
            Self::Unsigned(u) => (*u).into(),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => s.clone().into(),
            Self::Link { node, slot } => serde_json::json!([node, slot]),
            Self::Json(v) => v.clone(),
        }
    }
}

impl From<&serde_json::Value> for InputValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::Unsigned(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(arr) => match arr.as_slice() {
                [Value::String(node), Value::Number(slot)] if slot.as_u64().is_some() => {
                    Self::Link {
                        node: node.clone(),
                        slot: slot.as_u64().unwrap_or_default() as u32,
                    }
                }
                _ => Self::Json(value.clone()),
            },
            Value::Object(_) => Self::Json(value.clone()),
        }
    }
}

impl Serialize for InputValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Unsigned(u) => serializer.serialize_u64(*u),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Link { node, slot } => (node, slot).serialize(serializer),
            Self::Json(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from(&value))
    }
}

// ---------------------------------------------------------------------------
// Nodes and parameters
// ---------------------------------------------------------------------------

/// Classification of a template node by its `class_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    InputInteger,
    InputFloat,
    InputText,
    InputDropdown,
    InputBoolean,
    InputImage,
    InputVideo,
    /// A `SwarmInput*` class this client has no dedicated handling for;
    /// its parameter kind is inferred from the current value.
    InputOther,
    LoraLoader,
    Other,
}

impl NodeKind {
    pub fn from_class_type(class_type: &str) -> Self {
        match class_type {
            SWARM_INPUT_INTEGER => Self::InputInteger,
            SWARM_INPUT_FLOAT => Self::InputFloat,
            SWARM_INPUT_TEXT => Self::InputText,
            SWARM_INPUT_DROPDOWN => Self::InputDropdown,
            SWARM_INPUT_BOOLEAN => Self::InputBoolean,
            SWARM_INPUT_IMAGE => Self::InputImage,
            SWARM_INPUT_VIDEO => Self::InputVideo,
            SWARM_LORA_LOADER => Self::LoraLoader,
            other if other.starts_with(SWARM_INPUT_GROUP_PREFIX) => Self::Other,
            other if other.starts_with(SWARM_INPUT_PREFIX) => Self::InputOther,
            _ => Self::Other,
        }
    }

    /// Whether nodes of this kind may declare an exposed parameter.
    pub fn is_input(self) -> bool {
        !matches!(self, Self::LoraLoader | Self::Other)
    }
}

/// One node of a workflow template.
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub id: String,
    pub class_type: String,
    pub kind: NodeKind,
    pub inputs: BTreeMap<String, InputValue>,
    /// Dropdown choices (node-level `options` list).
    pub options: Vec<String>,
    /// Declared input media size (`input_width` / `input_height`).
    pub input_size: Option<(u64, u64)>,
}

/// Declared kind of an exposed parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Integer { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Text { prompt: bool },
    Choice { options: Vec<String> },
    Toggle,
    Seed,
    Image,
    Video,
}

impl ParamKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Integer { .. } => "integer",
            Self::Float { .. } => "float",
            Self::Text { .. } => "text",
            Self::Choice { .. } => "choice",
            Self::Toggle => "toggle",
            Self::Seed => "seed",
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// An exposed, user-configurable slot of a template.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    /// Parameter name; the node's `inputs.title`.
    pub name: String,
    pub node_id: String,
    /// Input field of the node that receives the value.
    pub target_input: String,
    pub kind: ParamKind,
    /// Value stored in the template, if it parses for `kind`.
    pub default: Option<ParamValue>,
}

impl ParameterSpec {
    /// Whether the template asks for a fresh seed on every run.
    pub fn is_auto_seed(&self) -> bool {
        matches!(self.default, Some(ParamValue::Seed(SeedValue::Auto)))
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// An immutable, validated workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    name: String,
    nodes: BTreeMap<String, TemplateNode>,
    parameters: Vec<ParameterSpec>,
}

impl WorkflowTemplate {
    /// Parse a template from its JSON text.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, BuildError> {
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| BuildError::malformed(format!("invalid JSON: {e}")))?;
        Self::from_json(name, &json)
    }

    /// Build a template from parsed API-format JSON.
    pub fn from_json(name: impl Into<String>, json: &serde_json::Value) -> Result<Self, BuildError> {
        let obj = json
            .as_object()
            .ok_or_else(|| BuildError::malformed("workflow JSON must be an object"))?;

        if obj.is_empty() {
            return Err(BuildError::malformed(
                "workflow JSON must contain at least one node",
            ));
        }

        let mut nodes = BTreeMap::new();
        let mut parameters = Vec::new();
        let mut seen_names = HashSet::new();

        for (node_id, node_value) in obj {
            let node = parse_node(node_id, node_value)?;

            if let Some(spec) = parameter_for(&node)? {
                if !seen_names.insert(spec.name.clone()) {
                    return Err(BuildError::malformed(format!(
                        "duplicate parameter title '{}'",
                        spec.name
                    )));
                }
                parameters.push(spec);
            }

            nodes.insert(node_id.clone(), node);
        }

        // Present parameters in node order ("2" before "10").
        parameters.sort_by(|a, b| node_order(&a.node_id).cmp(&node_order(&b.node_id)));

        Ok(Self {
            name: name.into(),
            nodes,
            parameters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TemplateNode> {
        self.nodes.values()
    }

    pub fn node(&self, id: &str) -> Option<&TemplateNode> {
        self.nodes.get(id)
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// The template's stored values as a parameter set.
    ///
    /// Parameters whose stored value does not fit their kind are omitted,
    /// so the caller has to supply them explicitly.
    pub fn default_parameters(&self) -> ParameterSet {
        let mut params = ParameterSet::new();
        for spec in &self.parameters {
            if let Some(value) = &spec.default {
                params.set(spec.name.clone(), value.clone());
            }
        }
        params
    }
}

fn node_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

fn parse_node(node_id: &str, value: &serde_json::Value) -> Result<TemplateNode, BuildError> {
    let class_type = value
        .get("class_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            BuildError::malformed(format!(
                "node '{node_id}' is missing required 'class_type' field"
            ))
        })?
        .to_string();

    let inputs = match value.get("inputs") {
        None | Some(serde_json::Value::Null) => BTreeMap::new(),
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), InputValue::from(v)))
            .collect(),
        Some(_) => {
            return Err(BuildError::malformed(format!(
                "node '{node_id}' has non-object 'inputs'"
            )))
        }
    };

    let options = value
        .get("options")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|o| match o.as_str() {
                    Some(s) => s.to_string(),
                    None => o.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let input_size = match (
        value.get("input_width").and_then(|v| v.as_u64()),
        value.get("input_height").and_then(|v| v.as_u64()),
    ) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    };

    Ok(TemplateNode {
        id: node_id.to_string(),
        kind: NodeKind::from_class_type(&class_type),
        class_type,
        inputs,
        options,
        input_size,
    })
}

fn parameter_for(node: &TemplateNode) -> Result<Option<ParameterSpec>, BuildError> {
    if !node.kind.is_input() {
        return Ok(None);
    }
    let Some(name) = node.inputs.get("title").and_then(|t| t.as_str()) else {
        return Ok(None);
    };

    let target_input = match node.kind {
        NodeKind::InputImage => "image",
        NodeKind::InputVideo => "video",
        _ => "value",
    };

    let current = node.inputs.get(target_input).ok_or_else(|| {
        BuildError::malformed(format!(
            "parameter '{name}' (node '{}') has no '{target_input}' input",
            node.id
        ))
    })?;

    let view_type = node.inputs.get("view_type").and_then(|v| v.as_str());
    let int_bound = |key: &str| node.inputs.get(key).and_then(|v| v.as_i64());
    let float_bound = |key: &str| node.inputs.get(key).and_then(|v| v.as_f64());

    let kind = match node.kind {
        NodeKind::InputInteger if view_type == Some(VIEW_TYPE_SEED) => ParamKind::Seed,
        NodeKind::InputInteger => ParamKind::Integer {
            min: int_bound("min"),
            max: int_bound("max"),
        },
        NodeKind::InputFloat => ParamKind::Float {
            min: float_bound("min"),
            max: float_bound("max"),
        },
        NodeKind::InputText => ParamKind::Text {
            prompt: view_type == Some(VIEW_TYPE_PROMPT),
        },
        NodeKind::InputDropdown => ParamKind::Choice {
            options: node.options.clone(),
        },
        NodeKind::InputBoolean => ParamKind::Toggle,
        NodeKind::InputImage => ParamKind::Image,
        NodeKind::InputVideo => ParamKind::Video,
        _ => match current {
            InputValue::Bool(_) => ParamKind::Toggle,
            InputValue::Int(_) | InputValue::Unsigned(_) => ParamKind::Integer {
                min: None,
                max: None,
            },
            InputValue::Float(_) => ParamKind::Float {
                min: None,
                max: None,
            },
            _ => ParamKind::Text { prompt: false },
        },
    };

    let default = default_value(&kind, current);

    Ok(Some(ParameterSpec {
        name: name.to_string(),
        node_id: node.id.clone(),
        target_input: target_input.to_string(),
        kind,
        default,
    }))
}

fn default_value(kind: &ParamKind, current: &InputValue) -> Option<ParamValue> {
    match (kind, current) {
        (ParamKind::Seed, InputValue::Int(i)) if *i < 0 => Some(ParamValue::Seed(SeedValue::Auto)),
        (ParamKind::Seed, InputValue::Int(i)) => Some(ParamValue::Seed(SeedValue::Fixed(*i as u64))),
        (ParamKind::Seed, InputValue::Unsigned(u)) => {
            Some(ParamValue::Seed(SeedValue::Fixed(*u)))
        }
        (ParamKind::Integer { .. }, v) => v.as_i64().map(ParamValue::Integer),
        (ParamKind::Float { .. }, v) => v.as_f64().map(ParamValue::Float),
        (ParamKind::Text { .. }, InputValue::Text(s)) => Some(ParamValue::Text(s.clone())),
        (ParamKind::Choice { .. }, InputValue::Text(s)) => Some(ParamValue::Choice(s.clone())),
        (ParamKind::Toggle, InputValue::Bool(b)) => Some(ParamValue::Toggle(*b)),
        (ParamKind::Image, InputValue::Text(s)) if !s.is_empty() => {
            Some(ParamValue::Image(MediaRef::Local(s.into())))
        }
        (ParamKind::Video, InputValue::Text(s)) if !s.is_empty() => {
            Some(ParamValue::Video(MediaRef::Local(s.into())))
        }
        _ => None,
    }
}
