//! Runtime estimation.
//!
//! A run's cost is approximated as `width * height * steps * frames * cfg`
//! "ops", read from the exposed parameters by title keyword. Dividing by a
//! per-GPU (and optionally per-workflow) rate gives seconds.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::graph::ExecutionGraph;
use crate::template::{InputValue, NodeKind, WorkflowTemplate};

const DEFAULT_WIDTH: f64 = 1000.0;
const DEFAULT_HEIGHT: f64 = 1000.0;
const DEFAULT_STEPS: f64 = 10.0;
const DEFAULT_FRAMES: f64 = 1.0;

/// Multi-sampler workflows often apply CFG to one sampler only, so any
/// CFG above 1 is costed at this factor rather than a full 2x.
const CFG_FACTOR: f64 = 1.6;

/// Identifier returned when a device string names no known GPU.
pub const UNKNOWN_GPU: &str = "unknown";

static DIMENSIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*[xX,]\s*(\d+)").expect("valid regex"));

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Dimensions {
    width: Option<f64>,
    height: Option<f64>,
    aspect: Option<String>,
    steps: Option<f64>,
    frames: Option<f64>,
    cfg: Option<f64>,
}

/// Estimate the cost of one run of `graph`, built from `template`.
pub fn estimate_ops(template: &WorkflowTemplate, graph: &ExecutionGraph) -> f64 {
    let mut dims = Dimensions::default();
    let mut media_size: Option<(f64, f64)> = None;

    for node in template.nodes() {
        if !node.kind.is_input() {
            continue;
        }
        if matches!(node.kind, NodeKind::InputImage | NodeKind::InputVideo) {
            if let Some((w, h)) = node.input_size {
                media_size = Some((w as f64, h as f64));
            }
        }

        let Some(title) = node.inputs.get("title").and_then(InputValue::as_str) else {
            continue;
        };
        let title = title.to_lowercase();
        // Values come from the built graph so user overrides are costed.
        let Some(value) = graph
            .node(&node.id)
            .and_then(|n| n.inputs.get("value"))
            .or_else(|| node.inputs.get("value"))
        else {
            continue;
        };

        if title.contains("step") {
            dims.steps = number(value);
        } else if title.contains("width") {
            dims.width = number(value);
        } else if title.contains("height") {
            dims.height = number(value);
        } else if title.contains("aspect") || title.contains("ratio") {
            dims.aspect = value.as_str().map(str::to_string);
        } else if title.contains("frame") {
            dims.frames = number(value);
        } else if title.contains("cfg") {
            dims.cfg = number(value);
        }
    }

    if dims.width.is_none() || dims.height.is_none() {
        if let Some(caps) = dims.aspect.as_deref().and_then(|a| DIMENSIONS_RE.captures(a)) {
            dims.width = dims.width.or_else(|| caps[1].parse().ok());
            dims.height = dims.height.or_else(|| caps[2].parse().ok());
        }
    }

    let (default_w, default_h) = media_size.unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));
    let cfg = match dims.cfg {
        Some(c) if c > 1.0 => CFG_FACTOR,
        _ => 1.0,
    };

    dims.width.unwrap_or(default_w)
        * dims.height.unwrap_or(default_h)
        * dims.steps.unwrap_or(DEFAULT_STEPS)
        * dims.frames.unwrap_or(DEFAULT_FRAMES)
        * cfg
}

fn number(value: &InputValue) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

// ---------------------------------------------------------------------------
// GPU rates
// ---------------------------------------------------------------------------

const GPU_IDENTIFIERS: &[&str] = &[
    "3090", "3090ti", "3080ti", "3080", "3070ti", "3070", "3060ti", "3060", "4090", "4080",
    "4070ti", "4070", "4060ti", "4060", "2080ti", "2080super", "2080", "2070super", "2070",
    "2060super", "2060", "5090", "5080", "5070", "5060", "rx7900xtx", "rx7900xt", "rx7800xt",
    "rx6950xt", "rx6900xt", "rx6800xt", "rx6800", "rx6700xt", "3080laptop", "3070laptop",
    "4070laptop", "4060laptop",
];

/// Map a server device string (e.g. `"cuda:0 NVIDIA GeForce RTX 4090 : cudaMallocAsync"`)
/// to a GPU identifier such as `"4090"`.
///
/// The most specific identifier wins, so `"RTX 3090 Ti"` maps to `"3090ti"`.
pub fn gpu_from_device_name(device: &str) -> &'static str {
    let compact: String = device
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();

    GPU_IDENTIFIERS
        .iter()
        .filter(|id| compact.contains(*id))
        .max_by_key(|id| id.len())
        .copied()
        .unwrap_or(UNKNOWN_GPU)
}

/// Ops-per-second table keyed by workflow name, then GPU identifier.
#[derive(Debug, Clone)]
pub struct PerformanceTable {
    rates: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for PerformanceTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert("Wan22-I2V-Lora-Lightning-API", "3090", 566_065.0);
        table.insert("Wan22-I2V-Lora-Lightning-API", "5090", 1_850_000.0);
        table.insert("z_image_turbo-API", "3090", 800_920.0);
        table.insert("z_image_turbo-API", "5090", 1_900_000.0);
        table.insert("Wan22-Extend-24G-Q6-API", "3090", 500_000.0);
        table.insert("Wan22-Extend-24G-Q6-API", "5090", 1_750_000.0);

        // Rough per-GPU guesses relative to a 3090 baseline.
        for (gpu, rate) in [
            ("3090", 600_000.0),
            ("3090ti", 650_000.0),
            ("3080ti", 550_000.0),
            ("3080", 500_000.0),
            ("3070ti", 420_000.0),
            ("3070", 400_000.0),
            ("3060ti", 350_000.0),
            ("3060", 280_000.0),
            ("4090", 1_100_000.0),
            ("4080", 900_000.0),
            ("4070ti", 750_000.0),
            ("4070", 650_000.0),
            ("4060ti", 500_000.0),
            ("4060", 400_000.0),
            ("2080ti", 350_000.0),
            ("2080super", 300_000.0),
            ("2080", 280_000.0),
            ("2070super", 250_000.0),
            ("2070", 230_000.0),
            ("2060super", 200_000.0),
            ("2060", 180_000.0),
            ("5090", 1_500_000.0),
            ("5080", 900_000.0),
            ("5070", 650_000.0),
            ("5060", 400_000.0),
            ("rx7900xtx", 700_000.0),
            ("rx7900xt", 650_000.0),
            ("rx7800xt", 550_000.0),
            ("rx6950xt", 500_000.0),
            ("rx6900xt", 480_000.0),
            ("rx6800xt", 450_000.0),
            ("rx6800", 420_000.0),
            ("rx6700xt", 380_000.0),
            ("3080laptop", 400_000.0),
            ("3070laptop", 320_000.0),
            ("4070laptop", 550_000.0),
            ("4060laptop", 350_000.0),
        ] {
            table.insert("Guesses", gpu, rate);
        }
        table
    }
}

impl PerformanceTable {
    /// Rate used when the table is empty.
    pub const FALLBACK_RATE: f64 = 100_000.0;

    pub fn empty() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, workflow: &str, gpu: &str, rate: f64) {
        self.rates
            .entry(workflow.to_string())
            .or_default()
            .insert(gpu.to_string(), rate);
    }

    /// Look up a rate, falling back to the GPU's average across workflows,
    /// then the workflow's average across GPUs, then the overall average.
    pub fn rate(&self, workflow: &str, gpu: &str) -> f64 {
        if let Some(rate) = self.rates.get(workflow).and_then(|w| w.get(gpu)) {
            return *rate;
        }

        let by_gpu: Vec<f64> = self.rates.values().filter_map(|w| w.get(gpu)).copied().collect();
        if let Some(avg) = average(&by_gpu) {
            return avg;
        }

        if let Some(avg) = self
            .rates
            .get(workflow)
            .and_then(|w| average(&w.values().copied().collect::<Vec<_>>()))
        {
            return avg;
        }

        let all: Vec<f64> = self.rates.values().flat_map(|w| w.values()).copied().collect();
        average(&all).unwrap_or(Self::FALLBACK_RATE)
    }

    /// Estimated seconds for `ops` on `gpu`.
    pub fn estimate_secs(&self, workflow: &str, gpu: &str, ops: f64) -> f64 {
        ops / self.rate(workflow, gpu)
    }
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}
