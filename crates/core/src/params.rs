//! Typed parameter values supplied for a template's exposed parameters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Serialize, Serializer};

use crate::error::BuildError;
use crate::template::ParamKind;

/// A seed parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedValue {
    Fixed(u64),
    /// Draw a seed for each run (stored as `-1` in templates).
    Auto,
}

/// Reference to an image or video input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    /// A file already present in the server's input folder.
    Server(String),
    /// A local file that still has to be uploaded.
    Local(PathBuf),
}

/// A concrete value for one exposed parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Choice(String),
    Toggle(bool),
    Seed(SeedValue),
    Image(MediaRef),
    Video(MediaRef),
}

impl ParamValue {
    /// Parse a user-entered string against a declared parameter kind.
    pub fn parse_for(name: &str, kind: &ParamKind, text: &str) -> Result<Self, BuildError> {
        let text = text.trim();
        match kind {
            ParamKind::Integer { .. } => text
                .parse()
                .map(Self::Integer)
                .map_err(|_| BuildError::invalid(name, format!("'{text}' is not an integer"))),
            ParamKind::Float { .. } => text
                .parse()
                .map(Self::Float)
                .map_err(|_| BuildError::invalid(name, format!("'{text}' is not a number"))),
            ParamKind::Text { .. } => Ok(Self::Text(text.to_string())),
            ParamKind::Choice { .. } => Ok(Self::Choice(text.to_string())),
            ParamKind::Toggle => match text.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Self::Toggle(true)),
                "false" | "no" | "off" | "0" => Ok(Self::Toggle(false)),
                _ => Err(BuildError::invalid(name, format!("'{text}' is not a boolean"))),
            },
            ParamKind::Seed => match text {
                "-1" | "auto" | "random" => Ok(Self::Seed(SeedValue::Auto)),
                _ => text
                    .parse()
                    .map(|s| Self::Seed(SeedValue::Fixed(s)))
                    .map_err(|_| BuildError::invalid(name, format!("'{text}' is not a seed"))),
            },
            ParamKind::Image => Ok(Self::Image(media_ref(text))),
            ParamKind::Video => Ok(Self::Video(media_ref(text))),
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Choice(_) => "choice",
            Self::Toggle(_) => "toggle",
            Self::Seed(_) => "seed",
            Self::Image(_) => "image",
            Self::Video(_) => "video",
        }
    }

    /// JSON form used in sidecar metadata.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Integer(i) => (*i).into(),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) | Self::Choice(s) => s.clone().into(),
            Self::Toggle(b) => (*b).into(),
            Self::Seed(SeedValue::Fixed(s)) => (*s).into(),
            Self::Seed(SeedValue::Auto) => (-1).into(),
            Self::Image(m) | Self::Video(m) => match m {
                MediaRef::Server(name) => name.clone().into(),
                MediaRef::Local(path) => path.display().to_string().into(),
            },
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// `server:name` addresses a file already on the server; anything else is a
/// local path.
fn media_ref(text: &str) -> MediaRef {
    match text.strip_prefix("server:") {
        Some(name) => MediaRef::Server(name.to_string()),
        None => MediaRef::Local(PathBuf::from(text)),
    }
}

/// Mapping from parameter name to value, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParamValue) -> &mut Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ParamValue> {
        self.0.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
