/// Errors raised while turning a workflow template and parameter set into
/// an execution graph.
///
/// Always local to the caller and never retried automatically.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("Parameter '{name}' is invalid: {reason}")]
    ParameterInvalid { name: String, reason: String },

    #[error("Workflow template is malformed: {0}")]
    TemplateMalformed(String),
}

impl BuildError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::ParameterInvalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::TemplateMalformed(reason.into())
    }
}
