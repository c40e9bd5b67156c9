use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures contained to a single node. The display string is what ends up
/// in `PipelineNode::error`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Function '{function}' not found in workflow '{workflow}'")]
    ResolutionFailure { workflow: String, function: String },

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Delegation failed: {0}")]
    Delegation(String),

    #[error("Activation limit of {limit} reached")]
    ActivationLimit { limit: usize },
}

impl StepError {
    /// Wrap any displayable failure raised by a step body
    pub fn runtime(message: impl std::fmt::Display) -> Self {
        StepError::Runtime(message.to_string())
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Step not found: {0}")]
    NotFound(String),

    #[error("Duplicate step '{name}' in workflow '{workflow}'")]
    DuplicateStep { workflow: String, name: String },

    #[error("Invalid workflow: {0}")]
    Invalid(String),
}
