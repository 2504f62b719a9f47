use thiserror::Error;

/// Error types for the reconfit-rs library.
#[derive(Error, Debug)]
pub enum ReconError {
    /// A parameter name was declared twice, either within one store or by two
    /// components of the same model.
    #[error("Duplicate parameter: '{0}' is already declared")]
    DuplicateParameter(String),

    /// A parameter update violates the declared bounds.
    #[error("Parameter '{name}' value {value} is outside bounds [{min}, {max}]")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Bounds with min > max, or non-finite parameter values.
    #[error("Invalid bounds for parameter '{name}': [{min}, {max}]")]
    InvalidBounds { name: String, min: f64, max: f64 },

    /// Image, weight, model output or vector shapes disagree.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The damped normal equations could not be solved.
    #[error("Singular normal-equations system: {0}")]
    SingularSystem(String),

    /// Step rejections exhausted the retry budget.
    #[error("Optimization stalled after {rejections} consecutive step rejections (lambda = {lambda:.3e})")]
    StalledOptimization { rejections: usize, lambda: f64 },

    /// Parameter not found.
    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    /// Invalid input data or model definition.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for reconfit-rs operations.
pub type Result<T> = std::result::Result<T, ReconError>;

impl ReconError {
    /// Returns true for errors raised by eager validation (declaration, update
    /// or shape checks), as opposed to numerical failures of the optimizer.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ReconError::DuplicateParameter(_)
                | ReconError::OutOfBounds { .. }
                | ReconError::InvalidBounds { .. }
                | ReconError::ShapeMismatch(_)
                | ReconError::ParameterNotFound(_)
                | ReconError::InvalidInput(_)
        )
    }
}
