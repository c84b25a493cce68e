/// Errors surfaced to callers of the navigation engine.
///
/// Refinement problems never appear here: the synthesizer absorbs them into
/// a grounded fallback instruction. `RefinementUnavailable` exists so the
/// refiner and diagnostics can name the condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NavError {
    #[error("No navigation session for id '{0}'")]
    SessionNotFound(String),
    #[error("Current location is not available")]
    LocationUnavailable,
    #[error("Route unavailable: {0}")]
    RouteUnavailable(String),
    #[error("Refinement unavailable: {0}")]
    RefinementUnavailable(String),
    #[error("Reroute failed: {0}")]
    RerouteFailed(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type NavResult<T> = Result<T, NavError>;
