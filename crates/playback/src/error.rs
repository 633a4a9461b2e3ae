use thiserror::Error;

/// Failure kinds of a player instance.
///
/// All variants except [`PlayerError::FrameMap`] are sticky: once one is
/// recorded the instance refuses further transport operations until it is
/// closed and reopened. A frame that cannot be materialized only skips one
/// tick.
#[derive(Debug, Clone, Error)]
pub enum PlayerError {
    #[error("invalid media locator: {0}")]
    InvalidLocator(String),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("backend construction failed: {0}")]
    BackendConstruction(String),
    #[error("backend refused state change: {0}")]
    BackendStateChange(String),
    #[error("frame could not be materialized")]
    FrameMap,
}

impl PlayerError {
    /// Whether this failure permanently disables the instance.
    pub fn is_sticky(&self) -> bool {
        !matches!(self, PlayerError::FrameMap)
    }
}
