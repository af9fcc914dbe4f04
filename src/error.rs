use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Pin number out of range: {0}")]
    Range(u32),
    #[error("Pin already allocated: {0}")]
    AlreadyAllocated(u32),
    #[error("Pin not allocated: {0}")]
    NotAllocated(u32),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO I/O error: {0}")]
    Io(String),
    #[error("Edge poller stopped: {0}")]
    PollerStopped(String),
    #[error("Controller is shut down")]
    ShutDown,
}
