use thiserror::Error;

use crate::FenceValue;

pub mod resource;

pub use resource::{CreateViewError, Device};

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("Parent device is lost")]
    Lost,
    #[error("Not enough memory left.")]
    OutOfMemory,
    #[error("Creation of a resource failed for a reason other than running out of memory.")]
    ResourceCreationFailed,
    #[error("Waited {waited_ms} ms for fence {fence:?} to reach {value}")]
    WaitTimeout {
        fence: String,
        value: FenceValue,
        waited_ms: u64,
    },
    #[error("The driver reported an unexpected error")]
    Unexpected,
}

impl From<hal::DeviceError> for DeviceError {
    fn from(error: hal::DeviceError) -> Self {
        match error {
            hal::DeviceError::Lost => DeviceError::Lost,
            hal::DeviceError::OutOfMemory => DeviceError::OutOfMemory,
            hal::DeviceError::ResourceCreationFailed => DeviceError::ResourceCreationFailed,
            hal::DeviceError::Unexpected => DeviceError::Unexpected,
        }
    }
}
