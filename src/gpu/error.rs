use std::fmt;

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VulkanError {
    res: vk::Result,
}

impl VulkanError {
    pub fn result(&self) -> vk::Result {
        self.res
    }
}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vulkan Error: {}", self.res)
    }
}

/// Every failure the allocation and transfer paths can report.
///
/// Running out of room in a pool or in the staging arena is not represented
/// here: pool allocation returns `None` and the staging arena queues the
/// request until space is released.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GPUError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("out of memory: requested {requested} bytes (limit {limit})")]
    OutOfMemory { requested: u64, limit: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("ownership transfer requested within queue family {family}")]
    ProtocolViolation { family: u32 },
    #[error("{0}")]
    Vulkan(VulkanError),
    #[error("completion dropped before it resolved")]
    Abandoned,
}

impl GPUError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        GPUError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Convenient crate-wide result type.
pub type Result<T, E = GPUError> = std::result::Result<T, E>;

impl From<vk::Result> for GPUError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GPUError::OutOfMemory {
                    requested: 0,
                    limit: 0,
                }
            }
            res => GPUError::Vulkan(VulkanError { res }),
        }
    }
}
