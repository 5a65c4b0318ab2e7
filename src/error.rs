use crate::kernel::devices::DeviceError;
use crate::kernel::process::ProcessError;
use crate::kernel::protocol::ProtocolError;
use crate::kernel::services::ServiceError;
use crate::kernel::store::StoreError;
use crate::kernel::topic::TopicError;
use thiserror::Error;

/// Any failure surfaced by the kernel library
#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[cfg(unix)]
    #[error(transparent)]
    Client(#[from] crate::kernel::client::ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
