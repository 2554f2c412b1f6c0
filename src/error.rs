use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmError {
    InvalidParameter,
    StaleHandle,
    NoFreeSlot,
    QueueFull,
    WaitSetFull,
    WouldBlock,
    Busy,
    Inactive,
    NotInterruptSafe,
    NotQueueable,
    NotAttached,
    AlreadyAttached,
    InvalidResumePoint,
    StateDepthExceeded,
}

impl SmError {
    pub fn as_str(self) -> &'static str {
        match self {
            SmError::InvalidParameter => "Invalid parameter",
            SmError::StaleHandle => "Handle refers to a released slot",
            SmError::NoFreeSlot => "No free slot left",
            SmError::QueueFull => "Event queue is full",
            SmError::WaitSetFull => "Sync wait set is full",
            SmError::WouldBlock => "Resource is busy",
            SmError::Busy => "Machine is currently dispatching",
            SmError::Inactive => "Machine is not active",
            SmError::NotInterruptSafe => "Event may not be posted from interrupt context",
            SmError::NotQueueable => "Instant event cannot be queued",
            SmError::NotAttached => "Machine is not attached to that parent",
            SmError::AlreadyAttached => "Machine is already attached",
            SmError::InvalidResumePoint => "Protothread resumed at an unknown point",
            SmError::StateDepthExceeded => "State hierarchy is too deep or cyclic",
        }
    }
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SmError {}

pub type SmResult<T> = Result<T, SmError>;
