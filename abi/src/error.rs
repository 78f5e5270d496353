//! Errno mapping for scheduler operations exposed across the kernel boundary.

/// Errors a scheduler operation can hand back to its caller. Each variant
/// corresponds to one of the negative errno values a caller in a POSIX-style
/// kernel would expect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// Bad argument: out-of-range nice value, unknown policy, malformed mask.
    InvalidArgument,
    /// Caller lacks privilege for the requested change (e.g. raising a task
    /// into an RT policy without the required capability).
    PermissionDenied,
    /// No task exists with the given id.
    NoSuchTask,
    /// A pointer or buffer supplied by the caller was not valid.
    BadAddress,
    /// The task table (or another fixed-capacity arena) is full.
    OutOfMemory,
}

impl SchedError {
    /// Negative errno value, as named in the scheduler's external interface.
    #[inline]
    pub const fn errno(self) -> i32 {
        match self {
            Self::PermissionDenied => -1,
            Self::NoSuchTask => -3,
            Self::BadAddress => -14,
            Self::InvalidArgument => -22,
            Self::OutOfMemory => -12,
        }
    }
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::InvalidArgument => "invalid argument",
            Self::PermissionDenied => "permission denied",
            Self::NoSuchTask => "no such task",
            Self::BadAddress => "bad address",
            Self::OutOfMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

pub type SchedResult<T> = Result<T, SchedError>;
