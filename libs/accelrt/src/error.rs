// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

/// Numeric status codes shared by the library and the RPC wire format.
///
/// Values are stable: they cross process boundaries in every RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    NotFound = 1,
    NotAvailable = 2,
    NotImplemented = 3,
    InvalidOperation = 4,
    InvalidArgument = 5,
    InternalFailure = 6,
    OutOfMemory = 7,
    AbortedByUser = 8,
    Timeout = 9,
    NotSupported = 10,
    Io = 11,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::NotFound,
            2 => Self::NotAvailable,
            3 => Self::NotImplemented,
            4 => Self::InvalidOperation,
            5 => Self::InvalidArgument,
            6 => Self::InternalFailure,
            7 => Self::OutOfMemory,
            8 => Self::AbortedByUser,
            9 => Self::Timeout,
            10 => Self::NotSupported,
            11 => Self::Io,
            _ => return None,
        })
    }
}

#[derive(Error, Debug)]
pub enum AccelError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal failure: {0}")]
    InternalFailure(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Aborted by user: {0}")]
    AbortedByUser(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AccelError {
    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::NotAvailable(_) => Status::NotAvailable,
            Self::NotImplemented(_) => Status::NotImplemented,
            Self::InvalidOperation(_) => Status::InvalidOperation,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::InternalFailure(_) | Self::Other(_) => Status::InternalFailure,
            Self::OutOfMemory(_) => Status::OutOfMemory,
            Self::AbortedByUser(_) => Status::AbortedByUser,
            Self::Timeout(_) => Status::Timeout,
            Self::NotSupported(_) => Status::NotSupported,
            Self::Io(_) => Status::Io,
        }
    }

    /// Rebuild an error from a wire status code.
    ///
    /// Returns `None` for [`Status::Success`]. Unknown codes become
    /// `InternalFailure` so a newer peer never crashes an older one.
    pub fn from_status(code: u32, context: impl Into<String>) -> Option<Self> {
        let context = context.into();
        let status = match Status::from_code(code) {
            Some(status) => status,
            None => {
                return Some(Self::InternalFailure(format!(
                    "{} (unknown status code {})",
                    context, code
                )));
            }
        };
        Some(match status {
            Status::Success => return None,
            Status::NotFound => Self::NotFound(context),
            Status::NotAvailable => Self::NotAvailable(context),
            Status::NotImplemented => Self::NotImplemented(context),
            Status::InvalidOperation => Self::InvalidOperation(context),
            Status::InvalidArgument => Self::InvalidArgument(context),
            Status::InternalFailure => Self::InternalFailure(context),
            Status::OutOfMemory => Self::OutOfMemory(context),
            Status::AbortedByUser => Self::AbortedByUser(context),
            Status::Timeout => Self::Timeout(context),
            Status::NotSupported => Self::NotSupported(context),
            Status::Io => Self::Io(std::io::Error::other(context)),
        })
    }

    /// A user-initiated abort is resumable and must never be folded into
    /// generic failure handling.
    pub fn is_aborted_by_user(&self) -> bool {
        matches!(self, Self::AbortedByUser(_))
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;

/// Wire status of a result.
pub fn status_of<T>(result: &Result<T>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}
