use core::fmt;
use std::io;

use tokio::sync::{mpsc, oneshot};

use crate::{directory::ObjectKind, id::GlobalId, net::wire::Command};

/// Every failure the runtime can report. Apart from the codes returned by
/// argument checks in the application surface, these are fatal: the node
/// that hits one stops and the cluster returns it.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    ChannelClosed,
    MalformedMessage(&'static str),
    MessageLengthMismatch { expected: usize, actual: usize },
    UnknownCommand(u8),
    UnknownObject(GlobalId),
    WrongObjectKind { id: GlobalId, expected: ObjectKind },
    AlreadyExists(GlobalId),
    UnexpectedSend(Command),
    ConfirmationOutOfOrder { task: GlobalId, expected: u64, received: u64 },
    LatchUnderflow(GlobalId),
    LatchIncrementAfterFire(GlobalId),
    EventAlreadyFired(GlobalId),
    EventDestroyed(GlobalId),
    BlockDestroyed(GlobalId),
    SlotOutOfRange { id: GlobalId, slot: u32 },
    AlreadySatisfied { id: GlobalId, slot: u32 },
    UnknownFunction(String),
    NotOwner(GlobalId),
    LockNotHeld(GlobalId),
    ProtocolViolation { id: GlobalId, what: &'static str },
    NotInTask,
    InvalidArgument(&'static str),
    FlushFailed { node: u32 },
    Checkpoint(String),
    ChecksumMismatch,
    TaskPanicked(GlobalId),
    ShutDown,
}

/// The POSIX-style codes the application surface reports.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Permission = 1,
    NotFound = 2,
    InvalidArgument = 22,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        use Error::*;
        match self {
            UnknownObject(_) | EventDestroyed(_) | BlockDestroyed(_) => {
                ErrorCode::NotFound
            }
            NotOwner(_) | UnexpectedSend(_) | LockNotHeld(_) | NotInTask => {
                ErrorCode::Permission
            }
            _ => ErrorCode::InvalidArgument,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Io(e) => write!(f, "io error: {}", e),
            ChannelClosed => write!(f, "channel closed"),
            MalformedMessage(what) => write!(f, "malformed message: {}", what),
            MessageLengthMismatch { expected, actual } => write!(
                f,
                "message length mismatch: expected {} bytes, got {}",
                expected, actual
            ),
            UnknownCommand(code) => write!(f, "unknown command code {}", code),
            UnknownObject(id) => write!(f, "unknown object {}", id),
            WrongObjectKind { id, expected } => {
                write!(f, "object {} is not a {:?}", id, expected)
            }
            AlreadyExists(id) => write!(f, "object {} already exists", id),
            UnexpectedSend(cmd) => {
                write!(f, "handler of {:?} tried to send a message", cmd)
            }
            ConfirmationOutOfOrder { task, expected, received } => write!(
                f,
                "confirmation for {} out of order: expected {}, got {}",
                task, expected, received
            ),
            LatchUnderflow(id) => write!(f, "latch {} decremented past zero", id),
            LatchIncrementAfterFire(id) => {
                write!(f, "latch {} incremented after firing", id)
            }
            EventAlreadyFired(id) => write!(f, "event {} already fired", id),
            EventDestroyed(id) => write!(f, "event {} was destroyed", id),
            BlockDestroyed(id) => write!(f, "data block {} was destroyed", id),
            SlotOutOfRange { id, slot } => {
                write!(f, "slot {} out of range for {}", slot, id)
            }
            AlreadySatisfied { id, slot } => {
                write!(f, "slot {} of {} satisfied twice", slot, id)
            }
            UnknownFunction(name) => write!(f, "unknown function {}", name),
            NotOwner(id) => write!(f, "not the owner of {}", id),
            LockNotHeld(id) => write!(f, "lock on {} is not held", id),
            ProtocolViolation { id, what } => {
                write!(f, "replication protocol violated on {}: {}", id, what)
            }
            NotInTask => write!(f, "operation requires a running task"),
            InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            FlushFailed { node } => {
                write!(f, "traffic moved during flush on node {}", node)
            }
            Checkpoint(what) => write!(f, "checkpoint error: {}", what),
            ChecksumMismatch => write!(f, "checkpoint checksum mismatch"),
            TaskPanicked(id) => write!(f, "task {} panicked", id),
            ShutDown => write!(f, "runtime is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let id = GlobalId::direct(1, 5);
        assert_eq!(Error::UnknownObject(id).code(), ErrorCode::NotFound);
        assert_eq!(Error::NotOwner(id).code(), ErrorCode::Permission);
        assert_eq!(
            Error::SlotOutOfRange { id, slot: 3 }.code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(ErrorCode::InvalidArgument as i32, 22);
    }
}
