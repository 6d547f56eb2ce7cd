//! wsfs error types and the mapping from system errors to wire status codes.

use std::{io, string::FromUtf8Error};

pub use nix::errno::Errno;

use crate::fcall::{FieldKind, Opcode, Status};

/// Failure decoding a single field of a command record
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The record ended before the field was complete
    #[error("short read")]
    ShortRead,

    /// The string field is not valid UTF-8
    #[error("malformed string: {0}")]
    MalformedString(#[from] FromUtf8Error),

    /// Copying a payload into its pooled buffer failed
    #[error("payload copy failed: {0}")]
    CopyError(#[source] io::Error),
}

/// Errors raised by the decode loop and by command handlers.
///
/// The decode variants (`TruncatedHeader`, `UnknownCommand`,
/// `MalformedCommand`) are fatal to the connection: the stream has no way to
/// find the start of the next command once one is misread. Every other
/// variant is reported to the client through a response and the connection
/// goes on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The record is too short to hold the client mark and opcode
    #[error("truncated record header")]
    TruncatedHeader { client_mark: Option<u8> },

    /// The opcode is not in the command table
    #[error("unknown command code {opcode}")]
    UnknownCommand { client_mark: u8, opcode: u8 },

    /// An argument of a known command failed to decode
    #[error("malformed {opcode:?} command, field {index} ({kind:?}): {source}")]
    MalformedCommand {
        client_mark: u8,
        opcode: Opcode,
        index: usize,
        kind: FieldKind,
        source: DecodeError,
    },

    /// A handler failure carrying an explicit wire status
    #[error("{}", .0.message())]
    Status(Status),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The connection's response channel is gone
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Status code sent to the client for this error
    pub fn status(&self) -> Status {
        match *self {
            Error::Status(status) => status,
            Error::Io(ref e) => io_status(e),
            Error::TruncatedHeader { .. }
            | Error::UnknownCommand { .. }
            | Error::MalformedCommand { .. } => Status::Invalid,
            Error::Closed => Status::Io,
        }
    }

    /// If the error means the command stream is desynchronized
    pub fn is_fatal(&self) -> bool {
        matches!(
            *self,
            Error::TruncatedHeader { .. }
                | Error::UnknownCommand { .. }
                | Error::MalformedCommand { .. }
        )
    }

    /// Client mark of the record the error was raised for, if it was read
    pub fn client_mark(&self) -> Option<u8> {
        match *self {
            Error::TruncatedHeader { client_mark } => client_mark,
            Error::UnknownCommand { client_mark, .. }
            | Error::MalformedCommand { client_mark, .. } => Some(client_mark),
            _ => None,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(status)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Status(From::from(errno))
    }
}

impl From<Errno> for Status {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EACCES | Errno::EROFS | Errno::EFAULT | Errno::EPERM => Status::Access,
            Errno::EBUSY => Status::Busy,
            Errno::EEXIST => Status::Exists,
            Errno::ENAMETOOLONG => Status::TooLong,
            Errno::EINVAL => Status::Invalid,
            Errno::EBADF => Status::InvalidFd,
            Errno::ENOENT => Status::NotExists,
            Errno::ELOOP => Status::Loop,
            Errno::EDQUOT | Errno::ENOSPC => Status::NoSpace,
            Errno::ENOTEMPTY => Status::NotEmpty,
            Errno::ENOTDIR => Status::Type,
            Errno::EIO => Status::Io,
            Errno::EOPNOTSUPP => Status::NotSupport,
            _ => Status::Unknown,
        }
    }
}

fn io_status(e: &io::Error) -> Status {
    if let Some(raw) = e.raw_os_error() {
        return From::from(Errno::from_raw(raw));
    }

    match e.kind() {
        io::ErrorKind::NotFound => Status::NotExists,
        io::ErrorKind::PermissionDenied => Status::Access,
        io::ErrorKind::AlreadyExists => Status::Exists,
        _ => Status::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_to_status() {
        assert_eq!(Status::from(Errno::ENOENT), Status::NotExists);
        assert_eq!(Status::from(Errno::EROFS), Status::Access);
        assert_eq!(Status::from(Errno::ENOSPC), Status::NoSpace);
        assert_eq!(Status::from(Errno::EBADF), Status::InvalidFd);
        assert_eq!(Status::from(Errno::EXDEV), Status::Unknown);
    }

    #[test]
    fn io_error_status() {
        let os = Error::Io(io::Error::from_raw_os_error(Errno::ENOTEMPTY as i32));
        assert_eq!(os.status(), Status::NotEmpty);

        let kind = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(kind.status(), Status::NotExists);

        let other = Error::Io(io::Error::other("boom"));
        assert_eq!(other.status(), Status::Unknown);
    }

    #[test]
    fn decode_errors_are_fatal() {
        let e = Error::MalformedCommand {
            client_mark: 4,
            opcode: Opcode::Seek,
            index: 2,
            kind: FieldKind::I64,
            source: DecodeError::ShortRead,
        };
        assert!(e.is_fatal());
        assert_eq!(e.client_mark(), Some(4));
        assert_eq!(e.status(), Status::Invalid);
        assert_eq!(e.to_string(), "malformed Seek command, field 2 (I64): short read");

        let e = Error::from(Errno::ENOENT);
        assert!(!e.is_fatal());
        assert_eq!(e.client_mark(), None);
        assert_eq!(e.to_string(), "no such file or directory");
    }
}
