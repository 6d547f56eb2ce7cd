//! wsfs protocol data types and constants.
//!
//! # Protocol
//! WSFS/draft.1

use std::io::{self, BufRead, Write};

use bitflags::bitflags;
use enum_primitive::*;

use crate::{error::DecodeError, pool::BufferPool, pool::PooledBuf, serialize::Field};

/// WebSocket sub-protocol name negotiated by wsfs clients
pub const SUBPROTOCOL: &str = "WSFS/draft.1";

/// Largest payload a single data response carries
pub const DATA_PER_MSG: usize = 4096;

/// Largest read a client may request in one command
pub const MAX_DATA_IN_A_READ: usize = DATA_PER_MSG * 16;

/// client_mark[1] status[1]
pub const RESPONSE_HEADER_SIZE: usize = 2;

/// client_mark[1] opcode[1]
pub const REQUEST_HEADER_SIZE: usize = 2;

/// Message sent back when a record cannot be decoded
pub const BAD_COMMAND: &str = "Bad command format or unknown command";

enum_from_primitive! {
    #[doc = "Command code, the second byte of every request record"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Opcode {
        Open            = 1,
        Close,
        Read,
        ReadDir,
        ReadLink,
        Write,
        Seek,
        Allocate,
        GetAttr,
        SetAttr,
        Sync,
        Mkdir,
        SymLink,
        Remove,
        RmDir,
        FsStat,
        ReadAt,
        WriteAt,
        CopyFileRange,
        Rename,
        SetAttrByFd,
    }
}

enum_from_primitive! {
    #[doc = "Status code, the second byte of every response record"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Status {
        Ok              = 0,
        PartialResponse,        // more responses for the same client mark follow
        Unknown,
        Busy,
        Exists,
        NotExists,
        Loop,
        NoSpace,
        NotEmpty,
        Invalid,
        InvalidFd,
        Type,
        Io,
        NotSupport,
        Access,
        TooLong,
    }
}

impl Status {
    /// Short human readable description
    pub fn message(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::PartialResponse => "partial response",
            Status::Unknown => "unknown error",
            Status::Busy => "device or resource busy",
            Status::Exists => "file exists",
            Status::NotExists => "no such file or directory",
            Status::Loop => "too many levels of symbolic links",
            Status::NoSpace => "no space left on device",
            Status::NotEmpty => "directory not empty",
            Status::Invalid => "invalid argument",
            Status::InvalidFd => "bad file descriptor",
            Status::Type => "wrong file type",
            Status::Io => "input/output error",
            Status::NotSupport => "operation not supported",
            Status::Access => "permission denied",
            Status::TooLong => "file name too long",
        }
    }

    /// If the response terminates the exchange for its client mark
    pub fn is_final(self) -> bool {
        self != Status::PartialResponse
    }
}

/// Wire type of a single command argument
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// NUL terminated UTF-8 string
    Str,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Raw bytes up to the end of the record
    Data,
}

bitflags! {
    /// Bits in the `mask` argument of `SetAttr`/`SetAttrByFd`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SetAttrMask: u8 {
        const SIZE      = 0b0001;
        const MTIME     = 0b0010;
        const MODE      = 0b0100;
        const OWNER     = 0b1000;
    }
}

bitflags! {
    /// Bits in the `mode` argument of `Allocate`, same values as fallocate(2)
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct FallocFlags: u32 {
        const KEEP_SIZE         = 0x01;
        const PUNCH_HOLE        = 0x02;
        const COLLAPSE_RANGE    = 0x08;
        const ZERO_RANGE        = 0x10;
        const INSERT_RANGE      = 0x20;
        const UNSHARE_RANGE     = 0x40;
    }
}

enum_from_primitive! {
    #[doc = "The `whence` argument of `Seek`"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Whence {
        Set     = 0,
        Cur,
        End,
        Data,
        Hole,
    }
}

enum_from_primitive! {
    #[doc = "Ownership of a file relative to the serving user, `SetAttr` owner argument"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Owner {
        NN      = 0,    // neither user nor group match
        UN,             // user matches
        NG,             // group matches
        UG,             // user and group match
    }
}

/// A decoded request record
#[derive(Debug, PartialEq)]
pub struct Request {
    /// Client chosen tag echoed in every response to this command
    pub client_mark: u8,
    /// Command body
    pub command: Command,
}

/// Declares the command table.
///
/// Every entry names a command and its arguments in wire order. The
/// argument types decide the field kinds through their `Field` impl, so the
/// `Command` enum, `Opcode::schema` and the field codecs cannot drift apart.
macro_rules! commands {
    ($($name:ident { $($field:ident: $typ:ty),* $(,)? })*) => {
        /// Command with its arguments, in the order they appear on the wire
        #[derive(Debug, PartialEq)]
        pub enum Command {
            $($name { $($field: $typ),* },)*
        }

        impl Command {
            /// Opcode this command is sent with
            pub fn opcode(&self) -> Opcode {
                match *self {
                    $(Command::$name { .. } => Opcode::$name,)*
                }
            }
        }

        impl Opcode {
            /// Argument kinds of this command, in wire order
            pub fn schema(self) -> &'static [FieldKind] {
                match self {
                    $(Opcode::$name => {
                        const SCHEMA: &[FieldKind] = &[$(<$typ as Field>::KIND),*];
                        SCHEMA
                    })*
                }
            }
        }

        /// Decode the arguments of `opcode` one field at a time.
        ///
        /// On failure returns the position and kind of the offending field.
        pub(crate) fn decode_fields<R: BufRead>(
            opcode: Opcode,
            r: &mut R,
            pool: &BufferPool,
        ) -> Result<Command, (usize, FieldKind, DecodeError)> {
            match opcode {
                $(Opcode::$name => {
                    let mut _index = 0usize;
                    Ok(Command::$name {
                        $($field: {
                            let value = <$typ as Field>::decode(r, pool)
                                .map_err(|e| (_index, <$typ as Field>::KIND, e))?;
                            _index += 1;
                            value
                        }),*
                    })
                })*
            }
        }

        pub(crate) fn encode_fields<W: Write>(command: &Command, w: &mut W) -> io::Result<usize> {
            match command {
                $(Command::$name { $($field),* } => {
                    let mut bytes = 0;
                    $(bytes += Field::encode($field, w)?;)*
                    Ok(bytes)
                })*
            }
        }
    };
}

commands! {
    Open            { path: String, flags: u32, mode: u32 }
    Close           { fd: u32 }
    Read            { fd: u32, size: u64 }
    ReadDir         { path: String }
    ReadLink        { path: String }
    Write           { fd: u32, data: PooledBuf }
    Seek            { fd: u32, whence: u8, offset: i64 }
    Allocate        { fd: u32, mode: u32, offset: u64, len: u64 }
    GetAttr         { path: String }
    SetAttr         { path: String, mask: u8, size: u64, mtime: i64, mode: u32, owner: u8 }
    Sync            { fd: u32 }
    Mkdir           { path: String, mode: u32 }
    SymLink         { target: String, link: String }
    Remove          { path: String }
    RmDir           { path: String }
    FsStat          { path: String }
    ReadAt          { fd: u32, offset: u64, size: u64 }
    WriteAt         { fd: u32, offset: u64, data: PooledBuf }
    CopyFileRange   { fd_in: u32, fd_out: u32, off_in: u64, off_out: u64, len: u64 }
    Rename          { old_path: String, new_path: String, flags: u32 }
    SetAttrByFd     { fd: u32, mask: u8, size: u64, mtime: i64, mode: u32, owner: u8 }
}

impl Opcode {
    /// Every opcode, in wire order
    pub const ALL: [Opcode; 21] = [
        Opcode::Open,
        Opcode::Close,
        Opcode::Read,
        Opcode::ReadDir,
        Opcode::ReadLink,
        Opcode::Write,
        Opcode::Seek,
        Opcode::Allocate,
        Opcode::GetAttr,
        Opcode::SetAttr,
        Opcode::Sync,
        Opcode::Mkdir,
        Opcode::SymLink,
        Opcode::Remove,
        Opcode::RmDir,
        Opcode::FsStat,
        Opcode::ReadAt,
        Opcode::WriteAt,
        Opcode::CopyFileRange,
        Opcode::Rename,
        Opcode::SetAttrByFd,
    ];

    /// If the last argument is a raw payload running to the end of the record
    pub fn has_payload(self) -> bool {
        self.schema().last() == Some(&FieldKind::Data)
    }
}

impl<'a> From<&'a Request> for Opcode {
    fn from(request: &'a Request) -> Opcode {
        request.command.opcode()
    }
}
