//! Serialize/deserialize wsfs command records into/from binary.
//!
//! A request record is `client_mark[1] opcode[1]` followed by the
//! arguments of the opcode in schema order, with no separators:
//!
//! - integers are fixed width, little endian
//! - strings are UTF-8 terminated by a single NUL byte
//! - a data argument is always last and runs to the end of the record

use std::{
    io::{self, BufRead, Write},
    mem,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use crate::{
    error::{DecodeError, Error},
    fcall::{self, FieldKind, Opcode, Request},
    io_err,
    pool::{BufferPool, PooledBuf},
    utils::Result,
};

/// A value that can appear as a command argument.
///
/// `KIND` is what the command table records for the argument; `decode` reads
/// exactly one value from the record and `encode` writes it back.
pub trait Field: Sized {
    const KIND: FieldKind;

    /// Decode one value, taking payload buffers from `pool`
    fn decode<R: BufRead>(r: &mut R, pool: &BufferPool) -> ::std::result::Result<Self, DecodeError>;

    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize>;
}

fn short_read(_: io::Error) -> DecodeError {
    DecodeError::ShortRead
}

impl Field for u8 {
    const KIND: FieldKind = FieldKind::U8;

    fn decode<R: BufRead>(r: &mut R, _: &BufferPool) -> ::std::result::Result<Self, DecodeError> {
        r.read_u8().map_err(short_read)
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Field for i8 {
    const KIND: FieldKind = FieldKind::I8;

    fn decode<R: BufRead>(r: &mut R, _: &BufferPool) -> ::std::result::Result<Self, DecodeError> {
        r.read_i8().map_err(short_read)
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_i8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

macro_rules! int_field {
    ($typ:ty, $kind:ident, $read:ident, $write:ident) => {
        impl Field for $typ {
            const KIND: FieldKind = FieldKind::$kind;

            fn decode<R: BufRead>(r: &mut R, _: &BufferPool) -> ::std::result::Result<Self, DecodeError> {
                r.$read::<LittleEndian>().map_err(short_read)
            }

            fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
                w.$write::<LittleEndian>(*self).and(Ok(mem::size_of::<Self>()))
            }
        }
    };
}

int_field!(u16, U16, read_u16, write_u16);
int_field!(u32, U32, read_u32, write_u32);
int_field!(u64, U64, read_u64, write_u64);
int_field!(i16, I16, read_i16, write_i16);
int_field!(i32, I32, read_i32, write_i32);
int_field!(i64, I64, read_i64, write_i64);

impl Field for String {
    const KIND: FieldKind = FieldKind::Str;

    fn decode<R: BufRead>(r: &mut R, _: &BufferPool) -> ::std::result::Result<Self, DecodeError> {
        let mut buf = Vec::new();
        r.read_until(0, &mut buf).map_err(short_read)?;
        if buf.pop() != Some(0) {
            return Err(DecodeError::ShortRead);
        }
        Ok(String::from_utf8(buf)?)
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        write_str(w, self)
    }
}

/// Write `s` followed by its NUL terminator
pub fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<usize> {
    if s.as_bytes().contains(&0) {
        return Err(io_err!(InvalidInput, "string argument contains a NUL byte"));
    }
    w.write_all(s.as_bytes())?;
    w.write_u8(0)?;
    Ok(s.len() + 1)
}

impl Field for PooledBuf {
    const KIND: FieldKind = FieldKind::Data;

    fn decode<R: BufRead>(r: &mut R, pool: &BufferPool) -> ::std::result::Result<Self, DecodeError> {
        let mut buf = pool.acquire();
        io::copy(r, &mut buf).map_err(DecodeError::CopyError)?;
        Ok(buf)
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_all(self)?;
        Ok(self.len())
    }
}

/// Read one request record.
///
/// The whole record is rejected on the first field that fails to decode;
/// nothing is dispatched for it and the caller must treat the stream as
/// desynchronized.
pub fn read_request<R: BufRead>(r: &mut R, pool: &BufferPool) -> Result<Request> {
    let client_mark = r
        .read_u8()
        .map_err(|_| Error::TruncatedHeader { client_mark: None })?;
    let code = r.read_u8().map_err(|_| Error::TruncatedHeader {
        client_mark: Some(client_mark),
    })?;

    let opcode = Opcode::from_u8(code).ok_or(Error::UnknownCommand {
        client_mark,
        opcode: code,
    })?;

    let command = fcall::decode_fields(opcode, r, pool).map_err(|(index, kind, source)| {
        Error::MalformedCommand {
            client_mark,
            opcode,
            index,
            kind,
            source,
        }
    })?;

    Ok(Request {
        client_mark,
        command,
    })
}

/// Write one request record, as a client would send it
pub fn write_request<W: Write>(w: &mut W, request: &Request) -> io::Result<usize> {
    w.write_u8(request.client_mark)?;
    w.write_u8(request.command.opcode() as u8)?;
    Ok(fcall::REQUEST_HEADER_SIZE + fcall::encode_fields(&request.command, w)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::Command;
    use std::io::Cursor;

    fn pool() -> BufferPool {
        BufferPool::new(64, 8)
    }

    fn payload(pool: &BufferPool, bytes: &[u8]) -> PooledBuf {
        let mut buf = pool.acquire();
        buf.write_all(bytes).unwrap();
        buf
    }

    fn encode(request: &Request) -> Vec<u8> {
        let mut buf = Vec::new();
        let n = write_request(&mut buf, request).unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    fn decode(bytes: &[u8], pool: &BufferPool) -> Result<Request> {
        read_request(&mut Cursor::new(bytes), pool)
    }

    #[rustfmt::skip]
    fn sample_commands(pool: &BufferPool) -> Vec<Command> {
        vec![
            Command::Open { path: "/a/b".to_owned(), flags: 0o101, mode: 0o644 },
            Command::Close { fd: 7 },
            Command::Read { fd: 3, size: 65536 },
            Command::ReadDir { path: "/".to_owned() },
            Command::ReadLink { path: "/lnk".to_owned() },
            Command::Write { fd: 2, data: payload(pool, b"some bytes") },
            Command::Seek { fd: 3, whence: 1, offset: -100 },
            Command::Allocate { fd: 1, mode: 0x01, offset: 4096, len: 1 << 33 },
            Command::GetAttr { path: "/dir/f\u{e9}".to_owned() },
            Command::SetAttr { path: "/f".to_owned(), mask: 0b1111, size: 12, mtime: -1, mode: 0o755, owner: 3 },
            Command::Sync { fd: u32::MAX },
            Command::Mkdir { path: "/new".to_owned(), mode: 0o700 },
            Command::SymLink { target: "../t".to_owned(), link: "/l".to_owned() },
            Command::Remove { path: "/f".to_owned() },
            Command::RmDir { path: "/d".to_owned() },
            Command::FsStat { path: String::new() },
            Command::ReadAt { fd: 5, offset: 10, size: 20 },
            Command::WriteAt { fd: 5, offset: 99, data: payload(pool, &[0, 1, 2, 0, 255]) },
            Command::CopyFileRange { fd_in: 1, fd_out: 2, off_in: 3, off_out: 4, len: 5 },
            Command::Rename { old_path: "/x".to_owned(), new_path: "/y".to_owned(), flags: 1 },
            Command::SetAttrByFd { fd: 9, mask: 0b0010, size: 0, mtime: i64::MIN, mode: 0, owner: 0 },
        ]
    }

    #[test]
    fn every_command_decodes_back() {
        let pool = pool();
        let commands = sample_commands(&pool);
        let opcodes: Vec<Opcode> = commands.iter().map(Command::opcode).collect();
        assert_eq!(opcodes, Opcode::ALL);

        for (mark, command) in commands.into_iter().enumerate() {
            let expected = Request { client_mark: mark as u8, command };
            let actual = decode(&encode(&expected), &pool).unwrap();
            assert_eq!(expected, actual);
        }
    }

    #[test]
    fn close_wire_bytes() {
        let request = decode(&[0x2a, 2, 0x07, 0x00, 0x00, 0x00], &pool()).unwrap();
        assert_eq!(request.client_mark, 0x2a);
        assert_eq!(request.command, Command::Close { fd: 7 });
    }

    #[test]
    fn seek_wire_bytes() {
        let mut bytes = vec![1, 7, 3, 0, 0, 0, 1];
        bytes.extend_from_slice(&(-100i64).to_le_bytes());

        let request = decode(&bytes, &pool()).unwrap();
        assert_eq!(request.command, Command::Seek { fd: 3, whence: 1, offset: -100 });

        match decode(&bytes[..7], &pool()) {
            Err(Error::MalformedCommand { opcode, index, kind, source, .. }) => {
                assert_eq!(opcode, Opcode::Seek);
                assert_eq!(index, 2);
                assert_eq!(kind, FieldKind::I64);
                assert!(matches!(source, DecodeError::ShortRead));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn every_truncation_fails() {
        let pool = pool();
        for command in sample_commands(&pool) {
            if command.opcode().has_payload() {
                continue;
            }
            let bytes = encode(&Request { client_mark: 0, command });
            for end in 0..bytes.len() {
                let e = decode(&bytes[..end], &pool).unwrap_err();
                assert!(e.is_fatal(), "{:?} at {}", e, end);
            }
        }
    }

    #[test]
    fn record_ending_before_payload_has_empty_data() {
        let pool = pool();
        // WriteAt: fd[4] offset[8] data
        let bytes = encode(&Request {
            client_mark: 0,
            command: Command::WriteAt { fd: 1, offset: 2, data: payload(&pool, b"abc") },
        });
        for end in 0..(2 + 4 + 8) {
            assert!(decode(&bytes[..end], &pool).is_err());
        }

        // fields before the payload complete, the payload itself may be empty
        match decode(&bytes[..2 + 4 + 8], &pool).unwrap().command {
            Command::WriteAt { data, .. } => assert!(data.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_errors() {
        let pool = pool();
        assert!(matches!(
            decode(&[], &pool),
            Err(Error::TruncatedHeader { client_mark: None })
        ));
        assert!(matches!(
            decode(&[5], &pool),
            Err(Error::TruncatedHeader { client_mark: Some(5) })
        ));
        assert!(matches!(
            decode(&[5, 0], &pool),
            Err(Error::UnknownCommand { client_mark: 5, opcode: 0 })
        ));
        assert!(matches!(
            decode(&[5, 200, 1, 2, 3], &pool),
            Err(Error::UnknownCommand { client_mark: 5, opcode: 200 })
        ));
    }

    #[test]
    fn invalid_utf8_string() {
        let e = decode(&[0, 9, 0xff, 0xfe, 0], &pool()).unwrap_err();
        assert!(matches!(
            e,
            Error::MalformedCommand { source: DecodeError::MalformedString(_), .. }
        ));
    }

    #[test]
    fn unterminated_string() {
        let e = decode(&[0, 9, b'/', b'a'], &pool()).unwrap_err();
        assert!(matches!(
            e,
            Error::MalformedCommand { index: 0, source: DecodeError::ShortRead, .. }
        ));
    }

    #[test]
    fn payload_keeps_order_and_length() {
        let pool = BufferPool::new(4096, 2);
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut bytes = vec![3, 6, 1, 0, 0, 0];
        bytes.extend_from_slice(&data);

        match decode(&bytes, &pool).unwrap().command {
            Command::Write { fd, data: buf } => {
                assert_eq!(fd, 1);
                assert_eq!(buf.len(), data.len());
                assert_eq!(&*buf, &data[..]);
                assert_eq!(pool.outstanding(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn oversized_payload_is_a_copy_error() {
        let pool = BufferPool::new(8, 2);
        let mut bytes = vec![3, 6, 1, 0, 0, 0];
        bytes.extend_from_slice(&[0xaa; 9]);

        let e = decode(&bytes, &pool).unwrap_err();
        assert!(matches!(
            e,
            Error::MalformedCommand { index: 1, kind: FieldKind::Data, source: DecodeError::CopyError(_), .. }
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn str_and_string_encode_alike() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        assert_eq!(write_str(&mut a, "/dir/f\u{e9}").unwrap(), 9);
        "/dir/f\u{e9}".to_owned().encode(&mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.last(), Some(&0));
    }

    #[test]
    fn nul_in_string_is_not_encodable() {
        let request = Request {
            client_mark: 0,
            command: Command::Remove { path: "a\0b".to_owned() },
        };
        let e = write_request(&mut Vec::new(), &request).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
    }
}
