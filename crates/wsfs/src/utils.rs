use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!address` listen string, e.g. `tcp!127.0.0.1:7070` or
/// `unix!/run/wsfs.sock`.
pub fn parse_proto(arg: &str) -> Option<(&str, &str)> {
    let (proto, addr) = arg.split_once('!')?;
    if proto.is_empty() || addr.is_empty() {
        return None;
    }

    Some((proto, addr))
}
