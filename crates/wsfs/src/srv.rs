//! Asynchronous server side wsfs library.
//!
//! # Protocol
//! WSFS/draft.1
//!
//! Each connection runs one reader that decodes records strictly in wire
//! order and hands every decoded command to its handler on a task of its
//! own, then goes straight back to the stream. Handlers reply through a
//! [`Responder`]; a single writer task puts the replies on the wire.
//!
//! A record that fails to decode ends the connection. Handlers that are
//! already running are not cancelled: teardown waits for them to finish.

use {
    crate::{
        config::ServerConfig,
        error::Error,
        fcall::*,
        io_err, res,
        pool::{BufferPool, PooledBuf},
        serialize::{self, Field},
        utils::{self, Result},
        work::OutstandingWork,
    },
    async_trait::async_trait,
    bytes::{Buf, Bytes, BytesMut},
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    num_traits::FromPrimitive,
    std::{
        io::{self, Write},
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::mpsc,
    },
    tokio_stream::{Stream, StreamExt},
    tokio_util::{
        codec::{FramedWrite, LengthDelimitedCodec},
        sync::CancellationToken,
    },
};

/// A response being built for one command.
///
/// Starts with the client mark and status; arguments are appended with the
/// same encoding commands use.
#[derive(Debug)]
pub struct Reply {
    buf: PooledBuf,
}

impl Reply {
    /// Append an integer, a NUL terminated string or a payload
    pub fn put<T: Field>(&mut self, value: &T) -> Result<&mut Self> {
        value.encode(&mut self.buf)?;
        Ok(self)
    }

    /// Append raw bytes
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<&mut Self> {
        self.buf.write_all(data)?;
        Ok(self)
    }

    /// Append a string, NUL terminated
    pub fn put_str(&mut self, s: &str) -> Result<&mut Self> {
        serialize::write_str(&mut self.buf, s)?;
        Ok(self)
    }

    /// Bytes still available for the body
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

/// Handle through which a handler answers its command.
///
/// Carries the client mark of the command, so every reply is routed back to
/// the request it belongs to.
#[derive(Clone, Debug)]
pub struct Responder {
    client_mark: u8,
    tx: mpsc::Sender<PooledBuf>,
    pool: BufferPool,
}

impl Responder {
    pub fn new(client_mark: u8, tx: mpsc::Sender<PooledBuf>, pool: BufferPool) -> Responder {
        Responder {
            client_mark,
            tx,
            pool,
        }
    }

    pub fn client_mark(&self) -> u8 {
        self.client_mark
    }

    /// Start a reply with `status`
    pub fn reply(&self, status: Status) -> Result<Reply> {
        let mut buf = self.pool.acquire();
        buf.write_all(&[self.client_mark, status as u8])?;
        Ok(Reply { buf })
    }

    /// Queue a reply for the writer
    pub async fn send(&self, reply: Reply) -> Result<()> {
        self.tx.send(reply.buf).await.map_err(|_| Error::Closed)
    }

    /// Reply with a bare status
    pub async fn status(&self, status: Status) -> Result<()> {
        self.send(self.reply(status)?).await
    }

    /// Reply with a status and a message.
    ///
    /// The message is cut short to fit the reply buffer and at its first NUL
    /// byte; the status itself always goes out.
    pub async fn error(&self, status: Status, message: &str) -> Result<()> {
        let mut reply = self.reply(status)?;
        if reply.remaining() > 0 {
            reply.put_str(fit_message(message, reply.remaining() - 1))?;
        }
        self.send(reply).await
    }
}

/// Longest prefix of `message` up to `max` bytes, ending on a char boundary
/// and before any NUL
fn fit_message(message: &str, max: usize) -> &str {
    let message = match message.find('\0') {
        Some(nul) => &message[..nul],
        None => message,
    };
    if message.len() <= max {
        return message;
    }

    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[async_trait]
/// Filesystem server trait for implementing wsfs servers.
///
/// One method per command; arguments arrive in wire order. Implementors
/// answer through the [`Responder`], possibly several times using
/// [`Status::PartialResponse`] for all but the last reply.
///
/// Returning an `Err` sends a single reply with [`Error::status`] and the
/// error's message. It never closes the connection.
///
/// # Example
/// ```no_run
/// use wsfs::{Result, Status, srv::{Filesystem, Responder}};
/// use async_trait::async_trait;
///
/// struct MyFs;
///
/// #[async_trait]
/// impl Filesystem for MyFs {
///     async fn close(&self, rsp: &Responder, fd: u32) -> Result<()> {
///         if fd == 0 {
///             return Err(Status::InvalidFd.into());
///         }
///         rsp.status(Status::Ok).await
///     }
/// }
/// ```
pub trait Filesystem: Send + Sync {
    async fn open(&self, _: &Responder, _path: &str, _flags: u32, _mode: u32) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn close(&self, _: &Responder, _fd: u32) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn read(&self, _: &Responder, _fd: u32, _size: u64) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn read_dir(&self, _: &Responder, _path: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn read_link(&self, _: &Responder, _path: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn write(&self, _: &Responder, _fd: u32, _data: PooledBuf) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn seek(&self, _: &Responder, _fd: u32, _whence: u8, _offset: i64) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn allocate(
        &self,
        _: &Responder,
        _fd: u32,
        _mode: u32,
        _offset: u64,
        _len: u64,
    ) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn get_attr(&self, _: &Responder, _path: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    #[allow(clippy::too_many_arguments)]
    async fn set_attr(
        &self,
        _: &Responder,
        _path: &str,
        _mask: u8,
        _size: u64,
        _mtime: i64,
        _mode: u32,
        _owner: u8,
    ) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn sync(&self, _: &Responder, _fd: u32) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn mkdir(&self, _: &Responder, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn symlink(&self, _: &Responder, _target: &str, _link: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn remove(&self, _: &Responder, _path: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn rmdir(&self, _: &Responder, _path: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn fs_stat(&self, _: &Responder, _path: &str) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn read_at(&self, _: &Responder, _fd: u32, _offset: u64, _size: u64) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn write_at(&self, _: &Responder, _fd: u32, _offset: u64, _data: PooledBuf) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn copy_file_range(
        &self,
        _: &Responder,
        _fd_in: u32,
        _fd_out: u32,
        _off_in: u64,
        _off_out: u64,
        _len: u64,
    ) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    async fn rename(&self, _: &Responder, _old_path: &str, _new_path: &str, _flags: u32) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }

    #[allow(clippy::too_many_arguments)]
    async fn set_attr_by_fd(
        &self,
        _: &Responder,
        _fd: u32,
        _mask: u8,
        _size: u64,
        _mtime: i64,
        _mode: u32,
        _owner: u8,
    ) -> Result<()> {
        Err(Error::Status(Status::NotSupport))
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs>(fs: &Fs, rsp: &Responder, command: Command) -> Result<()>
where
    Fs: Filesystem + ?Sized,
{
    use crate::Command::*;

    match command {
        Open { path, flags, mode }                                  => fs.open(rsp, &path, flags, mode).await,
        Close { fd }                                                => fs.close(rsp, fd).await,
        Read { fd, size }                                           => fs.read(rsp, fd, size).await,
        ReadDir { path }                                            => fs.read_dir(rsp, &path).await,
        ReadLink { path }                                           => fs.read_link(rsp, &path).await,
        Write { fd, data }                                          => fs.write(rsp, fd, data).await,
        Seek { fd, whence, offset }                                 => fs.seek(rsp, fd, whence, offset).await,
        Allocate { fd, mode, offset, len }                          => fs.allocate(rsp, fd, mode, offset, len).await,
        GetAttr { path }                                            => fs.get_attr(rsp, &path).await,
        SetAttr { path, mask, size, mtime, mode, owner }            => fs.set_attr(rsp, &path, mask, size, mtime, mode, owner).await,
        Sync { fd }                                                 => fs.sync(rsp, fd).await,
        Mkdir { path, mode }                                        => fs.mkdir(rsp, &path, mode).await,
        SymLink { target, link }                                    => fs.symlink(rsp, &target, &link).await,
        Remove { path }                                             => fs.remove(rsp, &path).await,
        RmDir { path }                                              => fs.rmdir(rsp, &path).await,
        FsStat { path }                                             => fs.fs_stat(rsp, &path).await,
        ReadAt { fd, offset, size }                                 => fs.read_at(rsp, fd, offset, size).await,
        WriteAt { fd, offset, data }                                => fs.write_at(rsp, fd, offset, data).await,
        CopyFileRange { fd_in, fd_out, off_in, off_out, len }       => fs.copy_file_range(rsp, fd_in, fd_out, off_in, off_out, len).await,
        Rename { old_path, new_path, flags }                        => fs.rename(rsp, &old_path, &new_path, flags).await,
        SetAttrByFd { fd, mask, size, mtime, mode, owner }          => fs.set_attr_by_fd(rsp, fd, mask, size, mtime, mode, owner).await,
    }
}

/// Hands decoded commands to their handlers for one connection.
struct Dispatcher<Fs> {
    fs: Arc<Fs>,
    pool: BufferPool,
    tx: mpsc::Sender<PooledBuf>,
    work: OutstandingWork,
}

impl<Fs> Dispatcher<Fs>
where
    Fs: 'static + Filesystem,
{
    fn responder(&self, client_mark: u8) -> Responder {
        Responder::new(client_mark, self.tx.clone(), self.pool.clone())
    }

    /// Schedule the handler of `request` and return without waiting for it.
    ///
    /// Only waits when admission control is on and the connection is at its
    /// limit.
    async fn dispatch(&self, request: Request) {
        let token = self.work.enter().await;
        let fs = Arc::clone(&self.fs);
        let rsp = self.responder(request.client_mark);

        self.work.spawn(token, async move {
            let opcode = request.command.opcode();
            if let Err(e) = dispatch_once(&*fs, &rsp, request.command).await {
                error!("{:?}: Error: \"{}\": {:?}", opcode, e, e);
                if let Err(e) = rsp.error(e.status(), &e.to_string()).await {
                    debug!("{:?}: dropping error reply: {}", opcode, e);
                }
            }
        });
    }

    /// Tell the client its record was not understood
    async fn reject(&self, e: &Error) {
        let Some(client_mark) = e.client_mark() else {
            return;
        };
        if let Err(e) = self
            .responder(client_mark)
            .error(Status::Invalid, BAD_COMMAND)
            .await
        {
            debug!("dropping bad command reply: {}", e);
        }
    }
}

/// Decode records in order until the stream ends, a record fails to decode
/// or the connection is cancelled.
async fn read_loop<Fs, S>(
    records: &mut S,
    dispatcher: &Dispatcher<Fs>,
    cancel: &CancellationToken,
) -> Result<()>
where
    Fs: 'static + Filesystem,
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            record = records.next() => record,
        };
        let Some(record) = record else {
            return Ok(());
        };

        match serialize::read_request(&mut record?.reader(), &dispatcher.pool) {
            Ok(request) => {
                info!("\t← {:?}", request);
                dispatcher.dispatch(request).await;
            }
            Err(e) => {
                error!("Failed to decode command: {}", e);
                dispatcher.reject(&e).await;
                return Err(e);
            }
        }
    }
}

/// Write queued replies in queue order until every sender is gone.
async fn write_loop<Writer>(
    mut framed: FramedWrite<Writer, LengthDelimitedCodec>,
    mut rx: mpsc::Receiver<PooledBuf>,
    cancel: CancellationToken,
) -> Result<()>
where
    Writer: AsyncWrite + Send + Unpin,
{
    while let Some(buf) = rx.recv().await {
        let frame = Bytes::copy_from_slice(&buf);
        buf.release();
        let status = frame.get(1).and_then(|&s| Status::from_u8(s));
        debug!("\t→ {:?} ({} bytes)", status, frame.len());

        if let Err(e) = framed.send(frame).await {
            error!("Failed to send reply: {:?}", e);
            // later sends fail once rx is dropped
            cancel.cancel();
            return Err(e.into());
        }
    }

    Ok(())
}

/// Run the reader, then close the connection once all handlers are done
async fn run_connection<Fs, S>(
    dispatcher: Dispatcher<Fs>,
    records: &mut S,
    cancel: &CancellationToken,
) -> Result<()>
where
    Fs: 'static + Filesystem,
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let result = read_loop(records, &dispatcher, cancel).await;

    let work = dispatcher.work.clone();
    if !work.is_empty() {
        warn!("Closing, waiting for {} command(s)", work.len());
    }
    work.close();
    work.wait().await;

    // handlers are done, this is the last sender
    drop(dispatcher);
    result
}

/// Serve one connection over a pair of byte streams.
///
/// Returns once the reader has stopped, every dispatched handler has
/// finished and every queued reply has been written.
pub async fn dispatch<Fs, Reader, Writer>(
    filesystem: Arc<Fs>,
    pool: BufferPool,
    config: &ServerConfig,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    Fs: 'static + Filesystem,
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    let mut framedread = config.framing().new_read(reader);
    let framedwrite = config.framing().new_write(writer);

    let (tx, rx) = mpsc::channel(config.response_channel_size);
    let cancel = CancellationToken::new();
    let writer = tokio::spawn(write_loop(framedwrite, rx, cancel.clone()));

    let dispatcher = Dispatcher {
        fs: filesystem,
        pool,
        tx,
        work: OutstandingWork::new(config.max_in_flight),
    };
    let result = run_connection(dispatcher, &mut framedread, &cancel).await;

    let written = writer
        .await
        .unwrap_or_else(|e| Err(Error::Io(io::Error::other(e))));
    result.and(written)
}

fn spawn_connection<Fs, Reader, Writer>(
    filesystem: &Arc<Fs>,
    pool: &BufferPool,
    config: &Arc<ServerConfig>,
    reader: Reader,
    writer: Writer,
) where
    Fs: 'static + Filesystem,
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    let fs = Arc::clone(filesystem);
    let pool = pool.clone();
    let config = Arc::clone(config);
    tokio::spawn(async move {
        if let Err(e) = dispatch(fs, pool, &config, reader, writer).await {
            error!("Error: {}: {:?}", e, e);
        }
    });
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
    }
    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Arc<Fs>, addr: &str, config: ServerConfig) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on tcp!{}", addr);

    let pool = config.buffer_pool();
    let config = Arc::new(config);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => return result,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!("accepted: {:?}", peer);

                let (readhalf, writehalf) = stream.into_split();
                spawn_connection(&filesystem, &pool, &config, readhalf, writehalf);
            }
        }
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn srv_async_unix<Fs>(
    filesystem: Arc<Fs>,
    addr: impl AsRef<Path>,
    config: ServerConfig,
) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let listener = DeleteOnDrop::bind(&addr)?;
    info!("Listening on unix!{}", addr.as_ref().display());

    let pool = config.buffer_pool();
    let config = Arc::new(config);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                info!("Server shutdown complete");
                return result;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!("accepted: {:?}", peer);

                let (readhalf, writehalf) = stream.into_split();
                spawn_connection(&filesystem, &pool, &config, readhalf, writehalf);
            }
        }
    }
}

/// Listen on `addr` (`tcp!host:port` or `unix!path`) and serve every
/// accepted connection until SIGTERM or SIGINT.
///
/// All connections share one buffer pool built from `config`.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str, config: ServerConfig) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    let filesystem = Arc::new(filesystem);
    match proto {
        "tcp" => srv_async_tcp(filesystem, listen_addr, config).await,
        "unix" => srv_async_unix(filesystem, listen_addr, config).await,
        _ => res!(io_err!(InvalidInput, "Protocol not supported")),
    }
}
