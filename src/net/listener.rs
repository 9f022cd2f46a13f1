//! Listening socket binding.
//!
//! # Responsibilities
//! - Parse listener addresses (TCP and Unix-domain)
//! - Bind with the configured socket options (backlog, buffers, reuse)
//! - Detect and remove stale Unix socket paths
//! - Wrap inherited file descriptors without rebinding
//!
//! # Design Decisions
//! - Listeners are non-blocking; workers poll before accepting
//! - Identity is (family, address); a TCP listener bound to port 0 takes the
//!   identity of the port it actually got
//! - Close-on-exec stays set; inheritance clears it per child

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use thiserror::Error;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum BindError {
    /// Another live socket owns the address.
    #[error("address {0} is already in use")]
    AddressInUse(ListenAddress),

    #[error("permission denied binding {0}")]
    PermissionDenied(ListenAddress),

    /// A non-socket file sits at the Unix socket path.
    #[error("{0} exists and is not a socket")]
    NotASocket(PathBuf),

    #[error("failed to bind {address}: {source}")]
    Io {
        address: ListenAddress,
        #[source]
        source: io::Error,
    },

    /// An inherited descriptor is not a usable listening socket.
    #[error("inherited fd {fd} is not a listening socket: {source}")]
    Inherit {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    fn from_io(address: &ListenAddress, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse(address.clone()),
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied(address.clone()),
            _ => BindError::Io {
                address: address.clone(),
                source,
            },
        }
    }
}

/// Error returned when a listener address cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid listen address {0:?}")]
pub struct AddressParseError(String);

/// Listener identity: address family plus address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(AddressParseError(s.to_string()));
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(ListenAddress::Unix(PathBuf::from(s)));
        }
        if let Ok(port) = s.parse::<u16>() {
            return Ok(ListenAddress::Tcp(SocketAddr::from(([0, 0, 0, 0], port))));
        }
        if let Some(port) = s.strip_prefix("*:") {
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressParseError(s.to_string()))?;
            return Ok(ListenAddress::Tcp(SocketAddr::from(([0, 0, 0, 0], port))));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(ListenAddress::Tcp(addr));
        }
        s.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(ListenAddress::Tcp)
            .ok_or_else(|| AddressParseError(s.to_string()))
    }
}

impl TryFrom<String> for ListenAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ListenAddress> for String {
    fn from(value: ListenAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "{}", addr),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Socket-level options applied at bind time and re-applied on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub backlog: i32,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub reuse: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            receive_buffer_size: None,
            send_buffer_size: None,
            reuse: true,
        }
    }
}

/// The bound OS socket.
#[derive(Debug)]
enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// An accepted connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl Connection {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Connection::Tcp(stream, _) => stream.set_nonblocking(nonblocking),
            Connection::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    /// Human-readable peer description for logs.
    pub fn peer(&self) -> String {
        match self {
            Connection::Tcp(_, addr) => addr.to_string(),
            Connection::Unix(_) => "unix".to_string(),
        }
    }
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream, _) => stream.read(buf),
            Connection::Unix(stream) => stream.read(buf),
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream, _) => stream.write(buf),
            Connection::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(stream, _) => stream.flush(),
            Connection::Unix(stream) => stream.flush(),
        }
    }
}

/// One bound listening socket.
#[derive(Debug)]
pub struct Listener {
    address: ListenAddress,
    options: SocketOptions,
    workers: Option<Vec<usize>>,
    socket: ListenSocket,
}

impl Listener {
    /// Bind `address` with `options`.
    ///
    /// A Unix socket path that exists but refuses connections is stale: it is
    /// unlinked and the bind is retried once.
    pub fn bind(address: &ListenAddress, options: SocketOptions) -> Result<Self, BindError> {
        let socket = match address {
            ListenAddress::Tcp(addr) => ListenSocket::Tcp(bind_tcp(address, *addr, &options)?),
            ListenAddress::Unix(path) => ListenSocket::Unix(bind_unix(address, path, &options)?),
        };

        // Port 0 resolves to a real port; that becomes the identity.
        let address = match &socket {
            ListenSocket::Tcp(listener) => listener
                .local_addr()
                .map(ListenAddress::Tcp)
                .map_err(|e| BindError::from_io(address, e))?,
            ListenSocket::Unix(_) => address.clone(),
        };

        tracing::info!(address = %address, backlog = options.backlog, "Listener bound");

        Ok(Self {
            address,
            options,
            workers: None,
            socket,
        })
    }

    /// Wrap a descriptor inherited from a predecessor process.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor owned by nothing else in this process.
    pub unsafe fn from_inherited_fd(fd: RawFd) -> Result<Self, BindError> {
        let owned = OwnedFd::from_raw_fd(fd);
        let socket = Socket::from(owned);
        let inherit_err = |source| BindError::Inherit { fd, source };

        let local = socket.local_addr().map_err(inherit_err)?;
        let (address, socket) = match local.as_socket() {
            Some(addr) => (ListenAddress::Tcp(addr), ListenSocket::Tcp(socket.into())),
            None => {
                let listener: UnixListener = socket.into();
                let path = listener
                    .local_addr()
                    .map_err(inherit_err)?
                    .as_pathname()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        inherit_err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "unnamed unix socket",
                        ))
                    })?;
                (ListenAddress::Unix(path), ListenSocket::Unix(listener))
            }
        };

        let listener = Self {
            address,
            options: SocketOptions::default(),
            workers: None,
            socket,
        };
        listener.set_nonblocking().map_err(inherit_err)?;
        crate::lifecycle::set_cloexec(fd, true).map_err(inherit_err)?;
        tracing::info!(address = %listener.address, fd, "Inherited listener");
        Ok(listener)
    }

    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn options(&self) -> SocketOptions {
        self.options
    }

    pub fn set_workers(&mut self, workers: Option<Vec<usize>>) {
        self.workers = workers;
    }

    /// Whether worker `ordinal` should inherit this listener.
    pub fn serves(&self, ordinal: usize) -> bool {
        self.workers
            .as_ref()
            .map_or(true, |workers| workers.contains(&ordinal))
    }

    /// Re-apply options to the live socket without rebinding.
    pub fn apply_options(&mut self, options: SocketOptions) -> io::Result<()> {
        {
            let sock = SockRef::from(&*self);
            if let Some(size) = options.receive_buffer_size {
                sock.set_recv_buffer_size(size)?;
            }
            if let Some(size) = options.send_buffer_size {
                sock.set_send_buffer_size(size)?;
            }
            if options.backlog != self.options.backlog {
                sock.listen(options.backlog)?;
            }
        }
        self.options = options;
        Ok(())
    }

    /// Whether the Unix socket path still points at a socket.
    ///
    /// Always true for TCP listeners.
    pub fn path_intact(&self) -> bool {
        match &self.address {
            ListenAddress::Tcp(_) => true,
            ListenAddress::Unix(path) => std::fs::symlink_metadata(path)
                .map(|meta| meta.file_type().is_socket())
                .unwrap_or(false),
        }
    }

    /// Accept one pending connection, if any.
    pub fn accept(&self) -> io::Result<Connection> {
        match &self.socket {
            ListenSocket::Tcp(listener) => {
                listener.accept().map(|(stream, peer)| Connection::Tcp(stream, peer))
            }
            ListenSocket::Unix(listener) => {
                listener.accept().map(|(stream, _)| Connection::Unix(stream))
            }
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match &self.socket {
            ListenSocket::Tcp(listener) => listener.set_nonblocking(true),
            ListenSocket::Unix(listener) => listener.set_nonblocking(true),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.socket {
            ListenSocket::Tcp(listener) => listener.as_fd(),
            ListenSocket::Unix(listener) => listener.as_fd(),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

fn configure(socket: &Socket, options: &SocketOptions) -> io::Result<()> {
    if options.reuse {
        socket.set_reuse_address(true)?;
    }
    if let Some(size) = options.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.set_nonblocking(true)
}

fn bind_tcp(
    address: &ListenAddress,
    addr: SocketAddr,
    options: &SocketOptions,
) -> Result<TcpListener, BindError> {
    let err = |e| BindError::from_io(address, e);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(err)?;
    configure(&socket, options).map_err(err)?;
    socket.bind(&addr.into()).map_err(err)?;
    socket.listen(options.backlog).map_err(err)?;
    Ok(socket.into())
}

fn bind_unix(
    address: &ListenAddress,
    path: &Path,
    options: &SocketOptions,
) -> Result<UnixListener, BindError> {
    let err = |e| BindError::from_io(address, e);

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if !meta.file_type().is_socket() {
            return Err(BindError::NotASocket(path.to_path_buf()));
        }
        if UnixStream::connect(path).is_ok() {
            return Err(BindError::AddressInUse(address.clone()));
        }
        tracing::info!(path = %path.display(), "Removing stale unix socket");
        std::fs::remove_file(path).map_err(err)?;
    }

    // SO_REUSEADDR means nothing for Unix-domain sockets.
    let options = SocketOptions {
        reuse: false,
        ..*options
    };
    let sockaddr = SockAddr::unix(path).map_err(err)?;
    let attempt = || -> io::Result<UnixListener> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        configure(&socket, &options)?;
        socket.bind(&sockaddr)?;
        socket.listen(options.backlog)?;
        Ok(socket.into())
    };

    match attempt() {
        Ok(listener) => Ok(listener),
        // Lost a race with another process leaving a stale path behind.
        Err(e) if e.kind() == io::ErrorKind::AddrInUse && UnixStream::connect(path).is_err() => {
            std::fs::remove_file(path).map_err(err)?;
            attempt().map_err(err)
        }
        Err(e) => Err(err(e)),
    }
}
