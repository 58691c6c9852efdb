//! Buffered TCP and UDP sockets
//!
//! A [`Socket`] is created for a protocol and address family, then driven
//! through the usual bind/listen/accept or connect sequence. Reads are
//! buffered like files; writes are pushed to the network before returning,
//! since the kernel already buffers outbound data and holding bytes back
//! here would only add latency. With family `Unspec` the descriptor is not
//! created until an address has been resolved, so the family can follow the
//! resolution result.

use crate::bufio::{BufStream, ReadFormat, ReadOut};
use crate::fd::{FdStream, Timeout, poll_fd};
use crate::handle::RawHandle;
use crate::pool::{Pool, scratch};
use crate::status::{Status, StatusCode};
use log::debug;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn parse(name: &str) -> Result<Protocol, Status> {
        match name {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Status::invalid(format!("unknown protocol '{other}'"))),
        }
    }

    fn socktype(self) -> libc::c_int {
        match self {
            Protocol::Tcp => libc::SOCK_STREAM,
            Protocol::Udp => libc::SOCK_DGRAM,
        }
    }
}

/// Address family. `Unspec` defers the choice to address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
    Unspec,
}

impl Family {
    pub fn parse(name: &str) -> Result<Family, Status> {
        match name {
            "inet" => Ok(Family::Inet),
            "inet6" => Ok(Family::Inet6),
            "unspec" => Ok(Family::Unspec),
            other => Err(Status::invalid(format!("unknown address family '{other}'"))),
        }
    }

    fn af(self) -> libc::c_int {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::Unspec => libc::AF_UNSPEC,
        }
    }

    fn from_af(af: libc::c_int) -> Family {
        match af {
            libc::AF_INET => Family::Inet,
            libc::AF_INET6 => Family::Inet6,
            _ => Family::Unspec,
        }
    }
}

/// Which endpoint address to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Local,
    Remote,
}

/// Which direction to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

/// Listen backlog, either a count or the OS maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backlog {
    Max,
    Count(i32),
}

/// Socket option values: booleans except for the buffer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    Debug,
    KeepAlive,
    Linger,
    NonBlock,
    ReuseAddr,
    SndBuf,
    RcvBuf,
    Disconnected,
}

impl SockOpt {
    pub fn parse(name: &str) -> Result<SockOpt, Status> {
        match name {
            "debug" => Ok(SockOpt::Debug),
            "keep-alive" => Ok(SockOpt::KeepAlive),
            "linger" => Ok(SockOpt::Linger),
            "non-block" => Ok(SockOpt::NonBlock),
            "reuse-addr" => Ok(SockOpt::ReuseAddr),
            "sndbuf" => Ok(SockOpt::SndBuf),
            "rcvbuf" => Ok(SockOpt::RcvBuf),
            "disconnected" => Ok(SockOpt::Disconnected),
            other => Err(Status::invalid(format!("unknown socket option '{other}'"))),
        }
    }
}

/// Seconds a closing socket lingers for unsent data when `linger` is on.
const LINGER_SECS: libc::c_int = 30;

/// A resolved socket address.
#[derive(Clone, Copy)]
struct SockAddrBuf {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddrBuf {
    fn family(&self) -> libc::c_int {
        self.storage.ss_family as libc::c_int
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        (&raw const self.storage).cast()
    }

    /// Render as a numeric host string plus port.
    fn to_host_port(&self) -> Result<(String, u16), Status> {
        const NI_MAXSERV: usize = 32;
        let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
        let mut serv = [0 as libc::c_char; NI_MAXSERV];
        let rc = unsafe {
            libc::getnameinfo(
                self.as_ptr(),
                self.len,
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                serv.as_mut_ptr(),
                serv.len() as libc::socklen_t,
                libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
            )
        };
        if rc != 0 {
            return Err(gai_status(rc));
        }
        let host = unsafe { CStr::from_ptr(host.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let port = unsafe { CStr::from_ptr(serv.as_ptr()) }
            .to_string_lossy()
            .parse::<u16>()
            .unwrap_or(0);
        Ok((host, port))
    }
}

fn gai_status(rc: libc::c_int) -> Status {
    if rc == libc::EAI_SYSTEM {
        return Status::from_errno(Errno::last());
    }
    let message = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
        .to_string_lossy()
        .into_owned();
    let code = match rc {
        libc::EAI_NONAME => StatusCode::Noent,
        libc::EAI_FAMILY => StatusCode::AfNoSupport,
        libc::EAI_MEMORY => StatusCode::Nomem,
        libc::EAI_AGAIN => StatusCode::Again,
        _ => StatusCode::General,
    };
    Status::new(code, message)
}

/// Resolve `host:port` into socket addresses. `None` for the host with
/// `passive` resolves the wildcard address.
fn resolve(
    host: Option<&str>,
    port: u16,
    family: Family,
    protocol: Protocol,
    passive: bool,
) -> Result<Vec<SockAddrBuf>, Status> {
    let c_host = match host {
        Some(h) => Some(
            CString::new(h).map_err(|_| Status::invalid("host contains a NUL byte"))?,
        ),
        None => None,
    };
    let c_serv = CString::new(port.to_string()).expect("ports are digits");
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family.af();
    hints.ai_socktype = protocol.socktype();
    hints.ai_flags = if passive { libc::AI_PASSIVE } else { 0 };
    let mut list: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(
            c_host.as_ref().map_or(std::ptr::null(), |h| h.as_ptr()),
            c_serv.as_ptr(),
            &hints,
            &mut list,
        )
    };
    if rc != 0 {
        return Err(gai_status(rc));
    }
    let mut out = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        let info = unsafe { &*cursor };
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = info.ai_addrlen.min(mem::size_of_val(&storage) as libc::socklen_t);
        unsafe {
            std::ptr::copy_nonoverlapping(
                info.ai_addr.cast::<u8>(),
                (&raw mut storage).cast::<u8>(),
                len as usize,
            );
        }
        out.push(SockAddrBuf { storage, len });
        cursor = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(list) };
    if out.is_empty() {
        return Err(Status::new(StatusCode::Noent, "host not found"));
    }
    Ok(out)
}

struct Inner {
    io: Option<BufStream<FdStream>>,
    family: Family,
    protocol: Protocol,
    timeout: Timeout,
    closed: bool,
}

impl Inner {
    /// Create the descriptor on first use, once the family is known.
    fn ensure_open(&mut self, family: Family) -> Result<RawFd, Status> {
        if self.closed {
            return Err(Status::closed("socket"));
        }
        if self.io.is_none() {
            let family = match (self.family, family) {
                (Family::Unspec, resolved) => resolved,
                (fixed, _) => fixed,
            };
            let family = match family {
                Family::Unspec => Family::Inet,
                other => other,
            };
            let fd = unsafe { libc::socket(family.af(), self.protocol.socktype(), 0) };
            if fd < 0 {
                return Err(Status::from_errno(Errno::last()));
            }
            let handle = Arc::new(RawHandle::owned(
                unsafe { OwnedFd::from_raw_fd(fd) },
                "socket",
            ));
            let mut backend = FdStream::new(handle);
            backend.set_timeout(self.timeout);
            self.io = Some(BufStream::new(backend, false));
            self.family = family;
        }
        self.fd()
    }

    fn fd(&self) -> Result<RawFd, Status> {
        if self.closed {
            return Err(Status::closed("socket"));
        }
        match &self.io {
            Some(io) => io.backend().handle().get(),
            None => Err(Status::new(StatusCode::NotConn, "socket is not open yet")),
        }
    }

    fn io(&mut self) -> Result<&mut BufStream<FdStream>, Status> {
        if self.closed {
            return Err(Status::closed("socket"));
        }
        match &mut self.io {
            Some(io) => Ok(io),
            None => Err(Status::new(StatusCode::NotConn, "socket is not open yet")),
        }
    }
}

pub(crate) struct SocketCore {
    pool: Arc<Pool>,
    inner: Mutex<Inner>,
}

/// A buffered network endpoint.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    /// Allocate a socket for `protocol` over `family`. The descriptor is
    /// created lazily so `Unspec` can follow address resolution.
    pub fn create(protocol: Protocol, family: Family) -> Result<Socket, Status> {
        Ok(Socket {
            core: Arc::new(SocketCore {
                pool: Pool::new(),
                inner: Mutex::new(Inner {
                    io: None,
                    family,
                    protocol,
                    timeout: Timeout::Forever,
                    closed: false,
                }),
            }),
        })
    }

    fn adopt(fd: OwnedFd, family: Family, protocol: Protocol, timeout: Timeout) -> Socket {
        let handle = Arc::new(RawHandle::owned(fd, "socket"));
        let mut backend = FdStream::new(handle);
        backend.set_timeout(timeout);
        Socket {
            core: Arc::new(SocketCore {
                pool: Pool::new(),
                inner: Mutex::new(Inner {
                    io: Some(BufStream::new(backend, false)),
                    family,
                    protocol,
                    timeout,
                    closed: false,
                }),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.core.pool
    }

    pub fn family(&self) -> Family {
        self.core.inner.lock().family
    }

    pub fn protocol(&self) -> Protocol {
        self.core.inner.lock().protocol
    }

    /// Stable identity for registration tables: the address of the shared
    /// core.
    pub(crate) fn token(&self) -> usize {
        Arc::as_ptr(&self.core) as usize
    }

    /// Turn this wrapper into a raw core pointer carrying its reference.
    pub(crate) fn into_raw(self) -> *const SocketCore {
        Arc::into_raw(self.core)
    }

    /// Rebuild a wrapper from a pointer produced by [`Socket::into_raw`].
    ///
    /// # Safety
    ///
    /// `core` must come from `into_raw` and be consumed exactly once.
    pub(crate) unsafe fn from_raw(core: *const SocketCore) -> Socket {
        Socket {
            core: unsafe { Arc::from_raw(core) },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.inner.lock().closed
    }

    pub(crate) fn raw_fd(&self) -> Result<RawFd, Status> {
        self.core.inner.lock().fd()
    }

    /// Bind to `host:port`; host `"*"` binds the wildcard address.
    pub fn bind(&self, host: &str, port: u16) -> Result<(), Status> {
        let mut inner = self.core.inner.lock();
        let node = if host == "*" { None } else { Some(host) };
        let addrs = resolve(node, port, inner.family, inner.protocol, node.is_none())?;
        let mut last = Status::new(StatusCode::Noent, "no usable address");
        for addr in &addrs {
            let fd = inner.ensure_open(Family::from_af(addr.family()))?;
            if addr.family() != inner.family.af() {
                continue;
            }
            let rc = unsafe { libc::bind(fd, addr.as_ptr(), addr.len) };
            if rc == 0 {
                return Ok(());
            }
            last = Status::from_errno(Errno::last());
        }
        Err(last)
    }

    /// Start listening. `Backlog::Max` uses the OS maximum.
    pub fn listen(&self, backlog: Backlog) -> Result<(), Status> {
        let inner = self.core.inner.lock();
        let fd = inner.fd()?;
        let backlog = match backlog {
            Backlog::Max => libc::SOMAXCONN,
            Backlog::Count(n) => n,
        };
        let rc = unsafe { libc::listen(fd, backlog) };
        if rc != 0 {
            return Err(Status::from_errno(Errno::last()));
        }
        Ok(())
    }

    /// Accept one connection as a new socket sharing this one's family and
    /// protocol. Honors the listener's timeout.
    pub fn accept(&self) -> Result<Socket, Status> {
        let (fd, family, protocol, timeout) = {
            let inner = self.core.inner.lock();
            (inner.fd()?, inner.family, inner.protocol, inner.timeout)
        };
        wait_readable(fd, timeout)?;
        loop {
            let rc = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if rc >= 0 {
                let owned = unsafe { OwnedFd::from_raw_fd(rc) };
                return Ok(Socket::adopt(owned, family, protocol, Timeout::Forever));
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(Status::from_errno(errno));
            }
        }
    }

    /// Connect to `host:port`. With a timeout set, the connect itself is
    /// bounded by switching the descriptor to non-blocking for the attempt.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), Status> {
        let mut inner = self.core.inner.lock();
        let addrs = resolve(Some(host), port, inner.family, inner.protocol, false)?;
        let timeout = inner.timeout;
        let mut last = Status::new(StatusCode::Noent, "no usable address");
        for addr in &addrs {
            let fd = inner.ensure_open(Family::from_af(addr.family()))?;
            if addr.family() != inner.family.af() {
                continue;
            }
            match connect_one(fd, addr, timeout) {
                Ok(()) => return Ok(()),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Read one value per format specifier.
    pub fn read(&self, formats: &[ReadFormat]) -> Result<Vec<ReadOut>, Status> {
        let mut inner = self.core.inner.lock();
        let io = inner.io()?;
        formats.iter().map(|f| io.read_format(*f)).collect()
    }

    pub fn read_line(&self) -> Result<Option<Vec<u8>>, Status> {
        self.core.inner.lock().io()?.read_line()
    }

    pub fn read_all(&self) -> Result<Vec<u8>, Status> {
        self.core.inner.lock().io()?.read_all()
    }

    pub fn read_count(&self, count: usize) -> Result<Option<Vec<u8>>, Status> {
        self.core.inner.lock().io()?.read_count(count)
    }

    /// Write every part and push it to the network before returning.
    pub fn write<T: AsRef<[u8]>>(&self, parts: &[T]) -> Result<(), Status> {
        let mut inner = self.core.inner.lock();
        let io = inner.io()?;
        for part in parts {
            io.write(part.as_ref())?;
        }
        io.flush_pending()
    }

    /// Iterate received lines until the peer shuts down.
    pub fn lines(&self) -> SocketLines {
        SocketLines {
            socket: self.clone(),
        }
    }

    pub fn timeout_get(&self) -> Timeout {
        self.core.inner.lock().timeout
    }

    pub fn timeout_set(&self, timeout: Timeout) {
        let mut inner = self.core.inner.lock();
        inner.timeout = timeout;
        if let Some(io) = &mut inner.io {
            io.backend_mut().set_timeout(timeout);
        }
    }

    /// Fetch a socket option. Booleans come back as 0/1; the buffer sizes in
    /// bytes.
    pub fn opt_get(&self, opt: SockOpt) -> Result<i64, Status> {
        let fd = self.core.inner.lock().fd()?;
        match opt {
            SockOpt::NonBlock => {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(Status::from_errno(Errno::last()));
                }
                Ok(i64::from(flags & libc::O_NONBLOCK != 0))
            }
            SockOpt::Linger => {
                let mut linger: libc::linger = unsafe { mem::zeroed() };
                getsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_LINGER, &mut linger)?;
                Ok(i64::from(linger.l_onoff != 0))
            }
            SockOpt::Disconnected => {
                let mut err: libc::c_int = 0;
                getsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err)?;
                Ok(i64::from(err == libc::EPIPE || err == libc::ECONNRESET))
            }
            other => {
                let mut value: libc::c_int = 0;
                getsockopt_raw(fd, libc::SOL_SOCKET, sockopt_name(other)?, &mut value)?;
                match other {
                    SockOpt::SndBuf | SockOpt::RcvBuf => Ok(value as i64),
                    _ => Ok(i64::from(value != 0)),
                }
            }
        }
    }

    /// Set a socket option.
    pub fn opt_set(&self, opt: SockOpt, value: i64) -> Result<(), Status> {
        let fd = self.core.inner.lock().fd()?;
        match opt {
            SockOpt::NonBlock => {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(Status::from_errno(Errno::last()));
                }
                let flags = if value != 0 {
                    flags | libc::O_NONBLOCK
                } else {
                    flags & !libc::O_NONBLOCK
                };
                let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
                if rc < 0 {
                    return Err(Status::from_errno(Errno::last()));
                }
                Ok(())
            }
            SockOpt::Linger => {
                let linger = libc::linger {
                    l_onoff: (value != 0) as libc::c_int,
                    l_linger: LINGER_SECS,
                };
                setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_LINGER, &linger)
            }
            SockOpt::Disconnected => Err(Status::invalid("option 'disconnected' is read-only")),
            other => {
                let value = match other {
                    SockOpt::SndBuf | SockOpt::RcvBuf => value as libc::c_int,
                    _ => (value != 0) as libc::c_int,
                };
                setsockopt_raw(fd, libc::SOL_SOCKET, sockopt_name(other)?, &value)
            }
        }
    }

    /// The local or remote endpoint as `(numeric_host, port)`.
    pub fn addr_get(&self, which: Which) -> Result<(String, u16), Status> {
        let fd = self.core.inner.lock().fd()?;
        let mut addr = SockAddrBuf {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        };
        let rc = unsafe {
            match which {
                Which::Local => libc::getsockname(
                    fd,
                    (&raw mut addr.storage).cast(),
                    &mut addr.len,
                ),
                Which::Remote => libc::getpeername(
                    fd,
                    (&raw mut addr.storage).cast(),
                    &mut addr.len,
                ),
            }
        };
        if rc != 0 {
            return Err(Status::from_errno(Errno::last()));
        }
        addr.to_host_port()
    }

    /// Shut down one or both directions.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<(), Status> {
        let fd = self.core.inner.lock().fd()?;
        let how = match mode {
            ShutdownMode::Read => libc::SHUT_RD,
            ShutdownMode::Write => libc::SHUT_WR,
            ShutdownMode::Both => libc::SHUT_RDWR,
        };
        let rc = unsafe { libc::shutdown(fd, how) };
        if rc != 0 {
            return Err(Status::from_errno(Errno::last()));
        }
        Ok(())
    }

    /// Flush and release the descriptor. Later calls are no-ops.
    pub fn close(&self) -> Result<(), Status> {
        let mut inner = self.core.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if let Some(io) = &mut inner.io {
            if let Err(err) = io.flush_pending() {
                debug!("discarding unsent socket data: {err}");
            }
            io.backend().handle().close()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("Socket")
            .field("family", &inner.family)
            .field("protocol", &inner.protocol)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Line iterator returned by [`Socket::lines`].
#[derive(Debug)]
pub struct SocketLines {
    socket: Socket,
}

impl Iterator for SocketLines {
    type Item = Result<Vec<u8>, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.socket.read_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

fn wait_readable(fd: RawFd, timeout: Timeout) -> Result<(), Status> {
    let ms = match timeout {
        Timeout::Forever => None,
        Timeout::Immediate => Some(0),
        Timeout::Micros(us) => Some(us.div_ceil(1000).min(libc::c_int::MAX as u64) as libc::c_int),
    };
    if let Some(ms) = ms {
        if !poll_fd(fd, libc::POLLIN, Some(ms))? {
            return Err(match timeout {
                Timeout::Immediate => Status::again(),
                _ => Status::timeup(),
            });
        }
    }
    Ok(())
}

fn connect_one(fd: RawFd, addr: &SockAddrBuf, timeout: Timeout) -> Result<(), Status> {
    let ms = match timeout {
        Timeout::Forever => None,
        Timeout::Immediate => Some(0),
        Timeout::Micros(us) => Some(us.div_ceil(1000).min(libc::c_int::MAX as u64) as libc::c_int),
    };
    if ms.is_none() {
        loop {
            let rc = unsafe { libc::connect(fd, addr.as_ptr(), addr.len) };
            if rc == 0 {
                return Ok(());
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(Status::from_errno(errno));
            }
        }
    }
    // Bounded connect: go non-blocking for the attempt, wait for
    // writability, then read the final disposition from SO_ERROR.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    let restore = |fd| unsafe {
        libc::fcntl(fd, libc::F_SETFL, flags);
    };
    let rc = unsafe { libc::connect(fd, addr.as_ptr(), addr.len) };
    if rc == 0 {
        restore(fd);
        return Ok(());
    }
    let errno = Errno::last();
    if errno != Errno::EINPROGRESS {
        restore(fd);
        return Err(Status::from_errno(errno));
    }
    let ready = poll_fd(fd, libc::POLLOUT, ms)?;
    if !ready {
        restore(fd);
        return Err(Status::timeup());
    }
    let mut err: libc::c_int = 0;
    getsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err)?;
    restore(fd);
    if err != 0 {
        return Err(Status::from_errno(Errno::from_raw(err)));
    }
    Ok(())
}

fn sockopt_name(opt: SockOpt) -> Result<libc::c_int, Status> {
    Ok(match opt {
        SockOpt::Debug => libc::SO_DEBUG,
        SockOpt::KeepAlive => libc::SO_KEEPALIVE,
        SockOpt::ReuseAddr => libc::SO_REUSEADDR,
        SockOpt::SndBuf => libc::SO_SNDBUF,
        SockOpt::RcvBuf => libc::SO_RCVBUF,
        _ => return Err(Status::invalid("option has no plain sockopt mapping")),
    })
}

fn getsockopt_raw<T>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &mut T,
) -> Result<(), Status> {
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(fd, level, name, (value as *mut T).cast(), &mut len)
    };
    if rc != 0 {
        return Err(Status::from_errno(Errno::last()));
    }
    Ok(())
}

fn setsockopt_raw<T>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
) -> Result<(), Status> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Status::from_errno(Errno::last()));
    }
    Ok(())
}

/// Forward DNS lookup: numeric addresses for `host`, deduplicated, in
/// resolver order.
pub fn host_to_addr(host: &str, family: Option<Family>) -> Result<Vec<String>, Status> {
    scratch::with(|_| {
        let family = family.unwrap_or(Family::Unspec);
        let addrs = resolve(Some(host), 0, family, Protocol::Tcp, false)?;
        let mut out: Vec<String> = Vec::new();
        for addr in &addrs {
            let (host, _) = addr.to_host_port()?;
            if !out.contains(&host) {
                out.push(host);
            }
        }
        Ok(out)
    })
}

/// Reverse DNS lookup for a numeric address.
pub fn addr_to_host(ip: &str, family: Option<Family>) -> Result<String, Status> {
    scratch::with(|_| {
        let family = family.unwrap_or(Family::Unspec);
        let addrs = resolve(Some(ip), 0, family, Protocol::Tcp, false)?;
        let addr = &addrs[0];
        let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
        let rc = unsafe {
            libc::getnameinfo(
                addr.as_ptr(),
                addr.len,
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                std::ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            return Err(gai_status(rc));
        }
        Ok(unsafe { CStr::from_ptr(host.as_ptr()) }
            .to_string_lossy()
            .into_owned())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn listener() -> (Socket, u16) {
        let server = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
        server.bind("127.0.0.1", 0).unwrap();
        server.listen(Backlog::Max).unwrap();
        let (_, port) = server.addr_get(Which::Local).unwrap();
        (server, port)
    }

    #[test]
    fn accept_and_exchange_lines() {
        let (server, port) = listener();
        let client = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let peer = server.accept().unwrap();
        client.write(&[b"hello\n"]).unwrap();
        assert_eq!(peer.read_line().unwrap().unwrap(), b"hello");
        peer.write(&[b"world\n"]).unwrap();
        assert_eq!(client.read_line().unwrap().unwrap(), b"world");
    }

    #[test]
    fn unspec_family_follows_resolution() {
        let socket = Socket::create(Protocol::Tcp, Family::Unspec).unwrap();
        socket.bind("127.0.0.1", 0).unwrap();
        assert_eq!(socket.family(), Family::Inet);
    }

    #[test]
    fn closed_socket_operations_fail() {
        let (server, _) = listener();
        server.close().unwrap();
        server.close().unwrap();
        let err = server.accept().unwrap_err();
        assert!(err.message().contains("closed socket"));
    }

    #[test]
    fn accept_timeout_reports_timeup() {
        let (server, _) = listener();
        server.timeout_set(Timeout::Micros(1000));
        let err = server.accept().unwrap_err();
        assert!(err.is_timeup());
    }

    #[test]
    fn options_round_trip() {
        let socket = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
        socket.bind("127.0.0.1", 0).unwrap();
        socket.opt_set(SockOpt::KeepAlive, 1).unwrap();
        assert_eq!(socket.opt_get(SockOpt::KeepAlive).unwrap(), 1);
        socket.opt_set(SockOpt::NonBlock, 1).unwrap();
        assert_eq!(socket.opt_get(SockOpt::NonBlock).unwrap(), 1);
        socket.opt_set(SockOpt::NonBlock, 0).unwrap();
    }

    #[test]
    fn numeric_forward_lookup() {
        let addrs = host_to_addr("127.0.0.1", Some(Family::Inet)).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".to_string()]);
    }
}
