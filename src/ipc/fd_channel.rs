//! Unix-socket side channel that translates producer-local fds into
//! consumer-local fds.
//!
//! A file descriptor number only means something inside the process that
//! owns it, so the ring can't carry usable fds by itself. Instead the
//! producer listens on a stream socket; a consumer sends the slot offset as
//! a single byte and gets back a datagram whose SCM_RIGHTS control message
//! carries the fd. The kernel duplicates the descriptor into the consumer's
//! table on delivery, so the number the consumer receives refers to the
//! same underlying buffer.
//!
//! Wire format: request = one unsigned byte (the slot offset, no framing);
//! reply = one ignorable payload byte plus at most one SCM_RIGHTS fd. A
//! reply without a control message means the producer had no fd for that
//! offset.

use std::fs;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::cmsg_space;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, listen, recvmsg, sendmsg, setsockopt, socket, sockopt, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use parking_lot::Mutex;

use crate::constants::{CHANNEL_BACKLOG, CHANNEL_IO_TIMEOUT, CHANNEL_POLL_TIMEOUT_MS};
use crate::error::{AvringError, Result};

/// Producer-side endpoint: owns the listening socket and the accepted
/// consumer connections.
pub(crate) struct FdListener {
    listener: UnixListener,
    clients: Mutex<Vec<UnixStream>>,
    path: PathBuf,
}

impl FdListener {
    /// Bind the non-blocking listening socket at `path`, replacing any
    /// stale socket file a previous producer left behind.
    pub(crate) fn bind(path: &Path) -> Result<Self> {
        let _ = fs::remove_file(path);

        let sock = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        setsockopt(&sock, sockopt::ReuseAddr, &true)?;

        let addr = UnixAddr::new(path)?;
        bind(sock.as_raw_fd(), &addr).map_err(|errno| {
            AvringError::socket(format!("bind {} failed: {errno}", path.display()))
        })?;
        listen(&sock, Backlog::new(CHANNEL_BACKLOG as i32)?)?;

        Ok(Self {
            listener: UnixListener::from(sock),
            clients: Mutex::new(Vec::new()),
            path: path.to_owned(),
        })
    }

    /// Wait up to the poll timeout for channel activity. Accepts any
    /// pending connections and returns one readable client, if any.
    pub(crate) fn poll_ready(&self) -> Result<Option<RawFd>> {
        let mut clients = self.clients.lock();

        let mut listener_ready = false;
        let mut ready_client = None;
        {
            let mut fds = Vec::with_capacity(clients.len() + 1);
            fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            for client in clients.iter() {
                fds.push(PollFd::new(client.as_fd(), PollFlags::POLLIN));
            }

            let n = poll(&mut fds, PollTimeout::from(CHANNEL_POLL_TIMEOUT_MS))?;
            if n > 0 {
                let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                listener_ready = fds[0]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN));
                for (i, pfd) in fds.iter().enumerate().skip(1) {
                    if pfd.revents().is_some_and(|r| r.intersects(wake)) {
                        ready_client = Some(clients[i - 1].as_raw_fd());
                        break;
                    }
                }
            }
        }

        if listener_ready {
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(true)?;
                        clients.push(stream);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(ready_client)
    }

    /// Read one request byte from `client`. Returns the requested slot
    /// offset, or None if the client had nothing to say or hung up (closed
    /// connections are dropped here).
    pub(crate) fn recv_request(&self, client: RawFd) -> Result<Option<u8>> {
        let mut clients = self.clients.lock();
        let Some(pos) = clients.iter().position(|c| c.as_raw_fd() == client) else {
            return Ok(None);
        };

        let mut buf = [0u8; 1];
        match clients[pos].read(&mut buf) {
            Ok(0) => {
                clients.remove(pos);
                Ok(None)
            }
            Ok(_) => Ok(Some(buf[0])),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => {
                tracing::warn!(%err, "dropping fd channel client after read error");
                clients.remove(pos);
                Ok(None)
            }
        }
    }

    /// Send the reply for one request: the payload byte, with the fd
    /// attached as SCM_RIGHTS when the slot held one.
    pub(crate) fn send_reply(&self, client: RawFd, fd: Option<RawFd>) -> Result<()> {
        let iov = [IoSlice::new(&[0u8])];
        let result = match fd {
            Some(fd) => {
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<UnixAddr>(client, &iov, &cmsgs, MsgFlags::empty(), None)
            }
            None => sendmsg::<UnixAddr>(client, &iov, &[], MsgFlags::empty(), None),
        };

        match result {
            Ok(_) => Ok(()),
            Err(errno) => {
                tracing::warn!(%errno, "dropping fd channel client after send error");
                let mut clients = self.clients.lock();
                if let Some(pos) = clients.iter().position(|c| c.as_raw_fd() == client) {
                    clients.remove(pos);
                }
                Ok(())
            }
        }
    }
}

impl Drop for FdListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Consumer-side endpoint: one connection per queue handle, for the
/// lifetime of that handle.
pub(crate) struct FdClient {
    stream: UnixStream,
}

impl FdClient {
    pub(crate) fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|err| {
            AvringError::socket(format!("connect {} failed: {err}", path.display()))
        })?;
        stream.set_read_timeout(Some(CHANNEL_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(CHANNEL_IO_TIMEOUT))?;

        Ok(Self { stream })
    }

    /// Ask the producer for the fd stored at `offset`. Returns None when
    /// the round-trip times out or the producer had nothing for the slot;
    /// the caller decides what a missing fd means.
    pub(crate) fn get_fd(&mut self, offset: u8) -> Result<Option<OwnedFd>> {
        if let Err(err) = self.stream.write_all(&[offset]) {
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ) {
                tracing::debug!(offset, "fd request timed out on send");
                return Ok(None);
            }
            return Err(err.into());
        }

        let mut payload = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut payload)];
        let mut cmsg = cmsg_space!([RawFd; 1]);

        match recvmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(&fd) = fds.first() {
                            return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
                        }
                    }
                }
                Ok(None)
            }
            Err(nix::errno::Errno::EAGAIN) => {
                tracing::debug!(offset, "fd request timed out on receive");
                Ok(None)
            }
            Err(errno) => Err(errno.into()),
        }
    }
}
