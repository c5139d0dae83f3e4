//! Fork handoff.
//!
//! When the client announces a fork, the server builds a fresh socket pair
//! and forks itself: the child serves the forked client over the pair's
//! server end, the parent ships the client end back inside the S_FD reply's
//! ancillary data and keeps serving the original session.

use std::{
    io::{IoSlice, Write},
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::net::UnixStream,
    },
};

use nix::sys::socket::{
    AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType, sendmsg, socketpair,
};
use rejit_proto::{MsgHdr, MsgId};
use zerocopy::IntoBytes;

use crate::error::ServerError;

/// Which side of the fork the caller continues on.
pub(crate) enum ForkOutcome {
    /// Original process; the reply has been sent, keep the old channel.
    Parent,
    /// Forked child; replace the connection with this stream.
    Child(UnixStream),
}

/// Serve one C_FORK: socketpair, fork, S_FD reply.
///
/// Setup failures are reported to the client as a nonzero error code in the
/// S_FD payload (with no descriptor) and the session continues.
pub(crate) fn handle_fork(conn: &UnixStream) -> Result<ForkOutcome, ServerError> {
    let pair = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty());
    let (client_end, server_end) = match pair {
        Ok(pair) => pair,
        Err(errno) => {
            tracing::warn!(%errno, "socketpair for fork handoff failed");
            send_fd_reply(conn, errno as i32, None)?;
            return Ok(ForkOutcome::Parent);
        },
    };

    // The child inherits the whole session by address-space duplication,
    // which is exactly the state the forked client expects.
    #[allow(unsafe_code)]
    let fork = unsafe { nix::unistd::fork() };
    match fork {
        Ok(nix::unistd::ForkResult::Child) => {
            drop(client_end);
            Ok(ForkOutcome::Child(UnixStream::from(server_end)))
        },
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            drop(server_end);
            tracing::debug!(child = child.as_raw(), "serving forked client from child process");
            send_fd_reply(conn, 0, Some(&client_end))?;
            Ok(ForkOutcome::Parent)
        },
        Err(errno) => {
            tracing::warn!(%errno, "fork failed");
            drop(client_end);
            drop(server_end);
            send_fd_reply(conn, errno as i32, None)?;
            Ok(ForkOutcome::Parent)
        },
    }
}

/// Write the S_FD frame, attaching `fd` as SCM_RIGHTS when given.
///
/// The header goes out as plain bytes; the descriptor must ride on the
/// error-code payload, because the client consumes the header with an
/// ordinary read and ancillary data on a segment read that way is
/// discarded by the kernel.
fn send_fd_reply(conn: &UnixStream, error: i32, fd: Option<&OwnedFd>) -> Result<(), ServerError> {
    let hdr = MsgHdr::new(MsgId::SFd, 4);
    let mut writer = conn;
    writer.write_all(hdr.as_bytes()).map_err(ServerError::Fork)?;

    let error_bytes = error.to_ne_bytes();
    let iov = [IoSlice::new(&error_bytes)];
    let fds = fd.map(|fd| [fd.as_raw_fd()]);
    let cmsgs: Vec<ControlMessage<'_>> =
        fds.as_ref().map(|fds| ControlMessage::ScmRights(fds)).into_iter().collect();

    let sent = sendmsg::<()>(conn.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|errno| ServerError::Fork(std::io::Error::from_raw_os_error(errno as i32)))?;
    if sent != error_bytes.len() {
        return Err(ServerError::Fork(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short fd reply",
        )));
    }
    Ok(())
}
