//! Passing the pool fd to a co-operating process.
//!
//! Shared-memory pools are exported as `(fd, len)`; the fd crosses the
//! process boundary as an `SCM_RIGHTS` ancillary message over a Unix
//! socket. Per-lease spans travel as ordinary data afterwards.

use crate::error::{Error, Result};
use rustix::fd::{BorrowedFd, OwnedFd};
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Send one file descriptor with a data payload.
///
/// `data` must be non-empty; `SCM_RIGHTS` needs at least one byte of
/// ordinary data to ride on.
pub fn send_fd(socket: &UnixStream, fd: BorrowedFd<'_>, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(Error::Precondition("fd transfer needs a data payload".into()));
    }

    let fds = [fd];
    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::Precondition(
            "could not stage fd in ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    Ok(())
}

/// Receive a file descriptor and its data payload.
///
/// Returns the payload length and the received fd.
pub fn recv_fd(socket: &UnixStream, data_buf: &mut [u8]) -> Result<(usize, OwnedFd)> {
    if data_buf.is_empty() {
        return Err(Error::Precondition("receive buffer cannot be empty".into()));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(data_buf)];
    let msg = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;

    let mut received = None;
    for message in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = message {
            for fd in rights {
                if received.is_none() {
                    received = Some(fd);
                }
            }
        }
    }

    match received {
        Some(fd) => Ok((msg.bytes, fd)),
        None => Err(Error::Precondition("no fd in message".into())),
    }
}
