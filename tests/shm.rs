//! Cross-process lease transfer over shared memory, simulated with a
//! second in-process mapping and a Unix socketpair.

use aqueduct::ipc::{recv_fd, send_fd};
use aqueduct::pool::{BufferPool, SharedPoolMapping};
use rustix::fd::AsFd;
use std::os::unix::net::UnixStream;

#[test]
fn leases_resolve_identically_through_a_transferred_fd() {
    let pool = BufferPool::with_config(4, 8192, true).unwrap();
    let info = pool.shared_memory_info().unwrap();

    // Handshake: fd plus mapping length travel once.
    let (parent, child) = UnixStream::pair().unwrap();
    send_fd(&parent, info.fd, &(info.len as u64).to_le_bytes()).unwrap();
    let mut announce = [0u8; 8];
    let (n, fd) = recv_fd(&child, &mut announce).unwrap();
    assert_eq!(n, 8);
    let mapping = SharedPoolMapping::map(fd.as_fd(), u64::from_le_bytes(announce) as usize).unwrap();

    // Each lease travels as (offset, len); the child resolves it against
    // its own base address.
    for round in 0u8..4 {
        let mut lease = pool.try_get_buffer().unwrap();
        let payload: Vec<u8> = (0..100).map(|i| i ^ round).collect();
        lease.append(&payload);

        let (offset, len) = lease.shared_span();
        assert_eq!(mapping.slice(offset, len).unwrap(), &payload[..]);

        // Parent keeps the lease until the child is done with it; only
        // then may it be released.
        drop(lease);
    }
    assert_eq!(pool.free_buffers(), 4);
}

#[test]
fn writes_from_the_second_mapping_are_visible_to_the_pool() {
    let pool = BufferPool::with_config(1, 4096, true).unwrap();
    let info = pool.shared_memory_info().unwrap();
    let mapping = SharedPoolMapping::map(info.fd, info.len).unwrap();

    let mut lease = pool.try_get_buffer().unwrap();
    lease.append(b"parent side");
    let (offset, len) = lease.shared_span();

    // Same physical bytes, different virtual addresses.
    assert_eq!(mapping.slice(offset, len).unwrap(), b"parent side");
    assert_ne!(
        mapping.slice(offset, len).unwrap().as_ptr(),
        lease.readable().as_ptr()
    );
}
