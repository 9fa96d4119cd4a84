// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::eth::Error;

/// Default kernel receive buffer requested for sensor sockets.
pub const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Binds the sensor socket on the local interface address and port.  Bind
/// failures are reported with the session error they correspond to.
pub async fn bind(ip: Ipv4Addr, port: u16, recv_buffer: usize) -> Result<UdpSocket, Error> {
    let sock = UdpSocket::bind(SocketAddr::from((ip, port)))
        .await
        .map_err(|err| match err.kind() {
            io::ErrorKind::AddrInUse => Error::PortInUse(port),
            io::ErrorKind::AddrNotAvailable => Error::NetworkInterface(ip),
            _ => Error::CreateHandle(err),
        })?;

    let sock = sock.into_std().map_err(Error::CreateHandle)?;
    let sock = set_socket_bufsize(sock, recv_buffer);
    let sock = UdpSocket::from_std(sock).map_err(Error::CreateHandle)?;
    debug!("bound {:?}", sock.local_addr());

    Ok(sock)
}

#[cfg(target_os = "linux")]
pub fn set_process_priority() {
    if let Err(err) = set_thread_scheduler(libc::SCHED_FIFO, 10) {
        warn!("unable to set real-time fifo scheduler: {}", err);
    }
}

#[cfg(target_os = "linux")]
fn set_thread_scheduler(policy: libc::c_int, priority: libc::c_int) -> std::io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // pthread calls return the error number, errno is left untouched.
    let err = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
    match err {
        0 => Ok(()),
        err => Err(std::io::Error::from_raw_os_error(err)),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_priority() {}

#[cfg(target_os = "linux")]
pub fn set_socket_bufsize(socket: std::net::UdpSocket, size: usize) -> std::net::UdpSocket {
    use std::os::fd::AsRawFd;

    let size = size as libc::c_int;
    let err = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of_val(&size) as libc::socklen_t,
        )
    };
    if err != 0 {
        warn!(
            "setsockopt SO_RCVBUF failed: {}",
            std::io::Error::last_os_error()
        );
    }
    socket
}

#[cfg(not(target_os = "linux"))]
pub fn set_socket_bufsize(socket: std::net::UdpSocket, _size: usize) -> std::net::UdpSocket {
    socket
}
