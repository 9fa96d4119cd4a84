// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Mutex,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    eth::{Error, TargetListReader, TargetListStatus, MAX_DATAGRAM_SIZE},
    net,
};

/// Version of the target list API implemented by this crate.
pub const API_VERSION: f32 = 1.2;

/// Default time to wait for a target list.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Local UDP ports owned by open sessions of this process.
static ACTIVE_PORTS: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

/// Returns the target list API version.
pub fn api_version() -> f32 {
    API_VERSION
}

/// Anything the acquisition loop can request target lists from.
pub trait TargetListSource {
    fn poll_target_list(&mut self) -> impl Future<Output = Result<TargetListStatus, Error>>;
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Closed,
    Open {
        sock: UdpSocket,
        port: u16,
    },
    /// The connection was reset or closed, the session must be reopened.
    Lost {
        port: u16,
    },
}

/// A sensor session bound to a local interface address and UDP port.
///
/// `Session::default()` is a handle that was never opened.  The port is
/// released by [`Session::close`] or when the session is dropped.
#[derive(Debug)]
pub struct Session {
    state: State,
    reader: TargetListReader,
    timeout: Duration,
    buf: Vec<u8>,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            state: State::Closed,
            reader: TargetListReader::default(),
            timeout: DEFAULT_TIMEOUT,
            buf: vec![0; MAX_DATAGRAM_SIZE],
        }
    }
}

impl Session {
    /// Opens a session listening on `ip:port`.  Port 0 binds an ephemeral
    /// port, see [`Session::local_addr`].
    #[instrument]
    pub async fn open(ip: Ipv4Addr, port: u16) -> Result<Session, Error> {
        Self::open_with_buffer(ip, port, net::RECV_BUFFER_SIZE).await
    }

    /// Opens a session with an explicit kernel receive buffer size.
    pub async fn open_with_buffer(
        ip: Ipv4Addr,
        port: u16,
        recv_buffer: usize,
    ) -> Result<Session, Error> {
        if port != 0 && ACTIVE_PORTS.lock().map_err(|_| Error::MutexError)?.contains(&port) {
            return Err(Error::AlreadyInitialized(port));
        }

        let sock = net::bind(ip, port, recv_buffer).await?;
        let port = sock.local_addr().map_err(Error::CreateHandle)?.port();

        if !ACTIVE_PORTS
            .lock()
            .map_err(|_| Error::MutexError)?
            .insert(port)
        {
            return Err(Error::AlreadyInitialized(port));
        }

        info!("session open on {}:{}", ip, port);

        let mut session = Session::default();
        session.state = State::Open { sock, port };
        Ok(session)
    }

    /// Sets how long a poll waits for a target list.
    pub fn with_timeout(mut self, timeout: Duration) -> Session {
        self.timeout = timeout;
        self
    }

    /// Returns true while the session can be polled.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    /// Returns the bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        match &self.state {
            State::Open { sock, .. } => sock.local_addr().map_err(Error::from),
            State::Lost { .. } => Err(Error::ConnectionLost),
            State::Closed => Err(Error::HandleNotInitialized),
        }
    }

    /// Number of frames skipped by the sensor since the session was opened.
    pub fn frames_lost(&self) -> u64 {
        self.reader.frames_lost()
    }

    /// Releases the socket and its port.  Fails if the session was never
    /// opened or is already closed.
    #[instrument(skip_all)]
    pub fn close(&mut self) -> Result<(), Error> {
        let port = match std::mem::take(&mut self.state) {
            State::Closed => return Err(Error::HandleNotInitialized),
            State::Open { port, .. } | State::Lost { port } => port,
        };
        self.reader.reset();
        release(port)?;
        info!("session on port {} closed", port);
        Ok(())
    }

    /// Requests the next target list.
    ///
    /// Returns `NotActive` when nothing was received within the timeout and
    /// fails with `CommunicationTimeout` when a frame started but did not
    /// complete in time.
    #[instrument(skip_all, level = "debug")]
    pub async fn poll_target_list(&mut self) -> Result<TargetListStatus, Error> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let received = match &self.state {
                State::Open { sock, .. } => timeout_at(deadline, sock.recv(&mut self.buf)).await,
                State::Lost { .. } => return Err(Error::ConnectionLost),
                State::Closed => return Err(Error::HandleNotInitialized),
            };

            let len = match received {
                Ok(Ok(len)) => len,
                Ok(Err(err)) => return Err(self.fail(Error::from(err))),
                Err(_) if self.reader.in_progress() => {
                    self.reader.reset();
                    return Err(Error::CommunicationTimeout);
                }
                Err(_) => {
                    debug!("no data within {:?}", self.timeout);
                    return Ok(TargetListStatus::NotActive);
                }
            };

            if let Some(status) = self.reader.read(&self.buf[..len])? {
                return Ok(status);
            }
        }
    }

    /// Moves an open session to the lost state when `err` ended the
    /// connection.  The port stays reserved until the session is closed.
    fn fail(&mut self, err: Error) -> Error {
        if !err.is_terminal() {
            return err;
        }
        if let State::Open { port, .. } = self.state {
            warn!("session on port {} lost: {}", port, err);
            self.reader.reset();
            self.state = State::Lost { port };
        }
        err
    }
}

impl TargetListSource for Session {
    fn poll_target_list(&mut self) -> impl Future<Output = Result<TargetListStatus, Error>> {
        Session::poll_target_list(self)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let State::Open { port, .. } | State::Lost { port } = self.state {
            if let Err(err) = release(port) {
                warn!("releasing port {}: {}", port, err);
            }
        }
    }
}

fn release(port: u16) -> Result<(), Error> {
    ACTIVE_PORTS
        .lock()
        .map_err(|_| Error::MutexError)?
        .remove(&port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::{encode_frame, Target};

    async fn open_loopback() -> Session {
        Session::open(Ipv4Addr::LOCALHOST, 0)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(200))
    }

    async fn send(session: &Session, datagrams: &[Vec<u8>]) {
        let sensor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = session.local_addr().unwrap();
        for datagram in datagrams {
            sensor.send_to(datagram, addr).await.unwrap();
        }
    }

    fn target(signal_strength: f32, range: f32) -> Target {
        Target {
            signal_strength,
            range,
            velocity: 0.5,
            angle_azimuth: -3.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_api_version() {
        assert_eq!(api_version(), 1.2);
    }

    #[tokio::test]
    async fn test_poll_strongest() {
        let mut session = open_loopback().await;
        let targets = [target(10.0, 4.0), target(25.0, 8.0), target(5.0, 16.0)];
        send(&session, &encode_frame(100, &targets)).await;

        let status = session.poll_target_list().await.unwrap();
        let list = match status {
            TargetListStatus::Ok(list) => list,
            other => panic!("unexpected status {:?}", other),
        };
        assert_eq!(list.len(), 3);
        assert_eq!(list.frame_id(), 100);
        assert_eq!(list.strongest(), target(25.0, 8.0));

        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_poll_not_active() {
        let mut session = open_loopback().await;
        let status = session.poll_target_list().await.unwrap();
        assert_eq!(status, TargetListStatus::NotActive);
    }

    #[tokio::test]
    async fn test_poll_incomplete_frame() {
        let mut session = open_loopback().await;
        let targets: Vec<_> = (0..50).map(|i| target(i as f32, 1.0)).collect();
        let datagrams = encode_frame(1, &targets);
        send(&session, &datagrams[..2]).await;

        let err = session.poll_target_list().await.unwrap_err();
        assert!(matches!(err, Error::CommunicationTimeout));
        // The session stays usable after a timeout.
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_connection_reset_loses_session() {
        let mut session = open_loopback().await;
        let port = session.local_addr().unwrap().port();

        let err = session.fail(Error::ConnectionReset);
        assert!(matches!(err, Error::ConnectionReset));
        assert!(!session.is_open());
        assert!(matches!(session.local_addr(), Err(Error::ConnectionLost)));
        assert!(matches!(
            session.poll_target_list().await,
            Err(Error::ConnectionLost)
        ));

        // A lost session still owns its port until closed.
        let err = Session::open(Ipv4Addr::LOCALHOST, port).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(p) if p == port));

        session.close().unwrap();
        let mut reopened = Session::open(Ipv4Addr::LOCALHOST, port).await.unwrap();
        reopened.close().unwrap();
    }

    #[tokio::test]
    async fn test_recoverable_error_keeps_session() {
        let mut session = open_loopback().await;
        let err = session.fail(Error::TargetDataSize(12));
        assert!(matches!(err, Error::TargetDataSize(12)));
        assert!(session.is_open());
        session.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_never_opened() {
        let mut session = Session::default();
        assert!(matches!(session.close(), Err(Error::HandleNotInitialized)));
        assert!(matches!(
            session.poll_target_list().await,
            Err(Error::HandleNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let mut session = open_loopback().await;
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(matches!(session.close(), Err(Error::HandleNotInitialized)));
    }

    #[tokio::test]
    async fn test_already_initialized() {
        let mut session = open_loopback().await;
        let port = session.local_addr().unwrap().port();

        let err = Session::open(Ipv4Addr::LOCALHOST, port).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(p) if p == port));

        session.close().unwrap();
        let mut reopened = Session::open(Ipv4Addr::LOCALHOST, port).await.unwrap();
        reopened.close().unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_port() {
        let session = open_loopback().await;
        let port = session.local_addr().unwrap().port();
        drop(session);

        let mut reopened = Session::open(Ipv4Addr::LOCALHOST, port).await.unwrap();
        reopened.close().unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let held = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let err = Session::open(Ipv4Addr::LOCALHOST, port).await.unwrap_err();
        assert!(matches!(err, Error::PortInUse(p) if p == port));
    }

    #[tokio::test]
    async fn test_network_interface() {
        // TEST-NET-1 is never assigned to a local interface.
        let ip = Ipv4Addr::new(192, 0, 2, 1);
        let err = Session::open(ip, 0).await.unwrap_err();
        assert!(matches!(err, Error::NetworkInterface(addr) if addr == ip));
    }
}
