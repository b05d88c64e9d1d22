use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conf::GatewayConf;
use super::error::Error;


/// Datagram link towards the network server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> Result<(), Error>;
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error>;
    async fn reconnect(&self) -> Result<(), Error>;
}


/// UDP socket connected to one server port.
///
/// The socket handle is cloned out of the lock before any I/O, so a close or
/// reconnect never waits on a pending receive.
#[derive(Debug)]
pub struct UdpTransport {
    target: String,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpTransport {
    pub async fn connect(target: String) -> Result<Self, Error> {
        let socket = Self::open(&target).await?;
        Ok(Self {
            target,
            socket: Mutex::new(Some(Arc::new(socket))),
        })
    }

    async fn open(target: &str) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;
        debug!("INFO: socket {:?} connected to {}", socket.local_addr().ok(), target);
        Ok(socket)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, Error> {
        self.socket
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::SocketFailure(std::io::ErrorKind::NotConnected.into()))
    }

    pub fn close(&self) {
        *self.socket.lock().unwrap() = None;
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), Error> {
        let socket = self.socket()?;
        socket.send(datagram).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let socket = self.socket()?;
        Ok(socket.recv(buf).await?)
    }

    async fn reconnect(&self) -> Result<(), Error> {
        let socket = Self::open(&self.target).await?;
        *self.socket.lock().unwrap() = Some(Arc::new(socket));
        Ok(())
    }
}


/// Re-opens `transport` until it succeeds or shutdown is requested, doubling
/// the wait after each failure. Returns false on shutdown.
pub async fn reconnect_with_backoff(transport: &dyn Transport, conf: &GatewayConf, cancel: &CancellationToken) -> bool {
    let max = Duration::from_millis(conf.reconnect_backoff_max_ms.max(1));
    let mut delay = Duration::from_millis(conf.reconnect_backoff_ms.max(1)).min(max);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        match transport.reconnect().await {
            Ok(()) => {
                info!("INFO: socket reconnected");
                return true;
            }
            Err(e) => {
                warn!(e=?e, "WARNING: reconnect failed, next attempt in {:?}", delay);
                delay = (delay * 2).min(max);
            }
        }
    }
}
