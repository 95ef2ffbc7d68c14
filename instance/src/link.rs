//! Request/response access to the controller
//!
//! [`ControllerLink`] is the seam between the sync state machine and the
//! transport. The coordinator only ever awaits these calls; it never sees
//! packets, request ids or sockets. [`UdpLink`] is the production
//! implementation and tests plug in links that call a `Controller` directly.

use async_trait::async_trait;
use log::{debug, error, warn};
use shared::{
    Chunk, DatabaseStats, InstanceId, Packet, PlayerKey, Request, Response, Result, SyncError,
    MAX_DATAGRAM_SIZE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Reply to one uploaded chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReply {
    /// Chunk stored, transfer not complete yet
    Ack(u32),
    /// Last chunk arrived and the record now has this version
    Committed(u64),
}

/// Frames of one download as the controller sends them
pub struct DownloadStream {
    frames: mpsc::UnboundedReceiver<Response>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl DownloadStream {
    pub fn new(frames: mpsc::UnboundedReceiver<Response>) -> Self {
        Self {
            frames,
            on_drop: None,
        }
    }

    fn with_cleanup(
        frames: mpsc::UnboundedReceiver<Response>,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            frames,
            on_drop: Some(Box::new(cleanup)),
        }
    }

    /// Next `(version, chunk)` frame, or `None` once the sender is gone
    pub async fn next_frame(&mut self, player: &PlayerKey) -> Result<Option<(u64, Chunk)>> {
        match self.frames.recv().await {
            Some(Response::DownloadChunk { version, chunk }) => Ok(Some((version, chunk))),
            Some(Response::DownloadRejected { reason }) => Err(SyncError::TransferRejected {
                player: player.to_string(),
                reason,
            }),
            Some(other) => Err(unexpected(&other)),
            None => Ok(None),
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        if let Some(cleanup) = self.on_drop.take() {
            cleanup();
        }
    }
}

#[async_trait]
pub trait ControllerLink: Send + Sync {
    /// Identity this link speaks for
    fn instance_id(&self) -> &InstanceId;

    async fn hello(&self) -> Result<()>;

    async fn goodbye(&self) -> Result<()>;

    /// Acquires or extends the lock, returning its expiry in unix milliseconds
    ///
    /// A denial comes back as [`SyncError::LockConflict`] or
    /// [`SyncError::InvalidTimeout`].
    async fn acquire(&self, player: &PlayerKey, timeout_secs: Option<u64>) -> Result<u64>;

    /// Returns false when the controller did not consider us the holder
    async fn release(&self, player: &PlayerKey) -> Result<bool>;

    async fn upload_chunk(
        &self,
        player: &PlayerKey,
        base_version: Option<u64>,
        chunk: Chunk,
    ) -> Result<UploadReply>;

    async fn download(&self, player: &PlayerKey) -> Result<DownloadStream>;
}

/// Maps a controller reply to an upload chunk onto the link result
pub fn upload_reply(player: &PlayerKey, chunk: &Chunk, response: Response) -> Result<UploadReply> {
    match response {
        Response::UploadAck { chunk_index } => Ok(UploadReply::Ack(chunk_index)),
        Response::UploadCommitted { version } => Ok(UploadReply::Committed(version)),
        Response::UploadRejected { reason } => Err(SyncError::TransferRejected {
            player: player.to_string(),
            reason,
        }),
        Response::UploadFailed { reason } => {
            warn!("Controller discarded upload of {}: {}", player, reason);
            Err(SyncError::TransferIncomplete {
                player: player.to_string(),
                received: chunk.index,
                total: chunk.total,
            })
        }
        other => Err(unexpected(&other)),
    }
}

/// Maps a controller reply to an acquire onto the link result
pub fn acquire_reply(player: &PlayerKey, response: Response) -> Result<u64> {
    match response {
        Response::Acquired { expires_at_ms } => Ok(expires_at_ms),
        Response::AcquireDenied { denial } => Err(denial.into_error(player)),
        other => Err(unexpected(&other)),
    }
}

/// Maps a controller reply to a release onto the link result
pub fn release_reply(player: &PlayerKey, response: Response) -> Result<bool> {
    match response {
        Response::Released => Ok(true),
        Response::ReleaseRefused { reason } => {
            debug!("Release of {} refused: {}", player, reason);
            Ok(false)
        }
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> SyncError {
    SyncError::InvalidState(format!("unexpected response {:?}", response))
}

type PendingMap = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Response>>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u32, mpsc::UnboundedSender<Response>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`ControllerLink`] over a UDP socket
///
/// Every request carries a fresh id; a background task routes responses back
/// to whoever is waiting on that id. Downloads keep their id registered for
/// as long as the returned stream lives, since the controller answers them
/// with several datagrams.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    instance_id: InstanceId,
    next_request_id: AtomicU32,
    pending: PendingMap,
    request_timeout: Duration,
    receiver: JoinHandle<()>,
}

impl UdpLink {
    pub async fn connect(
        controller_addr: &str,
        instance_id: InstanceId,
        request_timeout: Duration,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(controller_addr).await?;
        debug!(
            "Instance {} bound to {} for controller {}",
            instance_id,
            socket.local_addr()?,
            controller_addr
        );

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let receiver = Self::spawn_network_receiver(Arc::clone(&socket), Arc::clone(&pending));

        Ok(Self {
            socket,
            instance_id,
            next_request_id: AtomicU32::new(1),
            pending,
            request_timeout,
            receiver,
        })
    }

    /// Spawns task that routes incoming responses to their waiting request
    fn spawn_network_receiver(socket: Arc<UdpSocket>, pending: PendingMap) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let len = match socket.recv(&mut buffer).await {
                    Ok(len) => len,
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                match Packet::decode(&buffer[..len]) {
                    Ok(Packet::Response {
                        request_id,
                        response,
                    }) => {
                        let mut pending = lock_pending(&pending);
                        let delivered = pending
                            .get(&request_id)
                            .is_some_and(|waiter| waiter.send(response).is_ok());
                        if !delivered {
                            pending.remove(&request_id);
                            debug!("Late response to request {}", request_id);
                        }
                    }
                    Ok(Packet::Request { .. }) => warn!("Ignoring request packet from controller"),
                    Err(e) => warn!("Dropping malformed packet: {}", e),
                }
            }
        })
    }

    fn register(&self) -> (u32, mpsc::UnboundedReceiver<Response>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock_pending(&self.pending).insert(request_id, tx);
        (request_id, rx)
    }

    fn unregister(&self, request_id: u32) {
        lock_pending(&self.pending).remove(&request_id);
    }

    async fn send(&self, request_id: u32, request: Request) -> Result<()> {
        let data = Packet::Request {
            request_id,
            request,
        }
        .encode()?;
        self.socket.send(&data).await?;
        Ok(())
    }

    /// Asks the controller for its record and lock counts
    pub async fn stats(&self) -> Result<DatabaseStats> {
        match self.request(Request::DatabaseStats).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends one request and waits for its single response
    async fn request(&self, request: Request) -> Result<Response> {
        let (request_id, mut rx) = self.register();
        let result = match self.send(request_id, request).await {
            Ok(()) => match tokio::time::timeout(self.request_timeout, rx.recv()).await {
                Ok(Some(response)) => Ok(response),
                Ok(None) => Err(SyncError::Network("response channel closed".to_string())),
                Err(_) => Err(SyncError::Network(format!(
                    "no response to request {} within {:?}",
                    request_id, self.request_timeout
                ))),
            },
            Err(e) => Err(e),
        };
        self.unregister(request_id);
        result
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl ControllerLink for UdpLink {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    async fn hello(&self) -> Result<()> {
        match self
            .request(Request::Hello {
                instance_id: self.instance_id.clone(),
            })
            .await?
        {
            Response::Welcome => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn goodbye(&self) -> Result<()> {
        // Goodbye has no reply
        self.send(
            self.next_request_id.fetch_add(1, Ordering::Relaxed),
            Request::Goodbye {
                instance_id: self.instance_id.clone(),
            },
        )
        .await
    }

    async fn acquire(&self, player: &PlayerKey, timeout_secs: Option<u64>) -> Result<u64> {
        let response = self
            .request(Request::Acquire {
                player: player.clone(),
                instance_id: self.instance_id.clone(),
                timeout_secs,
            })
            .await?;
        acquire_reply(player, response)
    }

    async fn release(&self, player: &PlayerKey) -> Result<bool> {
        let response = self
            .request(Request::Release {
                player: player.clone(),
                instance_id: self.instance_id.clone(),
            })
            .await?;
        release_reply(player, response)
    }

    async fn upload_chunk(
        &self,
        player: &PlayerKey,
        base_version: Option<u64>,
        chunk: Chunk,
    ) -> Result<UploadReply> {
        let request = Request::Upload {
            player: player.clone(),
            instance_id: self.instance_id.clone(),
            base_version,
            chunk: chunk.clone(),
        };
        let response = self.request(request).await?;
        upload_reply(player, &chunk, response)
    }

    async fn download(&self, player: &PlayerKey) -> Result<DownloadStream> {
        let (request_id, rx) = self.register();
        let request = Request::Download {
            player: player.clone(),
            instance_id: self.instance_id.clone(),
        };
        if let Err(e) = self.send(request_id, request).await {
            self.unregister(request_id);
            return Err(e);
        }

        let pending = Arc::clone(&self.pending);
        Ok(DownloadStream::with_cleanup(rx, move || {
            lock_pending(&pending).remove(&request_id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::LockDenial;

    fn bob() -> PlayerKey {
        PlayerKey::new("bob").unwrap()
    }

    /// Answers every request on a plain socket with the given response
    async fn fake_controller(
        reply: impl Fn(&Request) -> Vec<Response> + Send + 'static,
    ) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            while let Ok((len, from)) = socket.recv_from(&mut buffer).await {
                if let Ok(Packet::Request {
                    request_id,
                    request,
                }) = Packet::decode(&buffer[..len])
                {
                    for response in reply(&request) {
                        let packet = Packet::Response {
                            request_id,
                            response,
                        };
                        socket.send_to(&packet.encode().unwrap(), from).await.unwrap();
                    }
                }
            }
        });
        addr
    }

    async fn link_to(addr: std::net::SocketAddr) -> UdpLink {
        UdpLink::connect(
            &addr.to_string(),
            InstanceId::from("test"),
            Duration::from_millis(300),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_granted_and_denied() {
        let addr = fake_controller(|request| match request {
            Request::Acquire {
                timeout_secs: Some(60),
                ..
            } => vec![Response::Acquired { expires_at_ms: 123 }],
            _ => vec![Response::AcquireDenied {
                denial: LockDenial::Held {
                    holder: InstanceId::from("other"),
                },
            }],
        })
        .await;
        let link = link_to(addr).await;

        assert_eq!(link.acquire(&bob(), Some(60)).await, Ok(123));
        assert!(matches!(
            link.acquire(&bob(), None).await,
            Err(SyncError::LockConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let addr = fake_controller(|_| Vec::new()).await;
        let link = link_to(addr).await;

        let result = link.hello().await;
        assert!(matches!(result, Err(SyncError::Network(_))));
        assert!(lock_pending(&link.pending).is_empty());
    }

    #[tokio::test]
    async fn test_download_stream_collects_all_frames() {
        let frames = shared::chunker::transfer_frames(b"hello world", 4).unwrap();
        let sent = frames.clone();
        let addr = fake_controller(move |_| {
            sent.iter()
                .cloned()
                .map(|chunk| Response::DownloadChunk { version: 3, chunk })
                .collect()
        })
        .await;
        let link = link_to(addr).await;

        let mut stream = link.download(&bob()).await.unwrap();
        let mut received = Vec::new();
        for _ in 0..frames.len() {
            let frame = tokio::time::timeout(Duration::from_secs(2), stream.next_frame(&bob()))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            received.push(frame);
        }
        assert!(received.iter().all(|(version, _)| *version == 3));
        assert_eq!(
            received.into_iter().map(|(_, c)| c).collect::<Vec<_>>().len(),
            frames.len()
        );

        drop(stream);
        assert!(lock_pending(&link.pending).is_empty());
    }

    #[test]
    fn test_upload_reply_mapping() {
        let chunk = Chunk::empty_marker();
        assert_eq!(
            upload_reply(&bob(), &chunk, Response::UploadCommitted { version: 2 }),
            Ok(UploadReply::Committed(2))
        );
        assert!(matches!(
            upload_reply(
                &bob(),
                &chunk,
                Response::UploadRejected {
                    reason: "not-holder".to_string()
                }
            ),
            Err(SyncError::TransferRejected { .. })
        ));
        assert!(upload_reply(
            &bob(),
            &chunk,
            Response::UploadFailed {
                reason: "digest".to_string()
            }
        )
        .unwrap_err()
        .is_retryable());
    }
}
