//! Controller network layer handling UDP requests and periodic housekeeping

use crate::controller::Controller;
use log::{debug, error, info, warn};
use shared::{timestamp_ms, Packet, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// How often lock and transfer counters are written to the log
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Messages sent from network tasks to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    Shutdown,
}

/// Packet queued for the sender task
#[derive(Debug)]
pub struct OutgoingPacket {
    pub packet: Packet,
    pub addr: SocketAddr,
}

/// Controller endpoint: owns the [`Controller`] and feeds it requests in arrival order
pub struct ControllerServer {
    socket: Arc<UdpSocket>,
    controller: Controller,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutgoingPacket>,
    out_rx: Option<mpsc::UnboundedReceiver<OutgoingPacket>>,
}

impl ControllerServer {
    pub async fn bind(
        addr: &str,
        controller: Controller,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Controller listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(ControllerServer {
            socket,
            controller,
            server_tx,
            server_rx,
            out_tx,
            out_rx: Some(out_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that stops [`ControllerServer::run`] when given [`ServerMessage::Shutdown`]
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match Packet::decode(&buffer[..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut out_rx) = self.out_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(OutgoingPacket { packet, addr }) = out_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = packet.encode()?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Runs a request through the controller and queues its responses
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let Packet::Request {
            request_id,
            request,
        } = packet
        else {
            warn!("Unexpected response packet from {}", addr);
            return;
        };

        debug!("Request {} from {}: {:?}", request_id, addr, request);
        for response in self.controller.handle(request, addr, timestamp_ms()) {
            let packet = Packet::Response {
                request_id,
                response,
            };
            if let Err(e) = self.out_tx.send(OutgoingPacket { packet, addr }) {
                error!("Failed to queue response: {}", e);
            }
        }
    }

    /// Main loop: requests, expiry sweeps, autosaves, until shutdown
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let config = self.controller.config().clone();
        let mut sweep_interval = interval(config.lock_sweep_interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut autosave_interval = interval(config.autosave_interval);
        autosave_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut metrics_interval = interval(METRICS_LOG_INTERVAL);

        info!("Controller started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Controller shutting down");
                            break;
                        }
                    }
                },

                _ = sweep_interval.tick() => {
                    self.controller.tick(timestamp_ms());
                },

                _ = autosave_interval.tick() => {
                    // Failure is logged by the controller and retried next round
                    let _ = self.controller.save();
                },

                _ = metrics_interval.tick() => {
                    let stats = self.controller.stats();
                    debug!(
                        "{} records ({} bytes), {} locks, {} uploads in flight, {} instances",
                        stats.record_count,
                        stats.total_bytes,
                        stats.active_locks,
                        stats.pending_uploads,
                        self.controller.instances().len()
                    );
                    for lock in self.controller.registry().locks() {
                        debug!("  {} held by {} until {}", lock.player, lock.holder, lock.expires_at_ms);
                    }
                    for id in self.controller.instances().silent(METRICS_LOG_INTERVAL) {
                        warn!("Instance {} has been silent for over {:?}", id, METRICS_LOG_INTERVAL);
                    }
                    match serde_json::to_string(&self.controller.metrics().snapshot()) {
                        Ok(json) => info!("Sync metrics: {}", json),
                        Err(e) => warn!("Failed to serialize metrics: {}", e),
                    }
                },
            }
        }

        self.controller.save()?;
        Ok(())
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }
}
