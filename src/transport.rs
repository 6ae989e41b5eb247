//! Datagram transport for the dispatcher.
//!
//! [`Transport::start`] binds a UDP socket and spawns a receive task that
//! decodes every datagram into an [`Envelope`] and pushes it onto an
//! unbounded FIFO. Sending never waits for an acknowledgement and is never
//! retried; lost datagrams are recovered at the application layer by the
//! heartbeat and requeue machinery.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::Message;

/// A decoded inbound message together with the endpoint it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: Message,
    pub from: SocketAddr,
}

/// Cheap, cloneable handle for sending messages over the transport socket.
#[derive(Debug, Clone)]
pub struct MessageSender {
    socket: Arc<UdpSocket>,
}

impl MessageSender {
    /// Serialize `message` and send it to `dest` as a single datagram.
    pub async fn send(&self, message: &Message, dest: SocketAddr) -> Result<()> {
        let payload = message.encode();
        self.socket.send_to(payload.as_bytes(), dest).await?;
        tracing::trace!(dest = %dest, message = %payload, "Sent message");
        Ok(())
    }

    /// Send and log failures instead of returning them.
    ///
    /// Runtime send faults are not fatal to the dispatcher.
    pub async fn send_or_log(&self, message: &Message, dest: SocketAddr) {
        if let Err(e) = self.send(message, dest).await {
            tracing::warn!(
                dest = %dest,
                instruction = message.instruction(),
                error = %e,
                "Failed to send message"
            );
        }
    }
}

pub struct Transport {
    local_addr: SocketAddr,
    sender: MessageSender,
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
}

impl Transport {
    /// Bind `bind_addr` and start the receive task.
    ///
    /// Returns the transport and the receiving end of the inbound FIFO.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be bound.
    pub async fn start(
        bind_addr: SocketAddr,
        max_datagram_size: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));

        tokio::spawn(receive_loop(
            socket.clone(),
            inbound_tx,
            cancel.clone(),
            stopped.clone(),
            max_datagram_size.max(1),
        ));

        tracing::info!(addr = %local_addr, "Listening for messages");

        let transport = Self {
            local_addr,
            sender: MessageSender { socket },
            cancel,
            stopped,
        };
        Ok((transport, inbound_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Cancel the receive task. Sending keeps working. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!(addr = %self.local_addr, "Stopping transport");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    max_datagram_size: usize,
) {
    // One spare byte tells a full-size datagram apart from a truncated one
    let mut buf = vec![0u8; max_datagram_size + 1];

    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    tracing::warn!(error = %e, "Transient receive error");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Receive failed, stopping transport");
                    break;
                }
            },
        };

        if len > max_datagram_size {
            tracing::debug!(from = %from, max_datagram_size, "Discarding oversized datagram");
            continue;
        }

        match Message::decode(&buf[..len]) {
            Ok(message) => {
                tracing::trace!(from = %from, message = %message, "Received message");
                if inbound_tx.send(Envelope { message, from }).is_err() {
                    // Consumer dropped the FIFO
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(from = %from, error = %e, "Discarding malformed datagram");
            }
        }
    }

    stopped.store(true, Ordering::SeqCst);
    tracing::debug!("Receive task exited");
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
