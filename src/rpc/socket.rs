//! UDP socket layer correlating requests to responses by transaction id.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::messages::{Message, MessageBody, RequestSpecific, ResponseSpecific};
use crate::common::Id;

use super::config::Config;

const MTU: usize = 2048;

/// Default request timeout before an inflight request to a non-responding
/// node is abandoned and treated as failed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// The maximum duration to block when the receive buffer is empty. Lower
/// values increase CPU usage but drain the buffer faster, reducing the risk
/// of packet loss.
const RECV_BACKOFF: Duration = Duration::from_millis(5);

/// A [UdpSocket] wrapper that frames [Message]s and tracks inflight requests.
///
/// Responses whose transaction id doesn't match an inflight request, or that
/// arrive from a different address than the request went to, are dropped.
#[derive(Debug)]
pub struct RpcSocket {
    id: Id,
    next_tid: u16,
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    inflight_requests: InflightRequests,
}

impl RpcSocket {
    pub(crate) fn new(id: Id, config: &Config) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(0))))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("RpcSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            id,
            socket,
            next_tid: 0,
            local_addr,
            inflight_requests: InflightRequests::new(config.request_timeout),
        })
    }

    // === Getters ===

    /// Returns the address this socket is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Returns true if a request with this transaction id is still inflight,
    /// i.e. was sent and neither answered nor timed out yet.
    pub fn inflight(&self, transaction_id: &u16) -> bool {
        self.inflight_requests.contains(transaction_id)
    }

    /// Sends a request to the given address and returns the transaction id.
    pub fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u16 {
        let transaction_id = self.tid();
        let message = Message {
            transaction_id,
            sender_id: self.id,
            body: MessageBody::Request(request),
        };

        self.inflight_requests.insert(transaction_id, address);

        let _ = self.send(address, message).map_err(|error| {
            debug!(?error, "Error sending request message");
        });

        transaction_id
    }

    /// Sends a response for `transaction_id` to the given address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            sender_id: self.id,
            body: MessageBody::Response(response),
        };

        let _ = self.send(address, message).map_err(|error| {
            debug!(?error, "Error sending response message");
        });
    }

    /// Receives a single message from the socket, if any.
    ///
    /// Malformed packets and unexpected responses are dropped silently.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0_u8; MTU];

        self.inflight_requests.cleanup();

        match self.socket.recv_from(&mut buf) {
            Ok((amount, SocketAddr::V4(from))) => {
                if from.port() == 0 {
                    trace!(context = "socket_validation", "Message from port 0");
                    return None;
                }

                match Message::from_bytes(&buf[..amount]) {
                    Ok(message) => {
                        let expected = match message.body {
                            MessageBody::Request(_) => true,
                            MessageBody::Response(_) => self.is_expected_response(&message, &from),
                        };

                        if expected {
                            trace!(context = "socket_message_receiving", ?message, ?from);
                            return Some((message, from));
                        }
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            "Received malformed message"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", "Received IPv6 packet");
            }
            Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(RECV_BACKOFF);
            }
            Err(error) => {
                trace!(context = "socket_error", ?error, "recv_from failed");
            }
        }

        None
    }

    // === Private Methods ===

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        if let Some(to) = self.inflight_requests.remove(&message.transaction_id) {
            if compare_socket_addr(&to, from) {
                return true;
            }

            trace!(context = "socket_validation", "Response from wrong address");
        } else {
            trace!(
                context = "socket_validation",
                "Unexpected response transaction id"
            );
        }

        false
    }

    /// Increments self.next_tid and returns the previous value.
    ///
    /// Transaction ids are not reused eagerly; with a short request timeout
    /// we can't run out of 65536 ids before the oldest ones expire.
    fn tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn send(&mut self, address: SocketAddrV4, message: Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?message);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SendMessageError {
    /// Failed to encode the message.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),
}

// Same as SocketAddrV4::eq but ignores an unspecified ip, for testing.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

/// Requests that were sent but not answered yet.
///
/// Entries are appended in sending order, so the vector is sorted by
/// `sent_at` and expired entries form a prefix.
#[derive(Debug)]
struct InflightRequests {
    request_timeout: Duration,
    requests: Vec<(u16, InflightRequest)>,
}

#[derive(Debug, Clone)]
struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl InflightRequests {
    fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            requests: Vec::new(),
        }
    }

    fn contains(&self, tid: &u16) -> bool {
        self.requests
            .iter()
            .any(|(t, request)| t == tid && request.sent_at.elapsed() < self.request_timeout)
    }

    fn insert(&mut self, tid: u16, to: SocketAddrV4) {
        self.requests.push((
            tid,
            InflightRequest {
                to,
                sent_at: Instant::now(),
            },
        ));
    }

    fn remove(&mut self, tid: &u16) -> Option<SocketAddrV4> {
        let index = self.requests.iter().position(|(t, _)| t == tid)?;
        let (_, request) = self.requests.remove(index);

        if request.sent_at.elapsed() < self.request_timeout {
            Some(request.to)
        } else {
            None
        }
    }

    fn cleanup(&mut self) {
        let expired = self
            .requests
            .iter()
            .take_while(|(_, request)| request.sent_at.elapsed() >= self.request_timeout)
            .count();

        if expired > 0 {
            self.requests.drain(..expired);
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
