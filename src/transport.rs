use crate::error::Error;
use crate::protocol::{EventData, OperationResponse, RaiseEventOptions, StatusCode};
use crate::value::{Params, Value};

/// One inbound delivery from the peer transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    StatusChanged(StatusCode),
    OperationResponse(OperationResponse),
    Event(EventData),
}

/// A trait for the connection to the directory and session servers.
///
/// The session owns a statically dispatched `T: PeerTransport` and is the only caller.
/// Encryption, reliability, sequencing and framing are the transport's business;
/// the session only sees whole operations, responses and events.
///
/// See [`LoopbackTransport`](crate::loopback::LoopbackTransport) for an in-process implementation.
pub trait PeerTransport {
    type IntoError: Into<Error>;
    /// Starts connecting to `address`. The outcome arrives later as a
    /// [`StatusChanged`](Delivery::StatusChanged) delivery.
    ///
    /// Returns false if the attempt could not even be started.
    fn connect(&mut self, address: &str, app_id: &str) -> bool;
    /// Starts disconnecting. A `Disconnect` status follows.
    fn disconnect(&mut self);
    /// Sends an operation to the server currently connected.
    fn send_operation(
        &mut self,
        code: u8,
        params: Params,
        reliable: bool,
    ) -> Result<(), Self::IntoError>;
    /// Raises an event in the current room.
    fn raise_event(
        &mut self,
        code: u8,
        content: Value,
        reliable: bool,
        options: &RaiseEventOptions,
    ) -> Result<(), Self::IntoError>;
    /// Returns the next inbound delivery, if one is available.
    ///
    /// Should **NOT** block.
    fn poll(&mut self) -> Option<Delivery>;
    /// Server time in milliseconds, as estimated by the transport.
    fn server_time(&self) -> i32;
    /// Acknowledges received commands without dispatching anything, to keep the
    /// connection alive while the message queue is paused.
    fn send_acks_only(&mut self) {}
}
