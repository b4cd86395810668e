//! A minimal message-passing seam between engine processes. Implementors
//! only need `send` and `recv` for a given transport layer; the engine never
//! assumes anything beyond reliable, non-blocking sends and blocking
//! receives. A loopback implementation for single-process runs and a
//! pure-Rust TCP implementation are included.

pub mod local;
pub mod tcp;

pub use local::LoopbackCommunicator;
pub use tcp::TcpCommunicator;

/// Interface for a group of engine processes that can exchange messages over
/// a network. The underlying transport can in principle be TCP, UDP, or a
/// higher level abstraction like MPI.
///
pub trait Communicator: Send + Sync {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peer processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately; it is not allowed to block until a matching
    /// receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Must be implemented to receive a message from any of the peers. This
    /// method is allowed to block until a message is ready to be received.
    fn recv(&self) -> Vec<u8>;
}
