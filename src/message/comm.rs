use crate::error::Result;

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, in-process
/// channels, or a higher level abstraction like MPI.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted. Failures of the transport which are
    /// detected later are reported by `recv`.
    fn send(&self, rank: usize, message: Vec<u8>) -> Result<()>;

    /// Must be implemented to receive a message from any of the peers. This
    /// method is allowed to block until a message is ready to be received.
    fn recv(&self) -> Result<Vec<u8>>;

    /// Must be implemented to return a message if one has already arrived,
    /// without blocking.
    fn try_recv(&self) -> Result<Option<Vec<u8>>>;

    /// Send a copy of the message to every other process.
    ///
    fn send_to_peers(&self, message: Vec<u8>) -> Result<()> {
        for rank in (0..self.size()).filter(|&r| r != self.rank()) {
            self.send(rank, message.clone())?
        }
        Ok(())
    }
}
