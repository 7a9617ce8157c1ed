use crossbeam_channel::{Receiver, Sender, TryRecvError};

use super::comm::Communicator;
use crate::error::{Error, Result};

/// A communicator whose peers are threads of the same process, connected by
/// unbounded channels.
///
pub struct ChannelCommunicator {
    rank: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbound: Receiver<Vec<u8>>,
}

impl ChannelCommunicator {
    /// Create a fully connected group of `size` communicators, in rank
    /// order. Each one is meant to be moved into its own thread.
    pub fn group(size: usize) -> Vec<Self> {
        let (sinks, sources): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        sources
            .into_iter()
            .enumerate()
            .map(|(rank, inbound)| Self {
                rank,
                peers: sinks.clone(),
                inbound,
            })
            .collect()
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> Result<()> {
        self.peers
            .get(rank)
            .ok_or_else(|| Error::TransferFailure(format!("no rank {} in a group of {}", rank, self.peers.len())))?
            .send(message)
            .map_err(|_| Error::TransferFailure(format!("rank {} has shut down", rank)))
    }

    fn recv(&self) -> Result<Vec<u8>> {
        self.inbound
            .recv()
            .map_err(|_| Error::TransferFailure("all peers have shut down".to_string()))
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        match self.inbound.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::TransferFailure("all peers have shut down".to_string())),
        }
    }
}
