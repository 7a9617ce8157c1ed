use std::collections::HashMap;
use std::io::prelude::*;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::{io, thread, time::Duration};

use crossbeam_channel::TryRecvError;
use log::{debug, error, info, warn};

use super::backoff::{retry, ExponentialBackoff};
use super::comm::Communicator;
use crate::error::{Error, Result};

const CXN_R_TIMEOUT: Duration = Duration::from_millis(5000);
const CXN_W_TIMEOUT: Duration = Duration::from_millis(5000);
const RETRY_WAIT: Duration = Duration::from_millis(250);
const RETRY_MAX_WAIT: Duration = Duration::from_millis(5000);
const CONNECT_ATTEMPTS: usize = 20;
const SEND_ATTEMPTS: usize = 3;

type Outbound = crossbeam_channel::Sender<(usize, Vec<u8>)>;
type Inbound = crossbeam_channel::Sender<Result<Vec<u8>>>;




/// Frames on the wire are a little-endian `u64` byte count followed by the
/// bytes. The receiver acknowledges each frame by echoing its byte count.
///
fn write_frame<W: Write>(stream: &mut W, message: &[u8]) -> io::Result<()> {
    stream.write_all(&(message.len() as u64).to_le_bytes())?;
    stream.write_all(message)?;
    stream.flush()
}

fn read_u64<R: Read>(stream: &mut R) -> io::Result<u64> {
    let mut buffer = [0; 8];
    stream.read_exact(&mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}

/// The buffer grows with the bytes actually read, so a corrupt length prefix
/// cannot force a large allocation.
///
fn read_frame<R: Read>(stream: &mut R) -> io::Result<Vec<u8>> {
    let size = read_u64(stream)?;
    let mut buffer = Vec::new();
    stream.by_ref().take(size).read_to_end(&mut buffer)?;

    if buffer.len() as u64 != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame announced {} bytes but only {} arrived", size, buffer.len()),
        ))
    }
    Ok(buffer)
}




/// The threads behind a [`TcpCommunicator`]: one which accepts connections
/// from peers (spawning a reader for each), and one which delivers outgoing
/// messages in order, connecting to each peer on first use.
///
pub struct TcpHost {
    listen_thread: Option<thread::JoinHandle<()>>,
    send_thread: Option<thread::JoinHandle<()>>,
}

impl TcpHost {
    fn start(
        rank: usize,
        peers: Vec<SocketAddr>,
        inbound: Inbound,
    ) -> Result<(Self, Outbound)> {
        let addr = *peers
            .get(rank)
            .ok_or_else(|| Error::TransferFailure(format!("no address for rank {}", rank)))?;
        let listener = TcpListener::bind(addr)
            .map_err(|e| Error::TransferFailure(format!("failed to listen on {}: {}", addr, e)))?;

        info!("listening on {}", addr);

        let (send_sink, send_src) = crossbeam_channel::unbounded();
        let send_thread = Self::start_serial_sender(peers, send_src, inbound.clone());
        let listen_thread = Self::start_listener(listener, inbound);

        let host = TcpHost {
            listen_thread: Some(listen_thread),
            send_thread: Some(send_thread),
        };
        Ok((host, send_sink))
    }

    /// Wait for every queued message to be delivered. The outbound channel
    /// must have been closed first.
    fn join(&mut self) {
        if let Some(thread) = self.send_thread.take() {
            if thread.join().is_err() {
                error!("the send thread panicked")
            }
        }
    }

    fn start_serial_sender(
        peers: Vec<SocketAddr>,
        send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>,
        inbound: Inbound,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();

            for (rank, message) in send_src {
                if let Err(e) = Self::deliver(&mut table, &peers, rank, &message) {
                    error!("giving up on rank {}: {}", rank, e);
                    let _ = inbound.send(Err(e));
                    break
                }
            }
            debug!("send thread shutting down")
        })
    }

    fn deliver(table: &mut HashMap<usize, TcpStream>, peers: &[SocketAddr], rank: usize, message: &[u8]) -> Result<()> {
        let addr = *peers
            .get(rank)
            .ok_or_else(|| Error::TransferFailure(format!("no address for rank {}", rank)))?;

        let backoff = ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2, Some(SEND_ATTEMPTS));
        let result = retry(
            backoff,
            || {
                if !table.contains_key(&rank) {
                    table.insert(rank, Self::connect_with_retry(addr)?);
                }
                let client = table.get_mut(&rank).ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;

                let sent = write_frame(client, message).and_then(|()| read_u64(client)).and_then(|ack| {
                    if ack == message.len() as u64 {
                        Ok(())
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("sent {} bytes but the receiver acknowledged {}", message.len(), ack),
                        ))
                    }
                });
                if sent.is_err() {
                    table.remove(&rank);
                }
                sent
            },
            |e, delay| warn!("failed to send to {}: {}; retrying in {:?}", addr, e, delay),
        );

        match result {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(Error::TransferFailure(format!("failed to send to {}: {}", addr, e))),
            None => Err(Error::TransferFailure(format!("no attempt made to send to {}", addr))),
        }
    }

    fn start_listener(listener: TcpListener, inbound: Inbound) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => Self::handle_connection(stream, inbound.clone()),
                    Err(e) => warn!("failed to accept a connection: {}", e),
                }
            }
        })
    }

    fn handle_connection(mut stream: TcpStream, inbound: Inbound) {
        let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        info!("receiving connection from {}", remote);

        thread::spawn(move || loop {
            let frame = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("connection from {} closed", remote);
                    break
                }
                Err(e) => {
                    warn!("connection from {} failed: {}", remote, e);
                    break
                }
            };
            let size = frame.len() as u64;

            if inbound.send(Ok(frame)).is_err() {
                break
            }
            if let Err(e) = stream.write_all(&size.to_le_bytes()) {
                warn!("failed to acknowledge a message from {}: {}", remote, e);
                break
            }
        });
    }

    fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
        debug!("connecting to {}", addr);
        let backoff = ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2, Some(CONNECT_ATTEMPTS));

        let result = retry(
            backoff,
            || {
                let stream = TcpStream::connect(addr)?;
                stream.set_read_timeout(Some(CXN_R_TIMEOUT))?;
                stream.set_write_timeout(Some(CXN_W_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(stream)
            },
            |e: &io::Error, delay| debug!("connect to {} failed: {}; retrying in {:?}", addr, e, delay),
        );
        result.unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotConnected, "no connection attempt made")))
    }
}




/// A communicator over TCP, one process per rank. `peers` lists the
/// address of every rank, this one included.
///
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    host: TcpHost,
    send_sink: Option<Outbound>,
    recv_src: crossbeam_channel::Receiver<Result<Vec<u8>>>,
}

impl TcpCommunicator {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> Result<Self> {
        let num_peers = peers.len();
        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let (host, send_sink) = TcpHost::start(rank, peers, recv_sink)?;

        Ok(Self {
            rank,
            num_peers,
            host,
            send_sink: Some(send_sink),
            recv_src,
        })
    }

    /// Return the number of messages queued but not yet delivered.
    pub fn outbound_len(&self) -> usize {
        self.send_sink.as_ref().map_or(0, |s| s.len())
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> Result<()> {
        self.send_sink
            .as_ref()
            .ok_or_else(|| Error::TransferFailure("communicator is shut down".to_string()))?
            .send((rank, message))
            .map_err(|_| Error::TransferFailure("the send thread has stopped".to_string()))
    }

    fn recv(&self) -> Result<Vec<u8>> {
        self.recv_src
            .recv()
            .map_err(|_| Error::TransferFailure("the receive threads have stopped".to_string()))?
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>> {
        match self.recv_src.try_recv() {
            Ok(message) => message.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::TransferFailure("the receive threads have stopped".to_string())),
        }
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.send_sink.take();
        self.host.join();

        if self.host.listen_thread.is_some() {
            debug!("leaving the listener of rank {} detached", self.rank)
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::net::SocketAddr;

    use super::{read_frame, write_frame, TcpCommunicator};
    use crate::message::comm::Communicator;

    #[test]
    fn frames_are_length_prefixed() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        assert_eq!(&wire[..8], &5u64.to_le_bytes());
        assert_eq!(read_frame(&mut wire.as_slice()).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn a_corrupt_length_prefix_is_an_eof_not_an_allocation() {
        let mut wire = u64::MAX.to_le_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let error = read_frame(&mut wire.as_slice()).unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn two_ranks_exchange_messages_over_loopback() {
        let peers: Vec<SocketAddr> = vec!["127.0.0.1:47311".parse().unwrap(), "127.0.0.1:47312".parse().unwrap()];
        let a = TcpCommunicator::new(0, peers.clone()).unwrap();
        let b = TcpCommunicator::new(1, peers).unwrap();

        a.send(1, vec![1, 2, 3]).unwrap();
        b.send(0, vec![4]).unwrap();
        assert_eq!(b.recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(a.recv().unwrap(), vec![4]);
    }
}
