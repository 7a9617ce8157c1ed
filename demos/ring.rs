use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;

use clap::Parser;
use log::{info, LevelFilter};

use patchflow::message::{ChannelCommunicator, Communicator, TcpCommunicator};

type AnyError = Box<dyn std::error::Error + Send + Sync>;




#[derive(Debug, Parser)]
#[clap(version = "1.0", about = "Pass a token around a ring of ranks")]
struct Opts {
    #[clap(short = 'r', long, default_value = "8")]
    ranks: usize,

    /// Number of times the token goes around
    #[clap(short = 'n', long, default_value = "3")]
    laps: u64,

    /// Use in-process channels instead of TCP
    #[clap(long)]
    threads: bool,

    #[clap(short = 'p', long, default_value = "8000")]
    port: u16,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: LevelFilter,
}

fn peer(port: u16, rank: usize) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port + rank as u16)
}

fn token(bytes: Vec<u8>) -> Result<u64, AnyError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| "the token is not 8 bytes")?;
    Ok(u64::from_le_bytes(bytes))
}

/**
 * Rank 0 starts the token at zero; every rank increments it and passes it
 * on. After the last lap rank 0 holds `laps * size`.
 */
fn circulate<C: Communicator>(comm: C, laps: u64) -> Result<(), AnyError> {
    let dest = (comm.rank() + 1) % comm.size();

    if comm.rank() == 0 {
        comm.send(dest, 1u64.to_le_bytes().to_vec())?;
    }
    for lap in 0..laps {
        let value = token(comm.recv()?)?;
        info!("[rank {}] lap {} received {}", comm.rank(), lap, value);

        if comm.rank() != 0 || lap + 1 < laps {
            comm.send(dest, (value + 1).to_le_bytes().to_vec())?;
        } else {
            info!("the token went around {} times and ended at {}", laps, value);
        }
    }
    Ok(())
}

fn main() -> Result<(), AnyError> {
    let opts = Opts::parse();
    simple_logger::SimpleLogger::new().with_level(opts.log_level).init()?;

    let peers: Vec<_> = (0..opts.ranks).map(|rank| peer(opts.port, rank)).collect();
    let laps = opts.laps;

    let procs: Vec<_> = if opts.threads {
        ChannelCommunicator::group(opts.ranks)
            .into_iter()
            .map(|comm| thread::spawn(move || circulate(comm, laps)))
            .collect()
    } else {
        (0..opts.ranks)
            .map(|rank| {
                let peers = peers.clone();
                thread::spawn(move || circulate(TcpCommunicator::new(rank, peers)?, laps))
            })
            .collect()
    };

    for process in procs {
        process.join().map_err(|_| "a rank panicked")??
    }
    Ok(())
}
