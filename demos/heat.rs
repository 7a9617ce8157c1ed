use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::{Parser, ValueEnum};
use log::{error, info, LevelFilter};
use serde::{Deserialize, Serialize};

use patchflow::index_space::range3d;
use patchflow::message::{ChannelCommunicator, Communicator, TcpCommunicator};
use patchflow::warehouse::Entry;
use patchflow::{Access, DataWarehouse, Generation, Grid, Kernel, Registry, Scheduler, Task, TaskContext, TaskGraph, TaskSpec, VarLabel};

type AnyError = Box<dyn std::error::Error + Send + Sync>;




#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    Threads,
    Tcp,
}

#[derive(Debug, Parser)]
#[clap(version = "1.0", about = "Explicit 3D heat diffusion over a decomposed grid")]
struct Opts {
    /// Number of processes
    #[clap(short = 'r', long, default_value = "2")]
    ranks: usize,

    /// Run only this rank (TCP transport); otherwise every rank runs as a thread
    #[clap(long)]
    rank: Option<usize>,

    #[clap(value_enum, short = 't', long, default_value = "threads")]
    transport: Transport,

    /// Patches along the i and j axes
    #[clap(short = 'b', long, default_value = "4")]
    blocks: usize,

    /// Cells along each edge of a patch
    #[clap(short = 'c', long, default_value = "16")]
    cells: i64,

    #[clap(short = 'n', long, default_value = "20")]
    steps: u64,

    /// Diffusion number (stable below 1/6)
    #[clap(short = 'a', long, default_value = "0.1")]
    alpha: f64,

    #[clap(short = 'p', long, default_value = "7070")]
    port: u16,

    /// Write the final state to <checkpoint>.<rank>.cbor
    #[clap(long)]
    checkpoint: Option<PathBuf>,

    /// Resume from <restart>.<rank>.cbor instead of the initial condition
    #[clap(long)]
    restart: Option<PathBuf>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: LevelFilter,
}




#[derive(Serialize, Deserialize)]
struct Checkpoint {
    rank: usize,
    step: u64,
    entries: Vec<Entry>,
}




fn temperature() -> VarLabel {
    VarLabel::cell::<f64>("temperature")
}

/**
 * A Gaussian blob of heat in the middle of the domain.
 */
struct Init {
    center: f64,
    width: f64,
}

impl Kernel for Init {
    fn declare_access(&self, access: &mut Access) {
        access.computes(&temperature());
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> patchflow::Result<()> {
        let mut field = ctx.allocate::<f64>(&temperature(), 0)?;
        let (c, w) = (self.center, self.width);

        if let Some(mut view) = field.view_mut::<f64>() {
            view.fill_with(|(i, j, k)| {
                let r2 = [i, j, k].iter().map(|&x| (x as f64 + 0.5 - c).powi(2)).sum::<f64>();
                (-r2 / (w * w)).exp()
            });
        }
        ctx.put(&temperature(), 0, field)
    }
}

/**
 * One forward-Euler step of the heat equation on a 7-point stencil. The
 * temperature outside the domain is held at zero.
 */
struct Diffuse {
    alpha: f64,
}

impl Kernel for Diffuse {
    fn declare_access(&self, access: &mut Access) {
        access.requires(&temperature(), Generation::Old, 1).computes(&temperature());
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> patchflow::Result<()> {
        let mut next = ctx.allocate::<f64>(&temperature(), 0)?;
        let logical = next.logical().clone();
        let values: Vec<f64> = {
            let u = ctx.get::<f64>(&temperature(), 0, Generation::Old)?;
            logical
                .iter()
                .map(|(i, j, k)| {
                    let c = u.get((i, j, k));
                    let sum = u.get((i - 1, j, k)) + u.get((i + 1, j, k))
                        + u.get((i, j - 1, k)) + u.get((i, j + 1, k))
                        + u.get((i, j, k - 1)) + u.get((i, j, k + 1));
                    c + self.alpha * (sum - 6.0 * c)
                })
                .collect()
        };
        if let Some(mut view) = next.view_mut::<f64>() {
            for (index, value) in logical.iter().zip(values) {
                view.set(index, value)
            }
        }
        ctx.put(&temperature(), 0, next)
    }
}




fn registry(opts: &Opts) -> Registry {
    let center = (opts.blocks as i64 * opts.cells) as f64 / 2.0;
    let width = opts.cells as f64;
    let alpha = opts.alpha;

    let mut registry = Registry::new();
    registry
        .declare(temperature())
        .register("init", move |_| Box::new(Init { center, width }))
        .register("diffuse", move |_| Box::new(Diffuse { alpha }));
    registry
}

fn task_spec(kind: &str, grid: &Grid) -> TaskSpec {
    TaskSpec {
        name: kind.to_string(),
        kind: kind.to_string(),
        patches: grid.patches().map(|p| p.id()).collect(),
        materials: vec![0],
        access: Access::default(),
    }
}

fn create(registry: &Registry, spec: &TaskSpec) -> Result<Task, AnyError> {
    registry.create(spec).ok_or_else(|| {
        let known: Vec<_> = registry.kinds().collect();
        format!("no kernel of kind '{}' (registered: {})", spec.kind, known.join(", ")).into()
    })
}

fn checkpoint_path(base: &Path, rank: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}.cbor", rank));
    PathBuf::from(name)
}

fn total_heat(dw: &DataWarehouse) -> f64 {
    dw.old_entries()
        .filter_map(|(_, _, _, field)| field.view::<f64>())
        .map(|view| view.interior().iter().sum::<f64>())
        .sum()
}




fn run_rank<C: Communicator>(comm: C, opts: &Opts, stop: &AtomicBool) -> Result<(), AnyError> {
    let mut scheduler = Scheduler::new(comm);
    let rank = scheduler.rank();
    let n = opts.blocks as i64 * opts.cells;
    let grid = Grid::decompose(&range3d(0..n, 0..n, 0..opts.cells), (opts.blocks, opts.blocks, 1), scheduler.size());
    let registry = registry(opts);

    let mut dw = match &opts.restart {
        Some(base) => {
            let file = std::fs::File::open(checkpoint_path(base, rank))?;
            let checkpoint: Checkpoint = ciborium::de::from_reader(std::io::BufReader::new(file))?;
            info!("rank {} restarting from step {}", rank, checkpoint.step);
            DataWarehouse::restore(checkpoint.step, checkpoint.entries)?
        }
        None => {
            let mut dw = registry.warehouse()?;
            let init = create(&registry, &task_spec("init", &grid))?;
            scheduler.step(&TaskGraph::build(vec![init], &grid)?, &mut dw)?;
            dw
        }
    };

    let spec = task_spec("diffuse", &grid);

    for _ in 0..opts.steps {
        if stop.load(Ordering::SeqCst) {
            scheduler.abort("interrupted");
            return Err("interrupted".into())
        }
        let task = create(&registry, &spec)?;
        let graph = TaskGraph::build(vec![task], &grid)?;
        let summary = scheduler.step(&graph, &mut dw)?;

        info!(
            "[rank {}] step {}: {} tasks, {} transfers out, total heat {:.6}",
            rank,
            summary.step,
            summary.tasks_run,
            summary.transfers_sent,
            total_heat(&dw)
        );
    }

    if let Some(base) = &opts.checkpoint {
        let checkpoint = Checkpoint { rank, step: dw.step(), entries: dw.checkpoint() };
        let file = std::fs::File::create(checkpoint_path(base, rank))?;
        let mut buffer = std::io::BufWriter::new(file);
        ciborium::ser::into_writer(&checkpoint, &mut buffer)?;
    }
    Ok(())
}

fn peer(port: u16, rank: usize) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port + rank as u16)
}




fn main() -> Result<(), AnyError> {
    let opts = Opts::parse();
    simple_logger::SimpleLogger::new().with_level(opts.log_level).init()?;
    info!("{:?}", opts);

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let peers: Vec<_> = (0..opts.ranks).map(|rank| peer(opts.port, rank)).collect();

    let results: Vec<Result<(), AnyError>> = match (opts.transport, opts.rank) {
        (Transport::Tcp, Some(rank)) => {
            vec![TcpCommunicator::new(rank, peers)
                .map_err(AnyError::from)
                .and_then(|comm| run_rank(comm, &opts, &stop))]
        }
        (Transport::Tcp, None) => thread::scope(|s| {
            let handles: Vec<_> = (0..opts.ranks)
                .map(|rank| {
                    let (peers, opts, stop) = (peers.clone(), &opts, &stop);
                    s.spawn(move || run_rank(TcpCommunicator::new(rank, peers)?, opts, stop))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or_else(|_| Err("rank panicked".into()))).collect()
        }),
        (Transport::Threads, _) => thread::scope(|s| {
            let handles: Vec<_> = ChannelCommunicator::group(opts.ranks)
                .into_iter()
                .map(|comm| {
                    let (opts, stop) = (&opts, &stop);
                    s.spawn(move || run_rank(comm, opts, stop))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or_else(|_| Err("rank panicked".into()))).collect()
        }),
    };

    for (rank, result) in results.iter().enumerate() {
        if let Err(e) = result {
            error!("rank {} failed: {}", rank, e);
        }
    }
    if results.iter().any(Result::is_err) {
        return Err("the run did not complete".into())
    }
    Ok(())
}
