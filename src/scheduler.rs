//! Compiles a task graph into the plan of one process, and drives it.
//!
//! A plan visits the local nodes in the graph's global order. Before a node
//! runs, the scheduler waits only for the transfers that fill its ghost
//! layers, then copies or unpacks those layers into place. As soon as a node
//! has run, every transfer it produces is packed (in parallel) and sent, so
//! peers can proceed while this process moves on. Arriving messages are
//! drained between nodes and each transfer is acknowledged on receipt. The
//! step is complete once every outbound transfer is acknowledged; only then
//! is the "new" generation promoted.

use std::collections::{HashMap, HashSet};

use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::ghost;
use crate::graph::{NodeId, TaskGraph};
use crate::index_space::IndexSpace;
use crate::message::{Communicator, Mailbox, Message};
use crate::patch::{PatchId, Rank};
use crate::task::TaskContext;
use crate::transfer::{TransferPayload, TransferRecord};
use crate::variable::VarLabel;
use crate::warehouse::{DataWarehouse, Generation};




/**
 * How one ghost region of a node's requirement is filled before it runs.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GhostFill {
    /// Widen the storage of the node's own entry to hold `ghost` layers.
    Pad {
        label: VarLabel,
        material: usize,
        generation: Generation,
        patch: PatchId,
        ghost: i64,
    },
    /// Copy from a neighboring patch owned by this process.
    Local {
        label: VarLabel,
        material: usize,
        generation: Generation,
        source: PatchId,
        dest: PatchId,
        region: IndexSpace,
    },
    /// Unpack the payload of a received transfer.
    Remote { transfer: usize },
}




/**
 * One node of the local plan: the transfers it waits for, the ghost fills
 * which precede it, and the transfers sent once it has run.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanStep {
    pub node: NodeId,
    pub wait: Vec<usize>,
    pub fills: Vec<GhostFill>,
    pub send: Vec<usize>,
}




/**
 * The compiled plan of one process for one step.
 */
pub struct ExecutionPlan<'g> {
    graph: &'g TaskGraph,
    rank: Rank,
    steps: Vec<PlanStep>,
    prologue: Vec<usize>,
    inbound: usize,
    outbound: usize,
}

impl<'g> ExecutionPlan<'g> {

    pub fn graph(&self) -> &'g TaskGraph {
        self.graph
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /**
     * Return the transfers of "old" data this process sends when the step
     * starts.
     */
    pub fn prologue(&self) -> &[usize] {
        &self.prologue
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound
    }
}




/**
 * What happened during one step on this process.
 */
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepSummary {
    pub step: u64,
    pub tasks_run: usize,
    pub ghost_copies: usize,
    pub transfers_sent: usize,
    pub transfers_received: usize,
}




/**
 * Per-step bookkeeping of messages.
 */
#[derive(Default)]
struct Exchange {
    received: HashMap<usize, TransferPayload>,
    acked: HashSet<usize>,
    sent: usize,
    aborted_by_peer: bool,
}




pub struct Scheduler<C> {
    comm: C,
    mailbox: Mailbox,
}




// ============================================================================
impl<C: Communicator> Scheduler<C> {

    pub fn new(comm: C) -> Self {
        Self { comm, mailbox: Mailbox::new() }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /**
     * Restrict the graph's global order to the nodes this process owns, and
     * work out which transfers each of them waits for and sends. Fails with
     * `TransferFailure` if the grid names a process outside the
     * communicator.
     */
    pub fn compile<'g>(&self, graph: &'g TaskGraph) -> Result<ExecutionPlan<'g>> {
        let rank = self.rank();

        if let Some(patch) = graph.grid().patches().find(|p| p.owner() >= self.size()) {
            return Err(Error::TransferFailure(format!(
                "patch {} is owned by rank {}, but there are only {} processes",
                patch.id(),
                patch.owner(),
                self.size()
            )))
        }

        let mut produced: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut prologue = Vec::new();
        let mut inbound = 0;
        let mut outbound = 0;

        for t in graph.transfers() {
            if t.source_rank == rank {
                outbound += 1;
                match t.producer {
                    Some(node) => produced.entry(node).or_default().push(t.id),
                    None => prologue.push(t.id),
                }
            }
            if t.dest_rank == rank {
                inbound += 1;
            }
        }

        let steps: Vec<PlanStep> = graph
            .order()
            .iter()
            .filter(|&&node| graph.owner(node) == rank)
            .map(|&node| {
                let task = graph.task(node);
                let mut wait = Vec::new();
                let mut fills = Vec::new();

                for r in task.access().requires.iter().filter(|r| r.ghost > 0 && r.label.staggering.has_ghosts()) {
                    for &material in task.materials() {
                        fills.push(GhostFill::Pad {
                            label: r.label.clone(),
                            material,
                            generation: r.generation,
                            patch: node.patch,
                            ghost: r.ghost,
                        })
                    }
                }

                for g in graph.ghosts(node) {
                    match g.transfer {
                        Some(id) => {
                            if !wait.contains(&id) {
                                wait.push(id)
                            }
                            fills.push(GhostFill::Remote { transfer: id })
                        }
                        None => fills.push(GhostFill::Local {
                            label: g.label.clone(),
                            material: g.material,
                            generation: g.generation,
                            source: g.source,
                            dest: node.patch,
                            region: g.region.clone(),
                        }),
                    }
                }
                PlanStep {
                    node,
                    wait,
                    fills,
                    send: produced.remove(&node).unwrap_or_default(),
                }
            })
            .collect();

        debug!(
            "rank {}: plan of {} nodes, {} transfers in, {} out ({} at step start)",
            rank,
            steps.len(),
            inbound,
            outbound,
            prologue.len()
        );

        Ok(ExecutionPlan { graph, rank, steps, prologue, inbound, outbound })
    }

    /**
     * Run a plan against the data warehouse. Any error aborts the rest of
     * the plan; unless the error came from a peer's abort, every peer is
     * told to abort as well. The generations are not promoted.
     */
    pub fn execute(&mut self, plan: &ExecutionPlan<'_>, dw: &mut DataWarehouse) -> Result<StepSummary> {
        let mut exchange = Exchange::default();

        match self.run_plan(plan, dw, &mut exchange) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("rank {}: step {} failed: {}", self.rank(), dw.step(), e);

                if !exchange.aborted_by_peer {
                    self.abort(&e.to_string());
                }
                Err(e)
            }
        }
    }

    /**
     * Build the plan for a graph, run it, and promote the "new" generation.
     */
    pub fn step(&mut self, graph: &TaskGraph, dw: &mut DataWarehouse) -> Result<StepSummary> {
        let plan = self.compile(graph)?;
        let summary = self.execute(&plan, dw)?;
        dw.advance();
        Ok(summary)
    }

    /**
     * Tell every peer to abort whatever step it is in. Failures to reach a
     * peer are logged and otherwise ignored.
     */
    pub fn abort(&self, reason: &str) {
        let message = Message::Abort { origin: self.rank(), reason: reason.to_string() };

        if let Err(e) = message.encode().and_then(|bytes| self.comm.send_to_peers(bytes)) {
            warn!("rank {}: could not deliver an abort to all peers: {}", self.rank(), e)
        }
    }

    fn run_plan(&mut self, plan: &ExecutionPlan<'_>, dw: &mut DataWarehouse, exchange: &mut Exchange) -> Result<StepSummary> {
        let step = dw.step();
        let graph = plan.graph;
        let mut summary = StepSummary { step, ..StepSummary::default() };

        self.mailbox.start(step);
        self.send_transfers(graph, &plan.prologue, dw, exchange)?;

        for s in &plan.steps {
            self.wait_for(graph, &s.wait, exchange)?;

            for fill in &s.fills {
                self.fill(graph, fill, dw, exchange)?;
                summary.ghost_copies += matches!(fill, GhostFill::Local { .. }) as usize;
            }

            let task = graph.task(s.node);
            let patch = &graph.grid()[s.node.patch];
            debug!("rank {}: running {} on patch {}", plan.rank, task.name(), patch.id());

            let mut ctx = TaskContext::new(dw, task, patch, graph.halo());
            task.run(&mut ctx)?;
            summary.tasks_run += 1;

            self.send_transfers(graph, &s.send, dw, exchange)?;
            self.drain(graph, exchange)?;
        }

        while exchange.acked.len() < plan.outbound || exchange.received.len() < plan.inbound {
            let message = self.mailbox.recv(&self.comm)?;
            self.handle(graph, message, exchange)?;
        }

        summary.transfers_sent = exchange.sent;
        summary.transfers_received = exchange.received.len();

        info!(
            "rank {}: step {} ran {} tasks, sent {} and received {} transfers",
            plan.rank, step, summary.tasks_run, summary.transfers_sent, summary.transfers_received
        );
        Ok(summary)
    }

    fn send_transfers(&self, graph: &TaskGraph, ids: &[usize], dw: &DataWarehouse, exchange: &mut Exchange) -> Result<()> {
        let records = graph.transfers();

        let packed: Vec<Result<(Rank, Vec<u8>)>> = ids
            .par_iter()
            .map(|&id| -> Result<(Rank, Vec<u8>)> {
                let record = &records[id];
                let data = ghost::pack_variable(
                    dw,
                    &record.variable,
                    record.source_patch,
                    record.material,
                    record.generation,
                    &record.region,
                )?;
                let payload = TransferPayload {
                    variable: record.variable.clone(),
                    patch: record.source_patch,
                    material: record.material,
                    region: record.region.clone(),
                    data,
                };
                let message = Message::Transfer { step: dw.step(), id, payload: payload.encode() };
                Ok((record.dest_rank, message.encode()?))
            })
            .collect();

        for result in packed {
            let (rank, bytes) = result?;
            self.comm.send(rank, bytes)?;
            exchange.sent += 1;
        }
        Ok(())
    }

    fn wait_for(&mut self, graph: &TaskGraph, ids: &[usize], exchange: &mut Exchange) -> Result<()> {
        while let Some(id) = ids.iter().find(|&&id| !exchange.received.contains_key(&id)) {
            debug!("rank {}: waiting for transfer {}", self.rank(), id);
            let message = self.mailbox.recv(&self.comm)?;
            self.handle(graph, message, exchange)?;
        }
        Ok(())
    }

    fn drain(&mut self, graph: &TaskGraph, exchange: &mut Exchange) -> Result<()> {
        while let Some(message) = self.mailbox.try_recv(&self.comm)? {
            self.handle(graph, message, exchange)?;
        }
        Ok(())
    }

    fn handle(&self, graph: &TaskGraph, message: Message, exchange: &mut Exchange) -> Result<()> {
        match message {
            Message::Transfer { step, id, payload } => {
                let record = self.inbound_record(graph, id)?;
                let payload = TransferPayload::decode(&payload)?;
                payload.check(record)?;

                if exchange.received.insert(id, payload).is_some() {
                    warn!("rank {}: transfer {} of step {} arrived twice", self.rank(), id, step);
                }
                let ack = Message::Ack { step, id }.encode()?;
                self.comm.send(record.source_rank, ack)
            }
            Message::Ack { id, .. } => {
                if !exchange.acked.insert(id) {
                    warn!("rank {}: transfer {} acknowledged twice", self.rank(), id);
                }
                Ok(())
            }
            Message::Abort { origin, reason } => {
                exchange.aborted_by_peer = true;
                Err(Error::TransferFailure(format!("rank {} aborted: {}", origin, reason)))
            }
        }
    }

    fn inbound_record<'g>(&self, graph: &'g TaskGraph, id: usize) -> Result<&'g TransferRecord> {
        match graph.transfers().get(id) {
            Some(record) if record.dest_rank == self.rank() => Ok(record),
            _ => Err(Error::TransferFailure(format!("rank {} received unknown transfer {}", self.rank(), id))),
        }
    }

    fn fill(&self, graph: &TaskGraph, fill: &GhostFill, dw: &mut DataWarehouse, exchange: &Exchange) -> Result<()> {
        match fill {
            GhostFill::Pad { label, material, generation, patch, ghost } => {
                let field = dw.field_mut(&label.name, *patch, *material, *generation)?;
                let storage = field.logical().extend_all(*ghost);
                field.ensure_storage(&storage);
                Ok(())
            }
            GhostFill::Local { label, material, generation, source, dest, region } => {
                let data = ghost::pack_variable(dw, &label.name, *source, *material, *generation, region)?;
                ghost::unpack_variable(&data, dw, &label.name, *dest, *material, *generation, region)
            }
            GhostFill::Remote { transfer } => {
                let record = self.inbound_record(graph, *transfer)?;
                let payload = exchange
                    .received
                    .get(transfer)
                    .ok_or_else(|| Error::TransferFailure(format!("transfer {} has not arrived", transfer)))?;
                ghost::unpack_variable(
                    &payload.data,
                    dw,
                    &record.variable,
                    record.dest_patch,
                    record.material,
                    record.generation,
                    &record.region,
                )
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{GhostFill, Scheduler};
    use crate::error::{Error, Result};
    use crate::graph::{NodeId, TaskGraph};
    use crate::index_space::range3d;
    use crate::message::ChannelCommunicator;
    use crate::patch::{Grid, PatchId};
    use crate::task::{kernel_fn, Access, Kernel, Task, TaskContext};
    use crate::variable::VarLabel;
    use crate::warehouse::{DataWarehouse, Generation};

    fn rho() -> VarLabel {
        VarLabel::cell::<f64>("rho")
    }

    fn probe() -> VarLabel {
        VarLabel::cell::<f64>("probe")
    }

    fn two_patches(ranks: usize) -> Grid {
        Grid::decompose(&range3d(0..8, 0..4, 0..4), (2, 1, 1), ranks)
    }

    fn init_rho() -> Box<dyn Kernel> {
        kernel_fn(
            |access: &mut Access| { access.computes(&rho()); },
            |ctx: &mut TaskContext| {
                let mut field = ctx.allocate::<f64>(&rho(), 0)?;
                let p = ctx.patch().id() as f64;
                field.view_mut::<f64>().unwrap().fill_with(|(i, j, k)| 1000.0 * p + (i + 10 * j + 100 * k) as f64);
                ctx.put(&rho(), 0, field)
            },
        )
    }

    /// Copies the ghost layer below patch 1 into the interior of `probe`.
    fn read_ghost() -> Box<dyn Kernel> {
        kernel_fn(
            |access: &mut Access| {
                access.requires(&rho(), Generation::New, 1).computes(&probe());
            },
            |ctx: &mut TaskContext| {
                let mut field = ctx.allocate::<f64>(&probe(), 0)?;
                let logical = field.logical().clone();
                let values: Vec<f64> = {
                    let rho = ctx.get::<f64>(&rho(), 0, Generation::New)?;
                    logical.iter().map(|(_, j, k)| rho.get((3, j, k))).collect()
                };
                let mut view = field.view_mut::<f64>().unwrap();
                for (index, value) in logical.iter().zip(values) {
                    view.set(index, value)
                }
                ctx.put(&probe(), 0, field)
            },
        )
    }

    fn task(name: &str, kernel: Box<dyn Kernel>, patches: Vec<PatchId>) -> Task {
        Task::new(name, kernel, patches, vec![0])
    }

    fn run_ranks<F>(n: usize, f: F) -> Vec<Result<DataWarehouse>>
    where
        F: Fn(Scheduler<ChannelCommunicator>) -> Result<DataWarehouse> + Sync,
    {
        let group = ChannelCommunicator::group(n);
        std::thread::scope(|s| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(Scheduler::new(comm)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn plans_wait_only_where_ghost_data_crosses_ranks() {
        let graph = TaskGraph::build(
            vec![task("t1", init_rho(), vec![0, 1]), task("t2", read_ghost(), vec![1])],
            &two_patches(2),
        )
        .unwrap();
        let mut group = ChannelCommunicator::group(2);
        let one = Scheduler::new(group.remove(1));
        let zero = Scheduler::new(group.remove(0));

        let plan = zero.compile(&graph).unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].send, vec![0]);
        assert_eq!(plan.outbound_count(), 1);

        let plan = one.compile(&graph).unwrap();
        let nodes: Vec<_> = plan.steps().iter().map(|s| s.node).collect();
        assert_eq!(nodes, vec![NodeId { task: 0, patch: 1 }, NodeId { task: 1, patch: 1 }]);
        assert!(plan.steps()[0].wait.is_empty());
        assert_eq!(plan.steps()[1].wait, vec![0]);
        assert!(matches!(plan.steps()[1].fills[0], GhostFill::Pad { ghost: 1, patch: 1, .. }));
        assert_eq!(plan.steps()[1].fills[1], GhostFill::Remote { transfer: 0 });
        assert_eq!(plan.inbound_count(), 1);
    }

    #[test]
    fn compile_rejects_a_grid_larger_than_the_communicator() {
        let graph = TaskGraph::build(vec![task("t1", init_rho(), vec![0, 1])], &two_patches(2)).unwrap();
        let scheduler = Scheduler::new(ChannelCommunicator::group(1).remove(0));
        assert!(matches!(scheduler.compile(&graph), Err(e) if e.is_transfer_failure()));
    }

    #[test]
    fn ghost_cells_read_across_ranks_hold_the_neighbors_values() {
        let results = run_ranks(2, |mut scheduler| {
            let graph = TaskGraph::build(
                vec![task("t1", init_rho(), vec![0, 1]), task("t2", read_ghost(), vec![1])],
                &two_patches(2),
            )?;
            let mut dw = DataWarehouse::new();
            scheduler.step(&graph, &mut dw)?;
            Ok(dw)
        });
        let zero = results[0].as_ref().unwrap();
        let one = results[1].as_ref().unwrap();

        assert_eq!(zero.step(), 1);
        assert!(zero.contains("rho", 0, 0, Generation::Old));
        assert!(!zero.contains("rho", 1, 0, Generation::Old));

        let probe = one.get::<f64>(&probe(), 1, 0, Generation::Old).unwrap();
        for j in 0..4 {
            for k in 0..4 {
                assert_eq!(probe.get((5, j, k)), (3 + 10 * j + 100 * k) as f64);
            }
        }
    }

    #[test]
    fn independent_tasks_commute() {
        let a = VarLabel::cell::<f64>("a");
        let b = VarLabel::cell::<i32>("b");
        let make = |reverse: bool| {
            let (la, lb) = (a.clone(), b.clone());
            let ta = task(
                "a",
                kernel_fn(
                    move |access: &mut Access| { access.computes(&la); },
                    |ctx: &mut TaskContext| {
                        let label = VarLabel::cell::<f64>("a");
                        let mut field = ctx.allocate::<f64>(&label, 0)?;
                        field.view_mut::<f64>().unwrap().fill_with(|(i, j, k)| (i * j * k) as f64);
                        ctx.put(&label, 0, field)
                    },
                ),
                vec![0, 1],
            );
            let tb = task(
                "b",
                kernel_fn(
                    move |access: &mut Access| { access.computes(&lb); },
                    |ctx: &mut TaskContext| {
                        let label = VarLabel::cell::<i32>("b");
                        let mut field = ctx.allocate::<i32>(&label, 0)?;
                        field.view_mut::<i32>().unwrap().fill_with(|(i, j, k)| (i + j + k) as i32);
                        ctx.put(&label, 0, field)
                    },
                ),
                vec![0, 1],
            );
            if reverse { vec![tb, ta] } else { vec![ta, tb] }
        };

        let mut checkpoints = Vec::new();

        for reverse in [false, true] {
            let graph = TaskGraph::build(make(reverse), &two_patches(1)).unwrap();
            let mut scheduler = Scheduler::new(ChannelCommunicator::group(1).remove(0));
            let mut dw = DataWarehouse::new();
            scheduler.step(&graph, &mut dw).unwrap();
            checkpoints.push(dw.checkpoint());
        }
        assert_eq!(checkpoints[0].len(), 4);
        assert_eq!(checkpoints[0], checkpoints[1]);
    }

    #[test]
    fn a_failing_task_aborts_every_rank() {
        let results = run_ranks(2, |mut scheduler| {
            let fail_on_one = kernel_fn(
                |access: &mut Access| { access.computes(&rho()); },
                |ctx: &mut TaskContext| {
                    if ctx.patch().id() == 1 {
                        ctx.get::<f64>(&probe(), 0, Generation::Old)?;
                    }
                    let field = ctx.allocate::<f64>(&rho(), 0)?;
                    ctx.put(&rho(), 0, field)
                },
            );
            let mut uses = Access::default();
            uses.requires(&rho(), Generation::New, 1);
            let tasks = vec![
                task("init", fail_on_one, vec![0, 1]),
                task("use", kernel_fn(|_: &mut Access| (), |_| Ok(())), vec![0]).with_access(uses),
            ];
            let graph = TaskGraph::build(tasks, &two_patches(2))?;
            let mut dw = DataWarehouse::new();
            scheduler.step(&graph, &mut dw)?;
            Ok(dw)
        });

        assert!(matches!(results[1], Err(Error::VariableNotFound { .. })));
        assert!(matches!(results[0], Err(Error::TransferFailure(_))));
    }

    /// Explicit diffusion of a cell variable, reading ghost cells of the
    /// previous step. Values beyond the domain are zero.
    fn diffuse() -> Box<dyn Kernel> {
        kernel_fn(
            |access: &mut Access| {
                access.requires(&rho(), Generation::Old, 1).computes(&rho());
            },
            |ctx: &mut TaskContext| {
                let mut next = ctx.allocate::<f64>(&rho(), 0)?;
                let values: Vec<f64> = {
                    let old = ctx.get::<f64>(&rho(), 0, Generation::Old)?;
                    next.logical()
                        .iter()
                        .map(|(i, j, k)| {
                            let u = old.get((i, j, k));
                            let sum = old.get((i - 1, j, k)) + old.get((i + 1, j, k))
                                + old.get((i, j - 1, k)) + old.get((i, j + 1, k))
                                + old.get((i, j, k - 1)) + old.get((i, j, k + 1));
                            u + 0.1 * (sum - 6.0 * u)
                        })
                        .collect()
                };
                let logical = next.logical().clone();
                let mut view = next.view_mut::<f64>().unwrap();
                for (index, value) in logical.iter().zip(values) {
                    view.set(index, value)
                }
                ctx.put(&rho(), 0, next)
            },
        )
    }

    fn diffusion_run(ranks: usize) -> Vec<DataWarehouse> {
        run_ranks(ranks, |mut scheduler| {
            let grid = Grid::decompose(&range3d(0..8, 0..6, 0..4), (2, 2, 1), scheduler.size());
            let mut dw = DataWarehouse::new();
            let graph = TaskGraph::build(vec![task("init", init_rho(), (0..4).collect())], &grid)?;
            scheduler.step(&graph, &mut dw)?;

            for _ in 0..3 {
                let graph = TaskGraph::build(vec![task("diffuse", diffuse(), (0..4).collect())], &grid)?;
                scheduler.step(&graph, &mut dw)?;
            }
            Ok(dw)
        })
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
    }

    #[test]
    fn diffusion_does_not_depend_on_the_number_of_ranks() {
        let serial = diffusion_run(1);
        let parallel = diffusion_run(2);
        assert_eq!(serial[0].step(), 4);

        for dw in &parallel {
            for (name, patch, material, field) in dw.old_entries() {
                let expected = serial[0].field(name, patch, material, Generation::Old).unwrap();
                assert_eq!(field.view::<f64>().unwrap().interior(), expected.view::<f64>().unwrap().interior());
            }
        }
        assert_eq!(parallel.iter().map(|dw| dw.len(Generation::Old)).sum::<usize>(), 4);
    }
}
