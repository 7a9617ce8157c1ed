//! Construction of the dependency graph among the tasks of one step.
//!
//! Each (task, patch) pair is a node. Writers of a (variable, patch,
//! material) entry form a chain in registration order: the task which
//! computes it, then each task which modifies it. A task requiring the
//! entry from the "new" generation reads the version left by the last
//! writer registered before it, on its own patch and on every neighbor
//! within the ghost width. Edges run from that writer to the reader, from
//! each writer to the next, and from a reader to the next writer of the
//! version it read (when both run on the same process). Edges whose
//! endpoints are owned by different processes need a transfer, and each one
//! produces a [`TransferRecord`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::adjacency_list::AdjacencyList;
use crate::error::{Error, Result};
use crate::index_space::IndexSpace;
use crate::patch::{Grid, Patch, PatchId, Rank};
use crate::task::{Requirement, Task};
use crate::transfer::TransferRecord;
use crate::variable::VarLabel;
use crate::warehouse::Generation;




/**
 * One task running on one patch. Ordering is by task registration index
 * first, then by patch id.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub task: usize,
    pub patch: PatchId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Both ends run on the same process; the edge only constrains order.
    Local,
    /// The ends run on different processes; data must be moved.
    Transfer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub variable: String,
    pub material: usize,
    pub ghost: i64,
    pub kind: EdgeKind,
}




/**
 * Where a node gets the ghost layer of one of its requirements from: a
 * region of the same variable on a neighboring patch, copied in place when
 * the neighbor is local or delivered by the transfer with the given id.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GhostSource {
    pub label: VarLabel,
    pub material: usize,
    pub generation: Generation,
    pub source: PatchId,
    pub region: IndexSpace,
    pub transfer: Option<usize>,
}




/**
 * The dependency graph of all tasks registered for one step. Building it
 * validates the declarations: a second `computes` of an entry is a
 * `DuplicateVariable`, a `modifies` or "new" `requires` with nothing to read
 * is a `VariableNotFound`, a ghost requirement on particle data is
 * `InsufficientGhostData`, and a cycle is a `DependencyCycle`.
 */
pub struct TaskGraph {
    tasks: Vec<Task>,
    grid: Grid,
    nodes: Vec<NodeId>,
    edges: Vec<Edge>,
    adjacency: AdjacencyList<NodeId>,
    transfers: Vec<TransferRecord>,
    ghosts: BTreeMap<NodeId, Vec<GhostSource>>,
    halo: BTreeMap<String, i64>,
    order: Vec<NodeId>,
}




// ============================================================================
impl TaskGraph {

    /**
     * Build the graph for the given tasks, in registration order, over the
     * given grid.
     */
    pub fn build(tasks: Vec<Task>, grid: &Grid) -> Result<Self> {
        let mut builder = Builder::new(&tasks, grid);
        builder.check_requirements()?;
        builder.chain_writers()?;
        builder.connect_readers()?;

        let Builder { nodes, edges, transfers, ghosts, halo, .. } = builder;

        let mut adjacency = AdjacencyList::new();
        for edge in &edges {
            adjacency.insert(edge.from, edge.to);
        }

        let order = adjacency.topological_order(&nodes).map_err(|stuck| {
            Error::DependencyCycle(stuck
                .iter()
                .map(|node| format!("{}@{}", tasks[node.task].name(), node.patch))
                .collect())
        })?;

        info!(
            "task graph: {} tasks, {} nodes, {} edges, {} transfers",
            tasks.len(),
            nodes.len(),
            adjacency.len(),
            transfers.len()
        );

        Ok(Self {
            tasks,
            grid: grid.clone(),
            nodes,
            edges,
            adjacency,
            transfers,
            ghosts,
            halo,
            order,
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, node: NodeId) -> &Task {
        &self.tasks[node.task]
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /**
     * Return every node, in registration order.
     */
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.adjacency.contains(&from, &to)
    }

    pub fn predecessors(&self, node: NodeId) -> impl Iterator<Item = &NodeId> {
        self.adjacency.incoming_edges(&node)
    }

    pub fn transfers(&self) -> &[TransferRecord] {
        &self.transfers
    }

    /**
     * Return the ghost sources of a node's requirements.
     */
    pub fn ghosts(&self, node: NodeId) -> &[GhostSource] {
        self.ghosts.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /**
     * Return the widest ghost layer required of each variable.
     */
    pub fn halo(&self) -> &BTreeMap<String, i64> {
        &self.halo
    }

    /**
     * Return all nodes in an order consistent with every edge, with ties
     * broken by registration order. Every process computes the same order.
     */
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /**
     * Return the process which runs the given node.
     */
    pub fn owner(&self, node: NodeId) -> Rank {
        self.grid.get(node.patch).map_or(0, Patch::owner)
    }
}




type EntryKey = (String, PatchId, usize);
type TransferKey = (String, usize, PatchId, PatchId, Option<NodeId>, Generation);

struct Builder<'a> {
    tasks: &'a [Task],
    grid: &'a Grid,
    nodes: Vec<NodeId>,
    writers: HashMap<EntryKey, Vec<NodeId>>,
    edges: Vec<Edge>,
    transfers: Vec<TransferRecord>,
    transfer_index: HashMap<TransferKey, usize>,
    ghosts: BTreeMap<NodeId, Vec<GhostSource>>,
    halo: BTreeMap<String, i64>,
}




// ============================================================================
impl<'a> Builder<'a> {

    fn new(tasks: &'a [Task], grid: &'a Grid) -> Self {
        let mut nodes = Vec::new();

        for (index, task) in tasks.iter().enumerate() {
            let patches: BTreeSet<PatchId> = task.patches().iter().copied().collect();

            for patch in patches {
                if grid.get(patch).is_some() {
                    nodes.push(NodeId { task: index, patch })
                } else {
                    warn!("task {} names patch {} which is not in the grid; skipped", task.name(), patch)
                }
            }
        }
        Self {
            tasks,
            grid,
            nodes,
            writers: HashMap::new(),
            edges: Vec::new(),
            transfers: Vec::new(),
            transfer_index: HashMap::new(),
            ghosts: BTreeMap::new(),
            halo: BTreeMap::new(),
        }
    }

    fn check_requirements(&mut self) -> Result<()> {
        let tasks = self.tasks;

        for node in &self.nodes {
            let task = &tasks[node.task];

            for r in &task.access().requires {
                if r.ghost > 0 && !r.label.staggering.has_ghosts() {
                    let space = self.patch(node.patch).index_space().clone();
                    return Err(Error::InsufficientGhostData {
                        name: r.label.name.clone(),
                        region: space.extend_all(r.ghost),
                        storage: space,
                    })
                }
                let halo = self.halo.entry(r.label.name.clone()).or_insert(0);
                *halo = (*halo).max(r.ghost);
            }
        }
        Ok(())
    }

    fn chain_writers(&mut self) -> Result<()> {
        let tasks = self.tasks;

        for i in 0..self.nodes.len() {
            let node = self.nodes[i];
            let task = &tasks[node.task];

            for &material in task.materials() {
                for label in &task.access().computes {
                    let key = (label.name.clone(), node.patch, material);

                    if self.writers.contains_key(&key) {
                        return Err(Error::DuplicateVariable { name: key.0, patch: node.patch, material })
                    }
                    self.writers.insert(key, vec![node]);
                }
                for label in &task.access().modifies {
                    if task.access().computes_name(&label.name) {
                        continue
                    }
                    let key = (label.name.clone(), node.patch, material);
                    let chain = match self.writers.get_mut(&key) {
                        Some(chain) => chain,
                        None => return Err(Error::VariableNotFound {
                            name: key.0,
                            patch: node.patch,
                            material,
                            generation: Generation::New,
                        }),
                    };
                    let previous = chain[chain.len() - 1];

                    if previous != node {
                        chain.push(node);
                        self.edges.push(Edge {
                            from: previous,
                            to: node,
                            variable: label.name.clone(),
                            material,
                            ghost: 0,
                            kind: EdgeKind::Local,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn connect_readers(&mut self) -> Result<()> {
        let tasks = self.tasks;

        for i in 0..self.nodes.len() {
            let node = self.nodes[i];
            let task = &tasks[node.task];

            for &material in task.materials() {
                for r in &task.access().requires {
                    match r.generation {
                        Generation::New => self.read_new(node, material, r)?,
                        Generation::Old => self.read_old(node, material, r),
                    }
                }
            }
        }
        Ok(())
    }

    fn read_new(&mut self, node: NodeId, material: usize, r: &Requirement) -> Result<()> {
        let name = &r.label.name;
        let (writer, next) = self.version(name, node.patch, material, node.task)?;

        self.edges.push(Edge { from: writer, to: node, variable: name.clone(), material, ghost: 0, kind: EdgeKind::Local });

        if let Some(next) = next.filter(|&next| next != node) {
            self.edges.push(Edge { from: node, to: next, variable: name.clone(), material, ghost: 0, kind: EdgeKind::Local });
        }

        for (source, region) in self.ghost_regions(node.patch, r) {
            let (writer, next) = self.version(name, source, material, node.task)?;
            let remote = self.patch(source).owner() != self.patch(node.patch).owner();

            self.edges.push(Edge {
                from: writer,
                to: node,
                variable: name.clone(),
                material,
                ghost: r.ghost,
                kind: if remote { EdgeKind::Transfer } else { EdgeKind::Local },
            });

            let transfer = if remote {
                Some(self.transfer(&r.label, material, source, node.patch, Some(writer), Generation::New, &region))
            } else {
                if let Some(next) = next.filter(|&next| next != node) {
                    self.edges.push(Edge { from: node, to: next, variable: name.clone(), material, ghost: 0, kind: EdgeKind::Local });
                }
                None
            };
            self.add_ghost(node, &r.label, material, Generation::New, source, region, transfer);
        }
        Ok(())
    }

    fn read_old(&mut self, node: NodeId, material: usize, r: &Requirement) {
        for (source, region) in self.ghost_regions(node.patch, r) {
            let remote = self.patch(source).owner() != self.patch(node.patch).owner();
            let transfer = if remote {
                Some(self.transfer(&r.label, material, source, node.patch, None, Generation::Old, &region))
            } else {
                None
            };
            self.add_ghost(node, &r.label, material, Generation::Old, source, region, transfer);
        }
    }

    /**
     * Return the neighbors of `patch` within the requirement's ghost width,
     * with the region of each which lands in the ghost layer.
     */
    fn ghost_regions(&self, patch: PatchId, r: &Requirement) -> Vec<(PatchId, IndexSpace)> {
        if r.ghost <= 0 {
            return Vec::new()
        }
        let dest = self.patch(patch);

        self.grid
            .neighbors_within(patch, r.ghost)
            .into_iter()
            .filter_map(|source| {
                dest.ghost_region(self.patch(source), r.label.staggering, r.ghost)
                    .map(|region| (source, region))
            })
            .collect()
    }

    /**
     * Return the writer of an entry whose version the given task reads, and
     * the writer which follows it, if any. That is the last writer
     * registered before the task; a task registered ahead of every writer
     * reads the final version, and is ordered after it by the sort.
     */
    fn version(&self, name: &str, patch: PatchId, material: usize, task: usize) -> Result<(NodeId, Option<NodeId>)> {
        let chain = self.writers.get(&(name.to_string(), patch, material));
        let found = chain.and_then(|chain| match chain.iter().rposition(|w| w.task < task) {
            Some(index) => Some((chain[index], chain.get(index + 1).copied())),
            None => chain.last().map(|&last| (last, None)),
        });
        found.ok_or_else(|| Error::VariableNotFound {
            name: name.to_string(),
            patch,
            material,
            generation: Generation::New,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &mut self,
        label: &VarLabel,
        material: usize,
        source: PatchId,
        dest: PatchId,
        producer: Option<NodeId>,
        generation: Generation,
        region: &IndexSpace) -> usize
    {
        let key = (label.name.clone(), material, source, dest, producer, generation);

        if let Some(&id) = self.transfer_index.get(&key) {
            let record = &mut self.transfers[id];
            if !record.region.contains_space(region) {
                record.region = region.clone()
            }
            return id
        }
        let id = self.transfers.len();
        let record = TransferRecord {
            id,
            source_rank: self.patch(source).owner(),
            dest_rank: self.patch(dest).owner(),
            variable: label.name.clone(),
            source_patch: source,
            dest_patch: dest,
            material,
            region: region.clone(),
            generation,
            producer,
        };
        debug!(
            "transfer {}: '{}' ({}) patch {} -> {}, rank {} -> {}",
            id, record.variable, generation, source, dest, record.source_rank, record.dest_rank
        );
        self.transfers.push(record);
        self.transfer_index.insert(key, id);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn add_ghost(
        &mut self,
        node: NodeId,
        label: &VarLabel,
        material: usize,
        generation: Generation,
        source: PatchId,
        region: IndexSpace,
        transfer: Option<usize>)
    {
        self.ghosts.entry(node).or_default().push(GhostSource {
            label: label.clone(),
            material,
            generation,
            source,
            region,
            transfer,
        })
    }

    fn patch(&self, id: PatchId) -> &'a Patch {
        &self.grid[id]
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{EdgeKind, NodeId, TaskGraph};
    use crate::error::Error;
    use crate::index_space::range3d;
    use crate::patch::{Grid, PatchId};
    use crate::task::{kernel_fn, Access, Task};
    use crate::variable::VarLabel;
    use crate::warehouse::Generation;

    fn rho() -> VarLabel {
        VarLabel::cell::<f64>("rho")
    }

    fn task(name: &str, patches: Vec<PatchId>, access: Access) -> Task {
        Task::new(name, kernel_fn(|_: &mut Access| (), |_| Ok(())), patches, vec![0]).with_access(access)
    }

    fn computes(label: &VarLabel) -> Access {
        let mut access = Access::default();
        access.computes(label);
        access
    }

    fn modifies(label: &VarLabel) -> Access {
        let mut access = Access::default();
        access.modifies(label);
        access
    }

    fn requires(label: &VarLabel, generation: Generation, ghost: i64) -> Access {
        let mut access = Access::default();
        access.requires(label, generation, ghost);
        access
    }

    fn node(task: usize, patch: PatchId) -> NodeId {
        NodeId { task, patch }
    }

    fn two_ranks() -> Grid {
        Grid::decompose(&range3d(0..8, 0..4, 0..4), (2, 1, 1), 2)
    }

    fn position(graph: &TaskGraph, n: NodeId) -> usize {
        graph.order().iter().position(|&m| m == n).unwrap()
    }

    #[test]
    fn face_adjacent_requirement_across_ranks_makes_one_transfer() {
        let tasks = vec![
            task("t1", vec![0, 1], computes(&rho())),
            task("t2", vec![1], requires(&rho(), Generation::New, 1)),
        ];
        let graph = TaskGraph::build(tasks, &two_ranks()).unwrap();

        assert_eq!(graph.transfers().len(), 1);
        let transfer = &graph.transfers()[0];
        assert_eq!((transfer.source_rank, transfer.dest_rank), (0, 1));
        assert_eq!((transfer.source_patch, transfer.dest_patch), (0, 1));
        assert_eq!(transfer.region, range3d(3..4, 0..4, 0..4));
        assert_eq!(transfer.producer, Some(node(0, 0)));

        assert!(graph.contains_edge(node(0, 0), node(1, 1)));
        assert!(graph.contains_edge(node(0, 1), node(1, 1)));
        assert!(graph.edges().iter().any(|e| e.from == node(0, 0) && e.kind == EdgeKind::Transfer));
        assert!(position(&graph, node(0, 0)) < position(&graph, node(1, 1)));

        let ghosts = graph.ghosts(node(1, 1));
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].transfer, Some(0));
        assert_eq!(graph.halo()["rho"], 1);
    }

    #[test]
    fn second_computes_is_a_duplicate_variable() {
        let tasks = vec![
            task("a", vec![0], computes(&rho())),
            task("b", vec![0, 1], computes(&rho())),
        ];
        match TaskGraph::build(tasks, &two_ranks()) {
            Err(Error::DuplicateVariable { name, patch, material }) => {
                assert_eq!((name.as_str(), patch, material), ("rho", 0, 0))
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("graph should not build"),
        }
    }

    #[test]
    fn reading_a_neighbor_while_modifying_it_is_a_cycle() {
        let grid = Grid::decompose(&range3d(0..8, 0..4, 0..4), (2, 1, 1), 1);
        let mut smooth = modifies(&rho());
        smooth.requires(&rho(), Generation::New, 1);

        let tasks = vec![
            task("init", vec![0, 1], computes(&rho())),
            task("smooth", vec![0, 1], smooth),
        ];
        match TaskGraph::build(tasks, &grid) {
            Err(Error::DependencyCycle(stuck)) => assert_eq!(stuck, vec!["smooth@0", "smooth@1"]),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("graph should not build"),
        }
    }

    #[test]
    fn missing_producers_are_not_found() {
        let modify_first = vec![task("m", vec![0], modifies(&rho())), task("c", vec![0], computes(&rho()))];
        assert!(matches!(TaskGraph::build(modify_first, &two_ranks()), Err(Error::VariableNotFound { .. })));

        let neighbor_missing = vec![
            task("c", vec![1], computes(&rho())),
            task("r", vec![1], requires(&rho(), Generation::New, 1)),
        ];
        match TaskGraph::build(neighbor_missing, &two_ranks()) {
            Err(Error::VariableNotFound { patch, generation, .. }) => assert_eq!((patch, generation), (0, Generation::New)),
            _ => panic!("expected a missing neighbor"),
        }
    }

    #[test]
    fn consumers_registered_before_their_producer_run_after_it() {
        let tasks = vec![
            task("r", vec![1], requires(&rho(), Generation::New, 1)),
            task("c", vec![0, 1], computes(&rho())),
        ];
        let graph = TaskGraph::build(tasks, &two_ranks()).unwrap();

        assert!(graph.contains_edge(node(1, 1), node(0, 1)));
        assert!(graph.contains_edge(node(1, 0), node(0, 1)));
        assert_eq!(graph.transfers().len(), 1);
        assert_eq!(graph.transfers()[0].producer, Some(node(1, 0)));
        assert_eq!(graph.order(), &[node(1, 0), node(1, 1), node(0, 1)]);
    }

    #[test]
    fn mutual_requirements_are_a_cycle() {
        let x = VarLabel::cell::<f64>("x");
        let y = VarLabel::cell::<f64>("y");
        let mut a = requires(&x, Generation::New, 0);
        a.computes(&y);
        let mut b = requires(&y, Generation::New, 0);
        b.computes(&x);

        let tasks = vec![task("a", vec![0], a), task("b", vec![0], b)];
        match TaskGraph::build(tasks, &two_ranks()) {
            Err(Error::DependencyCycle(stuck)) => assert_eq!(stuck, vec!["a@0", "b@0"]),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("graph should not build"),
        }
    }

    #[test]
    fn reading_what_a_task_itself_computes_is_a_cycle() {
        let mut own = computes(&rho());
        own.requires(&rho(), Generation::New, 0);
        let tasks = vec![task("own", vec![0], own)];
        assert!(matches!(TaskGraph::build(tasks, &two_ranks()), Err(Error::DependencyCycle(_))));
    }

    #[test]
    fn ghost_requirement_on_particles_is_rejected() {
        let x = VarLabel::particle::<f64>("x");
        let tasks = vec![task("c", vec![0], computes(&x)), task("r", vec![0], requires(&x, Generation::New, 1))];
        assert!(matches!(TaskGraph::build(tasks, &two_ranks()), Err(Error::InsufficientGhostData { .. })));
    }

    #[test]
    fn modify_chains_order_readers_between_writers() {
        let tasks = vec![
            task("c", vec![0], computes(&rho())),
            task("r1", vec![0], requires(&rho(), Generation::New, 0)),
            task("m", vec![0], modifies(&rho())),
            task("r2", vec![0], requires(&rho(), Generation::New, 0)),
        ];
        let graph = TaskGraph::build(tasks, &two_ranks()).unwrap();
        assert!(graph.contains_edge(node(0, 0), node(1, 0)));
        assert!(graph.contains_edge(node(0, 0), node(2, 0)));
        assert!(graph.contains_edge(node(1, 0), node(2, 0)));
        assert!(graph.contains_edge(node(2, 0), node(3, 0)));
        assert!(!graph.contains_edge(node(0, 0), node(3, 0)));
        assert_eq!(graph.order(), &[node(0, 0), node(1, 0), node(2, 0), node(3, 0)]);
    }

    #[test]
    fn old_generation_ghosts_need_transfers_but_no_edges() {
        let tasks = vec![task("r", vec![0, 1], requires(&rho(), Generation::Old, 2))];
        let graph = TaskGraph::build(tasks, &two_ranks()).unwrap();
        assert!(graph.edges().is_empty());
        assert_eq!(graph.transfers().len(), 2);
        assert!(graph.transfers().iter().all(|t| t.producer.is_none() && t.generation == Generation::Old));
        assert_eq!(graph.transfers()[0].region, range3d(4..6, 0..4, 0..4));
    }

    #[test]
    fn transfers_are_shared_by_readers_of_the_same_version() {
        let mut wide = requires(&rho(), Generation::New, 2);
        wide.requires(&rho(), Generation::Old, 0);
        let tasks = vec![
            task("c", vec![0, 1], computes(&rho())),
            task("narrow", vec![1], requires(&rho(), Generation::New, 1)),
            task("wide", vec![1], wide),
        ];
        let graph = TaskGraph::build(tasks, &two_ranks()).unwrap();
        assert_eq!(graph.transfers().len(), 1);
        assert_eq!(graph.transfers()[0].region, range3d(2..4, 0..4, 0..4));
        assert_eq!(graph.halo()["rho"], 2);
    }

    #[test]
    fn order_respects_every_edge() {
        let grid = Grid::decompose(&range3d(0..8, 0..8, 0..4), (2, 2, 1), 2);
        let energy = VarLabel::cell::<f64>("energy");
        let mut flux = requires(&rho(), Generation::New, 1);
        flux.computes(&energy);
        let mut update = modifies(&rho());
        update.requires(&energy, Generation::New, 1);

        let tasks = vec![
            task("late", vec![0, 1, 2, 3], requires(&energy, Generation::New, 1)),
            task("init", vec![3, 2, 1, 0], computes(&rho())),
            task("flux", vec![0, 1, 2, 3], flux),
            task("update", vec![0, 1, 2, 3], update),
            task("report", vec![0, 1, 2, 3], requires(&rho(), Generation::New, 1)),
        ];
        let graph = TaskGraph::build(tasks, &grid).unwrap();
        assert_eq!(graph.order().len(), graph.nodes().len());
        assert!(graph.predecessors(node(0, 0)).all(|p| p.task == 2));
        assert!(position(&graph, node(0, 3)) > position(&graph, node(2, 3)));

        for edge in graph.edges() {
            assert!(position(&graph, edge.from) < position(&graph, edge.to), "{:?} out of order", edge);
        }
        for transfer in graph.transfers() {
            assert_ne!(transfer.source_rank, transfer.dest_rank);
        }
    }
}
