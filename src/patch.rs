use serde::{Deserialize, Serialize};

use crate::index_space::{range3d, IndexSpace};
use crate::variable::Staggering;

/// Position of a patch within its [`Grid`].
pub type PatchId = usize;

/// Index of a process within the communicator.
pub type Rank = usize;




/**
 * A neighboring patch, together with the cells of the neighbor which touch
 * this patch (its face, edge or corner slab, one cell deep).
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: PatchId,
    pub contact: IndexSpace,
}




/**
 * A patch is an axis-aligned box of cells in the global index space, owned
 * by exactly one process. Patches are immutable; they are created when the
 * domain is decomposed and thrown away on regridding.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    id: PatchId,
    space: IndexSpace,
    owner: Rank,
    neighbors: Vec<Neighbor>,
}




// ============================================================================
impl Patch {

    pub fn id(&self) -> PatchId {
        self.id
    }

    /**
     * Return the cells covered by this patch.
     */
    pub fn index_space(&self) -> &IndexSpace {
        &self.space
    }

    pub fn owner(&self) -> Rank {
        self.owner
    }

    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    /**
     * Return the region of `source`'s data for a variable with the given
     * staggering, which lands in this patch's ghost layer of width `ghost`.
     * Elements this patch already owns (shared faces or nodes of staggered
     * variables) are excluded. Returns `None` if the patches are not within
     * `ghost` cells of one another.
     */
    pub fn ghost_region(&self, source: &Patch, staggering: Staggering, ghost: i64) -> Option<IndexSpace> {
        let own = staggering.logical_space(&self.space)?;
        let theirs = staggering.logical_space(&source.space)?;
        let candidate = theirs.intersect(&own.extend_all(ghost))?;
        let axis = self.space.separating_axis(&source.space)?;
        candidate.exclude_along(&own, axis)
    }
}




/**
 * The set of patches decomposing the simulation domain, indexed by
 * `PatchId`.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Grid {
    patches: Vec<Patch>,
}




// ============================================================================
impl Grid {

    /**
     * Create a grid from a list of cell boxes and their owning ranks. Patch
     * ids are assigned in order. Neighbor relationships are discovered here:
     * two patches are neighbors if either one, extended by a single cell,
     * touches the other.
     */
    pub fn new(boxes: Vec<(IndexSpace, Rank)>) -> Self {
        let mut patches: Vec<Patch> = boxes
            .into_iter()
            .enumerate()
            .map(|(id, (space, owner))| Patch { id, space, owner, neighbors: Vec::new() })
            .collect();

        for a in 0..patches.len() {
            let extended = patches[a].space.extend_all(1);
            let neighbors = patches
                .iter()
                .filter(|b| b.id != a)
                .filter_map(|b| extended.intersect(&b.space).map(|contact| Neighbor { id: b.id, contact }))
                .collect();
            patches[a].neighbors = neighbors;
        }
        Self { patches }
    }

    /**
     * Split `domain` into `blocks.0 x blocks.1 x blocks.2` patches of nearly
     * equal size, handing out contiguous runs of patches to `num_ranks`
     * processes.
     */
    pub fn decompose(domain: &IndexSpace, blocks: (usize, usize, usize), num_ranks: usize) -> Self {
        let split = |range: &core::ops::Range<i64>, n: usize| -> Vec<core::ops::Range<i64>> {
            let len = range.end - range.start;
            (0..n as i64)
                .map(|b| range.start + b * len / n as i64..range.start + (b + 1) * len / n as i64)
                .collect()
        };
        let (di, dj, dk) = domain.clone().into();
        let si = split(&di, blocks.0);
        let sj = split(&dj, blocks.1);
        let sk = split(&dk, blocks.2);
        let num_patches = blocks.0 * blocks.1 * blocks.2;

        let mut boxes = Vec::with_capacity(num_patches);

        for k in &sk {
            for j in &sj {
                for i in &si {
                    let owner = boxes.len() * num_ranks.max(1) / num_patches.max(1);
                    boxes.push((range3d(i.clone(), j.clone(), k.clone()), owner));
                }
            }
        }
        Self::new(boxes)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.patches.get(id)
    }

    pub fn patches(&self) -> impl Iterator<Item = &Patch> {
        self.patches.iter()
    }

    /**
     * Return the patches owned by the given process.
     */
    pub fn owned_by(&self, rank: Rank) -> impl Iterator<Item = &Patch> {
        self.patches.iter().filter(move |p| p.owner == rank)
    }

    /**
     * Return the ids of the patches whose cells lie within `ghost` cells of
     * the given patch (excluding the patch itself). For a ghost width of one
     * this is the precomputed neighbor list.
     */
    pub fn neighbors_within(&self, id: PatchId, ghost: i64) -> Vec<PatchId> {
        let patch = match self.get(id) {
            Some(patch) => patch,
            None => return Vec::new(),
        };
        if ghost <= 0 {
            Vec::new()
        } else if ghost == 1 {
            patch.neighbors.iter().map(|n| n.id).collect()
        } else {
            let extended = patch.space.extend_all(ghost);
            self.patches
                .iter()
                .filter(|q| q.id != id && extended.intersect(&q.space).is_some())
                .map(|q| q.id)
                .collect()
        }
    }
}


impl core::ops::Index<PatchId> for Grid {
    type Output = Patch;

    fn index(&self, id: PatchId) -> &Patch {
        &self.patches[id]
    }
}
