use core::ops::Range;
use serde::{Deserialize, Serialize};




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    I,
    J,
    K,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::I, Axis::J, Axis::K];
}




#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]


/**
 * Represents a rectangular region in a discrete 3D index space. The index
 * type is signed 64-bit integer, and ranges are half-open. The `I` axis is
 * the fastest-varying one in any memory buffer laid out over the space.
 */
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
    dk: Range<i64>,
}




// ============================================================================
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end && dk.start <= dk.end,
            "index space has negative volume");

        Self { di, dj, dk }
    }


    /**
     * Build an index space from its six corner values: the inclusive lower
     * corner followed by the exclusive upper corner.
     */
    pub fn from_corners(corners: [i64; 6]) -> Self {
        let [i0, j0, k0, i1, j1, k1] = corners;
        Self::new(i0..i1, j0..j1, k0..k1)
    }


    /**
     * Return the six corner values, lower corner first.
     */
    pub fn corners(&self) -> [i64; 6] {
        [self.di.start, self.dj.start, self.dk.start, self.di.end, self.dj.end, self.dk.end]
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize,
         (self.dk.end - self.dk.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m, n) = self.dim();
        l * m * n
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> (i64, i64, i64) {
        (self.di.start, self.dj.start, self.dk.start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> (i64, i64, i64) {
        (self.di.end, self.dj.end, self.dk.end)
    }


    /**
     * Return the range covered on the given axis.
     */
    pub fn range(&self, axis: Axis) -> &Range<i64> {
        match axis {
            Axis::I => &self.di,
            Axis::J => &self.dj,
            Axis::K => &self.dk,
        }
    }


    fn with_range(&self, axis: Axis, range: Range<i64>) -> Self {
        let mut result = self.clone();
        match axis {
            Axis::I => result.di = range,
            Axis::J => result.dj = range,
            Axis::K => result.dk = range,
        }
        result
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: (i64, i64, i64)) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1) && self.dk.contains(&index.2)
    }


    /**
     * Determine whether another index space is a subset of this one.
     */
    pub fn contains_space(&self, other: &Self) -> bool {
        other.di.start >= self.di.start && other.di.end <= self.di.end &&
        other.dj.start >= self.dj.start && other.dj.end <= self.dj.end &&
        other.dk.start >= self.dk.start && other.dk.end <= self.dk.end
    }


    /**
     * Return the overlap of two index spaces, or `None` if they share no
     * elements.
     */
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let overlap = |a: &Range<i64>, b: &Range<i64>| a.start.max(b.start)..a.end.min(b.end);
        let di = overlap(&self.di, &other.di);
        let dj = overlap(&self.dj, &other.dj);
        let dk = overlap(&self.dk, &other.dk);

        if di.start < di.end && dj.start < dj.end && dk.start < dk.end {
            Some(Self { di, dj, dk })
        } else {
            None
        }
    }


    /**
     * Return the first axis along which the two spaces do not overlap, if
     * there is one.
     */
    pub fn separating_axis(&self, other: &Self) -> Option<Axis> {
        Axis::ALL.iter().copied().find(|&axis| {
            let a = self.range(axis);
            let b = other.range(axis);
            a.end <= b.start || b.end <= a.start
        })
    }


    /**
     * Remove from this space the slab which lies within `other`'s range on
     * the given axis. This space must lie entirely on one side of that
     * range, or straddle only one of its ends.
     */
    pub fn exclude_along(&self, other: &Self, axis: Axis) -> Option<Self> {
        let a = self.range(axis).clone();
        let b = other.range(axis);

        let range = if a.start >= b.start {
            a.start.max(b.end)..a.end
        } else {
            a.start..a.end.min(b.start)
        };

        if range.start < range.end {
            Some(self.with_range(axis, range))
        } else {
            None
        }
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        Self::new(
            self.di.start - delta .. self.di.end + delta,
            self.dj.start - delta .. self.dj.end + delta,
            self.dk.start - delta .. self.dk.end + delta)
    }


    /**
     * Trim this index space by the given number of elements on each axis.
     */
    pub fn trim_all(&self, delta: i64) -> Self {
        self.extend_all(-delta)
    }


    /**
     * Extend just the upper elements of this index space by a certain amount
     * on the given axis.
     */
    pub fn extend_upper(&self, delta: i64, axis: Axis) -> Self {
        let r = self.range(axis);
        self.with_range(axis, r.start..r.end + delta)
    }


    /**
     * Return the linear offset for the given index, in a memory buffer
     * aligned with the start of this index space, with the `I` index
     * increasing fastest.
     */
    pub fn linear_offset(&self, index: (i64, i64, i64)) -> usize {
        let (l, m, _) = self.dim();
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let k = (index.2 - self.dk.start) as usize;
        (k * m + j) * l + i
    }


    /**
     * Return a memory region object corresponding to the selection of this
     * index space in the buffer allocated for another one. Returns `None` if
     * the parent does not contain this space.
     */
    pub fn memory_region_in(&self, parent: &Self) -> Option<MemoryRegion> {
        if !parent.contains_space(self) {
            return None
        }
        let start = (
            (self.di.start - parent.di.start) as usize,
            (self.dj.start - parent.dj.start) as usize,
            (self.dk.start - parent.dk.start) as usize);
        let count = self.dim();
        let shape = parent.dim();
        Some(MemoryRegion { start, count, shape })
    }


    /**
     * Return an iterator which traverses the index space with the `K` index
     * slowest and the `I` index fastest, matching the memory order.
     */
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, i64)> + '_ {
        self.dk.clone().flat_map(move |k| {
            self.dj.clone().flat_map(move |j| self.di.clone().map(move |i| (i, j, k)))
        })
    }
}




// ============================================================================
impl From<(Range<i64>, Range<i64>, Range<i64>)> for IndexSpace {
    fn from(range: (Range<i64>, Range<i64>, Range<i64>)) -> Self {
        Self::new(range.0, range.1, range.2)
    }
}

impl From<IndexSpace> for (Range<i64>, Range<i64>, Range<i64>) {
    fn from(space: IndexSpace) -> Self {
        (space.di, space.dj, space.dk)
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range3d(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj, dk)
}




/**
 * A 3D memory region within a contiguous buffer, in units of elements. The
 * tuples are ordered `(i, j, k)`, and `i` is contiguous in memory.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: (usize, usize, usize),
    pub count: (usize, usize, usize),
    pub shape: (usize, usize, usize),
}




// ============================================================================
impl MemoryRegion {

    /**
     * Return the number of selected elements.
     */
    pub fn len(&self) -> usize {
        self.count.0 * self.count.1 * self.count.2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
     * Return the strides, in elements, of the `i`, `j` and `k` axes.
     */
    pub fn strides(&self) -> (usize, usize, usize) {
        (1, self.shape.0, self.shape.0 * self.shape.1)
    }

    /**
     * Return the offset, in elements, of the first selected element.
     */
    pub fn offset(&self) -> usize {
        let (si, sj, sk) = self.strides();
        self.start.0 * si + self.start.1 * sj + self.start.2 * sk
    }
}
