use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};




/**
 * A minimal directed graph structure that stores only edges. Vertices are
 * ordered, so iteration and the topological order are deterministic.
 */
#[derive(Clone, Debug)]
pub struct AdjacencyList<K> {
    outgoing: BTreeMap<K, BTreeSet<K>>,
    incoming: BTreeMap<K, BTreeSet<K>>,
}




// ============================================================================
impl<K> AdjacencyList<K> where K: Ord + Clone {


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Return the number of edges in the graph.
     */
    pub fn len(&self) -> usize {
        self.incoming.values().map(BTreeSet::len).sum()
    }


    /**
     * Determine whether there are any edges in the graph.
     */
    pub fn is_empty(&self) -> bool {
        self.incoming.values().all(BTreeSet::is_empty)
    }


    /**
     * Insert an edge from a -> b. Inserting an edge twice has no effect.
     * Returns true if the edge was not already present.
     */
    pub fn insert(&mut self, a: K, b: K) -> bool {
        self.incoming.entry(b.clone()).or_default().insert(a.clone());
        self.outgoing.entry(a).or_default().insert(b)
    }


    /**
     * Determine whether the given edge exists.
     */
    pub fn contains(&self, a: &K, b: &K) -> bool {
        self.outgoing.get(a).map_or(false, |edges| edges.contains(b))
    }


    /**
     * Return an iterator over the vertices with edges emanating from the given
     * vertex.
     */
    pub fn outgoing_edges(&self, a: &K) -> impl Iterator<Item = &K> {
        self.outgoing.get(a).into_iter().flat_map(|edges| edges.iter())
    }


    /**
     * Return an iterator over the vertices with edges pointing to the given
     * vertex.
     */
    pub fn incoming_edges(&self, b: &K) -> impl Iterator<Item = &K> {
        self.incoming.get(b).into_iter().flat_map(|edges| edges.iter())
    }


    /**
     * Order the given vertices so that every edge points forward (Kahn's
     * algorithm). Among the vertices that are ready at any point, the least
     * one is taken first. Edges touching vertices outside `vertices` are
     * ignored. On failure, the vertices which lie on or behind a cycle are
     * returned instead.
     */
    pub fn topological_order<'a, I>(&self, vertices: I) -> Result<Vec<K>, Vec<K>>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let vertices: BTreeSet<K> = vertices.into_iter().cloned().collect();
        let mut degree: BTreeMap<&K, usize> = vertices
            .iter()
            .map(|v| (v, self.incoming_edges(v).filter(|u| vertices.contains(u)).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<&K>> = degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&v, _)| Reverse(v))
            .collect();

        let mut order = Vec::with_capacity(vertices.len());

        while let Some(Reverse(v)) = ready.pop() {
            order.push(v.clone());

            for w in self.outgoing_edges(v) {
                if let Some(d) = degree.get_mut(w) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(w))
                    }
                }
            }
        }

        if order.len() == vertices.len() {
            Ok(order)
        } else {
            Err(degree.into_iter().filter(|(_, d)| *d > 0).map(|(v, _)| v.clone()).collect())
        }
    }
}

impl<K> Default for AdjacencyList<K> {
    fn default() -> Self {
        Self {
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::AdjacencyList;


    #[test]
    fn edges_are_directed_and_stored_once() {
        let mut edges = AdjacencyList::new();
        assert!(edges.insert((0, 1), (1, 1)));
        assert!(!edges.insert((0, 1), (1, 1)));
        assert!(edges.contains(&(0, 1), &(1, 1)));
        assert!(!edges.contains(&(1, 1), &(0, 1)));
        assert_eq!(edges.len(), 1);
    }


    #[test]
    fn a_producer_fans_out_to_its_neighbors() {
        let mut edges = AdjacencyList::new();
        for patch in 0..3 {
            edges.insert((0, 1), (1, patch));
        }
        edges.insert((0, 0), (1, 0));

        assert_eq!(edges.outgoing_edges(&(0, 1)).cloned().collect::<Vec<_>>(), vec![(1, 0), (1, 1), (1, 2)]);
        assert_eq!(edges.incoming_edges(&(1, 0)).cloned().collect::<Vec<_>>(), vec![(0, 0), (0, 1)]);
        assert_eq!(edges.incoming_edges(&(0, 0)).count(), 0);
        assert!(!edges.is_empty());
    }


    #[test]
    fn topological_order_prefers_the_least_ready_vertex() {
        let mut edges = AdjacencyList::new();
        edges.insert(3, 0);
        edges.insert(2, 1);
        assert_eq!(edges.topological_order(&[0, 1, 2, 3, 4]), Ok(vec![2, 1, 3, 0, 4]));
    }


    #[test]
    fn topological_order_reports_cycles() {
        let mut edges = AdjacencyList::new();
        edges.insert(0, 1);
        edges.insert(1, 2);
        edges.insert(2, 1);
        edges.insert(2, 3);
        assert_eq!(edges.topological_order(&[0, 1, 2, 3]), Err(vec![1, 2, 3]));
    }


    #[test]
    fn edges_to_excluded_vertices_are_ignored() {
        let mut edges = AdjacencyList::new();
        edges.insert(5, 0);
        edges.insert(0, 1);
        assert_eq!(edges.topological_order(&[1, 0]), Ok(vec![0, 1]));
    }
}
