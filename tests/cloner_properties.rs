//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Property-based tests for tubeline cloning invariants

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use tube_pulse::{Fault, NextAction, Tube, TubeCloner, TubeRef};

/// Copies made during an episode, keyed by the original's node id.
type NodeLog = Arc<Mutex<Vec<(usize, Arc<Mutex<GraphTube>>)>>>;

/// Stage with up to two outgoing references, enough to express straight
/// chains, diamonds, and cycles.
struct GraphTube {
    id: usize,
    children: Vec<TubeRef<u32>>,
    copies: Arc<AtomicU32>,
    log: NodeLog,
}

impl Tube<u32> for GraphTube {
    fn process_request(&mut self, request: u32) -> NextAction<u32> {
        match self.children.first() {
            Some(next) => NextAction::invoke(Arc::clone(next), request),
            None => NextAction::return_with(request),
        }
    }

    fn process_response(&mut self, response: u32) -> NextAction<u32> {
        NextAction::return_with(response)
    }

    fn process_exception(&mut self, error: Fault) -> NextAction<u32> {
        NextAction::throw(error)
    }

    fn copy(&self, origin: &TubeRef<u32>, cloner: &mut TubeCloner<u32>) -> TubeRef<u32> {
        self.copies.fetch_add(1, Ordering::Relaxed);
        let concrete = Arc::new(Mutex::new(GraphTube {
            id: self.id,
            children: Vec::new(),
            copies: Arc::new(AtomicU32::new(0)),
            log: Arc::clone(&self.log),
        }));
        let copy: TubeRef<u32> = concrete.clone();
        cloner.add(origin, copy.clone());
        self.log.lock().push((self.id, Arc::clone(&concrete)));
        let children = self
            .children
            .iter()
            .map(|child| cloner.copy(child))
            .collect();
        concrete.lock().children = children;
        copy
    }
}

/// Allocation address of a tube reference, used as node identity.
fn address(tube: &TubeRef<u32>) -> usize {
    Arc::as_ptr(tube) as *const () as usize
}

fn concrete_address(node: &Arc<Mutex<GraphTube>>) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

/// Builds the tube graph described by the adjacency list; `edges[i]` holds
/// the child indices of node `i`. Node 0 is the entry tube.
fn build_graph(edges: &[Vec<usize>]) -> (Vec<Arc<Mutex<GraphTube>>>, NodeLog) {
    let log: NodeLog = Arc::default();
    let nodes: Vec<Arc<Mutex<GraphTube>>> = (0..edges.len())
        .map(|id| {
            Arc::new(Mutex::new(GraphTube {
                id,
                children: Vec::new(),
                copies: Arc::new(AtomicU32::new(0)),
                log: Arc::clone(&log),
            }))
        })
        .collect();
    for (id, children) in edges.iter().enumerate() {
        for &child in children {
            let child_ref: TubeRef<u32> = nodes[child].clone();
            nodes[id].lock().children.push(child_ref);
        }
    }
    (nodes, log)
}

/// Node ids reachable from the entry tube.
fn reachable(edges: &[Vec<usize>]) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([0usize]);
    while let Some(id) = queue.pop_front() {
        if seen.insert(id) {
            queue.extend(edges[id].iter().copied());
        }
    }
    seen
}

/// Adjacency lists of 1 to 12 nodes where every node has up to two child
/// references, cycles and sharing included.
fn graph_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..12).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(0..n, 0..=2usize), n)
    })
}

proptest! {
    #[test]
    fn prop_clone_is_isomorphic(edges in graph_strategy()) {
        let (nodes, log) = build_graph(&edges);
        let root: TubeRef<u32> = nodes[0].clone();

        let clone = TubeCloner::clone_tubeline(&root);

        let reachable_ids = reachable(&edges);
        let copies = log.lock();

        // Exactly one copy per reachable node, none for the rest.
        prop_assert_eq!(copies.len(), reachable_ids.len());
        let mut copy_of: HashMap<usize, Arc<Mutex<GraphTube>>> = HashMap::new();
        for (id, copy) in copies.iter() {
            prop_assert!(reachable_ids.contains(id));
            prop_assert!(copy_of.insert(*id, Arc::clone(copy)).is_none());
        }

        let original_ids: HashMap<usize, usize> = nodes
            .iter()
            .enumerate()
            .map(|(id, node)| (concrete_address(node), id))
            .collect();
        let copy_ids: HashMap<usize, usize> = copy_of
            .iter()
            .map(|(id, node)| (concrete_address(node), *id))
            .collect();

        // The clone's entry tube is the copy of node 0, and it is a fresh
        // allocation.
        prop_assert_eq!(copy_ids.get(&address(&clone)), Some(&0));
        prop_assert!(!original_ids.contains_key(&address(&clone)));

        for (id, copy) in &copy_of {
            // Structure equality: the copy's children are the copies of the
            // original's children, in order. A shared child resolves to one
            // shared copy because each id maps to exactly one logged copy.
            let original_children: Vec<usize> = nodes[*id]
                .lock()
                .children
                .iter()
                .map(|child| original_ids[&address(child)])
                .collect();
            let mut copied_children: Vec<usize> = Vec::new();
            let guard = copy.lock();
            for child in &guard.children {
                prop_assert!(!original_ids.contains_key(&address(child)));
                copied_children.push(copy_ids[&address(child)]);
            }
            drop(guard);
            prop_assert_eq!(original_children, copied_children);
        }

        // Copy counters: one per reachable original, untouched elsewhere
        // and on the copies themselves.
        for (id, node) in nodes.iter().enumerate() {
            let expected = u32::from(reachable_ids.contains(&id));
            prop_assert_eq!(node.lock().copies.load(Ordering::Relaxed), expected);
        }
        for copy in copy_of.values() {
            prop_assert_eq!(copy.lock().copies.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn prop_second_clone_is_independent(edges in graph_strategy()) {
        let (nodes, log) = build_graph(&edges);
        let root: TubeRef<u32> = nodes[0].clone();

        let first = TubeCloner::clone_tubeline(&root);
        let second = TubeCloner::clone_tubeline(&root);

        // Each episode copies the reachable set once more and never reuses
        // the other episode's copies.
        let reachable_count = reachable(&edges).len();
        prop_assert_eq!(log.lock().len(), 2 * reachable_count);
        prop_assert!(!Arc::ptr_eq(&first, &second));
        for node in nodes.iter() {
            let copies = node.lock().copies.load(Ordering::Relaxed);
            prop_assert!(copies == 0 || copies == 2);
        }
    }
}
