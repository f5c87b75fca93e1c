//! KD-tree over `FeaturePoint`s.
//!
//! Every node stores one point and splits on `depth % dimension`. Bulk builds
//! use median partitioning; incremental inserts descend from the root and
//! attach a new leaf, so heavy insertion degrades balance until the owner
//! rebuilds the tree.

use crate::index::point::FeaturePoint;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct KdNode {
    pub point: Arc<FeaturePoint>,
    pub split_dimension: usize,
    pub left: Option<Box<KdNode>>,
    pub right: Option<Box<KdNode>>,
}

impl KdNode {
    fn leaf(point: Arc<FeaturePoint>, split_dimension: usize) -> Self {
        Self {
            point,
            split_dimension,
            left: None,
            right: None,
        }
    }

    fn split_value(&self) -> f32 {
        self.point.vector()[self.split_dimension]
    }
}

#[derive(Debug, Clone, Default)]
pub struct KdTree {
    root: Option<Box<KdNode>>,
    dimension: usize,
    len: usize,
}

/// Heap entry ordered by distance, farthest on top.
struct Candidate {
    distance_sq: f32,
    point: Arc<FeaturePoint>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_sq
            .total_cmp(&other.distance_sq)
            .then_with(|| self.point.id().cmp(other.point.id()))
    }
}

impl KdTree {
    pub fn new(dimension: usize) -> Self {
        Self {
            root: None,
            dimension,
            len: 0,
        }
    }

    /// Bulk-loads `points` with recursive median splits.
    ///
    /// Callers guarantee every vector has length `dimension`.
    pub fn build(points: Vec<Arc<FeaturePoint>>, dimension: usize) -> Self {
        let len = points.len();
        let root = if dimension == 0 {
            None
        } else {
            build_node(points, 0, dimension)
        };
        Self {
            root,
            dimension,
            len,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Top-down insertion as a new leaf.
    pub fn insert(&mut self, point: Arc<FeaturePoint>) {
        debug_assert_eq!(point.vector().len(), self.dimension);
        let dimension = self.dimension;
        let mut depth = 0;
        let mut slot = &mut self.root;
        while let Some(node) = slot {
            slot = if point.vector()[node.split_dimension] < node.split_value() {
                &mut node.left
            } else {
                &mut node.right
            };
            depth += 1;
        }
        *slot = Some(Box::new(KdNode::leaf(point, depth % dimension)));
        self.len += 1;
    }

    /// The `k` closest points to `query` by Euclidean distance, nearest first.
    ///
    /// `visit` sees every point whose distance gets evaluated.
    pub fn nearest<F>(&self, query: &[f32], k: usize, mut visit: F) -> Vec<(Arc<FeaturePoint>, f32)>
    where
        F: FnMut(&Arc<FeaturePoint>),
    {
        if k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        if let Some(root) = &self.root {
            search(root, query, k, &mut heap, &mut visit);
        }
        heap.into_sorted_vec()
            .into_iter()
            .map(|c| (c.point, c.distance_sq.sqrt()))
            .collect()
    }

    pub fn height(&self) -> usize {
        height(self.root.as_deref())
    }

    /// True when no node's subtrees differ in height by more than `max_skew`.
    pub fn is_balanced(&self, max_skew: usize) -> bool {
        balanced_height(self.root.as_deref(), max_skew).is_some()
    }

    pub fn points(&self) -> Vec<Arc<FeaturePoint>> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack: Vec<&KdNode> = self.root.as_deref().into_iter().collect();
        while let Some(node) = stack.pop() {
            out.push(node.point.clone());
            stack.extend(node.left.as_deref());
            stack.extend(node.right.as_deref());
        }
        out
    }
}

fn build_node(mut points: Vec<Arc<FeaturePoint>>, depth: usize, dimension: usize) -> Option<Box<KdNode>> {
    if points.is_empty() {
        return None;
    }
    let axis = depth % dimension;
    let median = points.len() / 2;
    points.select_nth_unstable_by(median, |a, b| a.vector()[axis].total_cmp(&b.vector()[axis]));

    let right = points.split_off(median + 1);
    let point = points.pop()?;
    let left = points;

    Some(Box::new(KdNode {
        point,
        split_dimension: axis,
        left: build_node(left, depth + 1, dimension),
        right: build_node(right, depth + 1, dimension),
    }))
}

fn search<F>(node: &KdNode, query: &[f32], k: usize, heap: &mut BinaryHeap<Candidate>, visit: &mut F)
where
    F: FnMut(&Arc<FeaturePoint>),
{
    visit(&node.point);
    let distance_sq = squared_distance(query, node.point.vector());
    if heap.len() < k {
        heap.push(Candidate {
            distance_sq,
            point: node.point.clone(),
        });
    } else if heap.peek().is_some_and(|worst| distance_sq < worst.distance_sq) {
        heap.pop();
        heap.push(Candidate {
            distance_sq,
            point: node.point.clone(),
        });
    }

    let gap = query[node.split_dimension] - node.split_value();
    let (near, far) = if gap < 0.0 {
        (&node.left, &node.right)
    } else {
        (&node.right, &node.left)
    };

    if let Some(child) = near {
        search(child, query, k, heap, visit);
    }
    // Equal split values can sit on either side, hence <=
    let worth_crossing = heap.len() < k || heap.peek().is_some_and(|worst| gap * gap <= worst.distance_sq);
    if worth_crossing {
        if let Some(child) = far {
            search(child, query, k, heap, visit);
        }
    }
}

fn height(node: Option<&KdNode>) -> usize {
    match node {
        None => 0,
        Some(n) => 1 + height(n.left.as_deref()).max(height(n.right.as_deref())),
    }
}

fn balanced_height(node: Option<&KdNode>, max_skew: usize) -> Option<usize> {
    match node {
        None => Some(0),
        Some(n) => {
            let left = balanced_height(n.left.as_deref(), max_skew)?;
            let right = balanced_height(n.right.as_deref(), max_skew)?;
            (left.abs_diff(right) <= max_skew).then(|| 1 + left.max(right))
        }
    }
}

pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
