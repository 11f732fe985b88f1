//! Height-balanced binary search tree keyed by user key.
//!
//! Every node owns the version chain of its key, newest first. Subtrees are
//! owned (`Option<Box<Node>>`); rotations take a subtree by value and return
//! its new root.

use std::cmp::Ordering;

use codec::Entry;

type Link = Option<Box<Node>>;

#[derive(Debug)]
struct Node {
    key: String,
    /// Sorted by `ts` descending; at most one entry per `ts`.
    versions: Vec<Entry>,
    height: i32,
    left: Link,
    right: Link,
}

impl Node {
    fn new(entry: Entry) -> Self {
        Self {
            key: entry.key.clone(),
            versions: vec![entry],
            height: 1,
            left: None,
            right: None,
        }
    }

    /// Adds a version, replacing one with the same `ts`. Returns `true` if
    /// the chain grew.
    fn add_version(&mut self, entry: Entry) -> bool {
        match self.versions.binary_search_by(|v| entry.ts.cmp(&v.ts)) {
            Ok(i) => {
                self.versions[i] = entry;
                false
            }
            Err(i) => {
                self.versions.insert(i, entry);
                true
            }
        }
    }

    /// Newest version with `ts < snapshot`.
    fn visible(&self, snapshot: u64) -> Option<&Entry> {
        self.versions.iter().find(|v| v.ts < snapshot)
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance(&self) -> i32 {
        height(&self.left) - height(&self.right)
    }
}

fn height(link: &Link) -> i32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn rotate_right(mut node: Box<Node>) -> Box<Node> {
    let mut pivot = match node.left.take() {
        Some(p) => p,
        None => return node,
    };
    node.left = pivot.right.take();
    node.update_height();
    pivot.right = Some(node);
    pivot.update_height();
    pivot
}

fn rotate_left(mut node: Box<Node>) -> Box<Node> {
    let mut pivot = match node.right.take() {
        Some(p) => p,
        None => return node,
    };
    node.right = pivot.left.take();
    node.update_height();
    pivot.left = Some(node);
    pivot.update_height();
    pivot
}

fn rebalance(mut node: Box<Node>) -> Box<Node> {
    node.update_height();
    let balance = node.balance();
    if balance > 1 {
        // left-right case turns into left-left first
        if node.left.as_ref().map_or(0, |l| l.balance()) < 0 {
            node.left = node.left.take().map(rotate_left);
        }
        return rotate_right(node);
    }
    if balance < -1 {
        if node.right.as_ref().map_or(0, |r| r.balance()) > 0 {
            node.right = node.right.take().map(rotate_right);
        }
        return rotate_left(node);
    }
    node
}

fn insert(link: Link, entry: Entry, grew: &mut bool, new_key: &mut bool) -> Box<Node> {
    let mut node = match link {
        None => {
            *grew = true;
            *new_key = true;
            return Box::new(Node::new(entry));
        }
        Some(n) => n,
    };
    match entry.key.as_str().cmp(node.key.as_str()) {
        Ordering::Less => node.left = Some(insert(node.left.take(), entry, grew, new_key)),
        Ordering::Greater => node.right = Some(insert(node.right.take(), entry, grew, new_key)),
        Ordering::Equal => {
            *grew = node.add_version(entry);
            return node;
        }
    }
    rebalance(node)
}

/// AVL index over version chains.
#[derive(Debug, Default)]
pub struct AvlTree {
    root: Link,
    keys: usize,
    versions: usize,
}

impl AvlTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one version. A version with the same `(key, ts)` is replaced.
    pub fn insert(&mut self, entry: Entry) {
        let mut grew = false;
        let mut new_key = false;
        self.root = Some(insert(self.root.take(), entry, &mut grew, &mut new_key));
        if grew {
            self.versions += 1;
        }
        if new_key {
            self.keys += 1;
        }
    }

    /// The newest version of `key` with `ts < snapshot`, tombstones included.
    pub fn get(&self, key: &str, snapshot: u64) -> Option<&Entry> {
        let mut cur = self.root.as_deref();
        while let Some(node) = cur {
            match key.cmp(node.key.as_str()) {
                Ordering::Less => cur = node.left.as_deref(),
                Ordering::Greater => cur = node.right.as_deref(),
                Ordering::Equal => return node.visible(snapshot),
            }
        }
        None
    }

    /// Visible version of every key in `[start, end]`, in key order.
    pub fn range(&self, start: &str, end: &str, snapshot: u64) -> Vec<Entry> {
        let mut out = Vec::new();
        if start <= end {
            range_into(self.root.as_deref(), start, end, snapshot, &mut out);
        }
        out
    }

    /// Every version, key ascending and newest first within a key.
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.versions);
        let mut stack: Vec<&Node> = Vec::new();
        let mut cur = self.root.as_deref();
        while cur.is_some() || !stack.is_empty() {
            while let Some(node) = cur {
                stack.push(node);
                cur = node.left.as_deref();
            }
            if let Some(node) = stack.pop() {
                out.extend(node.versions.iter().cloned());
                cur = node.right.as_deref();
            }
        }
        out
    }

    /// Keys in preorder (node, left, right).
    pub fn preorder_keys(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.keys);
        let mut stack: Vec<&Node> = self.root.as_deref().into_iter().collect();
        while let Some(node) = stack.pop() {
            out.push(node.key.as_str());
            if let Some(r) = node.right.as_deref() {
                stack.push(r);
            }
            if let Some(l) = node.left.as_deref() {
                stack.push(l);
            }
        }
        out
    }

    pub fn height(&self) -> i32 {
        height(&self.root)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.keys
    }

    /// Number of stored versions across all keys.
    pub fn num_versions(&self) -> usize {
        self.versions
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

fn range_into(node: Option<&Node>, start: &str, end: &str, snapshot: u64, out: &mut Vec<Entry>) {
    let node = match node {
        Some(n) => n,
        None => return,
    };
    let key = node.key.as_str();
    if start < key {
        range_into(node.left.as_deref(), start, end, snapshot, out);
    }
    if start <= key && key <= end {
        if let Some(v) = node.visible(snapshot) {
            out.push(v.clone());
        }
    }
    if key < end {
        range_into(node.right.as_deref(), start, end, snapshot, out);
    }
}
