//! Index-based intrusive doubly-linked list for O(1) membership changes.
//!
//! Nodes live in a [`Slab`] and carry their own [`Links`]. A list stores only
//! the head index, so a node can be unlinked in O(1) without searching and
//! moved between lists without reallocating. Indices replace pointers, which
//! keeps ownership in the slab and avoids cyclic pointer graphs.

/// Per-node link fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

impl Links {
    /// Returns `true` if the node is linked into a list.
    #[cfg(test)]
    pub const fn is_linked(&self) -> bool {
        self.linked
    }

    /// Index of the following node.
    pub const fn next(&self) -> Option<usize> {
        self.next
    }
}

/// A value that can be linked into an [`IntrusiveList`].
pub trait Linked {
    /// Shared access to the link fields.
    fn links(&self) -> &Links;

    /// Exclusive access to the link fields.
    fn links_mut(&mut self) -> &mut Links;
}

/// Stable-index storage for list nodes.
///
/// Vacant slots are reused, so an index is only meaningful while the value it
/// was returned for is still present.
#[derive(Debug)]
pub struct Slab<T> {
    entries: Vec<Option<T>>,
    vacant: Vec<usize>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    /// Creates an empty slab.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    /// Number of occupied slots.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slot is occupied.
    #[cfg(test)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns its index.
    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        if let Some(idx) = self.vacant.pop() {
            self.entries[idx] = Some(value);
            idx
        } else {
            self.entries.push(Some(value));
            self.entries.len() - 1
        }
    }

    /// Removes and returns the value at `idx`.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.entries.get_mut(idx)?.take()?;
        self.vacant.push(idx);
        self.len -= 1;
        Some(value)
    }

    /// Shared access to the value at `idx`.
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx)?.as_ref()
    }

    /// Exclusive access to the value at `idx`.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.entries.get_mut(idx)?.as_mut()
    }

    /// Iterates over occupied slots.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| entry.as_ref().map(|value| (idx, value)))
    }

    /// Removes every value.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.vacant.clear();
        self.len = 0;
        self.entries.drain(..).flatten()
    }
}

/// An index-based intrusive doubly-linked list.
///
/// The list does not own its nodes; every operation takes the slab that
/// does. A node may be linked into at most one list at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntrusiveList {
    head: Option<usize>,
    len: usize,
}

impl IntrusiveList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of nodes in the list.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    #[cfg(test)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the head of the list without removing it.
    pub const fn head(&self) -> Option<usize> {
        self.head
    }

    /// Links the node at `idx` in front of the current head.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the node is missing or already linked.
    pub fn push_front<T: Linked>(&mut self, slab: &mut Slab<T>, idx: usize) {
        let old_head = self.head;
        if let Some(node) = slab.get_mut(idx) {
            let links = node.links_mut();
            debug_assert!(!links.linked, "node {idx} is already linked");
            *links = Links {
                prev: None,
                next: old_head,
                linked: true,
            };
        } else {
            debug_assert!(false, "node {idx} is not in the slab");
            return;
        }

        if let Some(h) = old_head.and_then(|h| slab.get_mut(h)) {
            h.links_mut().prev = Some(idx);
        }
        self.head = Some(idx);
        self.len += 1;
    }

    /// Unlinks the node at `idx`. Does nothing if it is not linked.
    pub fn remove<T: Linked>(&mut self, slab: &mut Slab<T>, idx: usize) {
        let Some(node) = slab.get_mut(idx) else {
            return;
        };
        let links = *node.links();
        if !links.linked {
            return;
        }
        *node.links_mut() = Links::default();

        match links.prev.and_then(|p| slab.get_mut(p)) {
            Some(prev) => prev.links_mut().next = links.next,
            None => self.head = links.next,
        }
        if let Some(next) = links.next.and_then(|n| slab.get_mut(n)) {
            next.links_mut().prev = links.prev;
        }
        self.len -= 1;
    }

    /// Collects the indices of the list in order.
    pub fn indices<T: Linked>(&self, slab: &Slab<T>) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            out.push(idx);
            cursor = slab.get(idx).and_then(|n| n.links().next);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Node {
        value: i32,
        links: Links,
    }

    impl Node {
        fn new(value: i32) -> Self {
            Self {
                value,
                links: Links::default(),
            }
        }
    }

    impl Linked for Node {
        fn links(&self) -> &Links {
            &self.links
        }

        fn links_mut(&mut self) -> &mut Links {
            &mut self.links
        }
    }

    fn values(list: &IntrusiveList, slab: &Slab<Node>) -> Vec<i32> {
        list.indices(slab)
            .into_iter()
            .map(|i| slab.get(i).unwrap().value)
            .collect()
    }

    #[test]
    fn test_empty_list() {
        let list = IntrusiveList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert_eq!(list.head(), None);
    }

    #[test]
    fn test_push_and_unlink_head() {
        let mut slab = Slab::new();
        let mut list = IntrusiveList::new();
        for v in 1..=3 {
            let idx = slab.insert(Node::new(v));
            list.push_front(&mut slab, idx);
        }
        assert_eq!(values(&list, &slab), vec![3, 2, 1]);

        let popped = list.head().unwrap();
        list.remove(&mut slab, popped);
        assert_eq!(slab.get(popped).unwrap().value, 3);
        assert!(!slab.get(popped).unwrap().links.is_linked());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut slab = Slab::new();
        let mut list = IntrusiveList::new();
        let ids: Vec<_> = (1..=4).map(|v| slab.insert(Node::new(v))).collect();
        for &id in &ids {
            list.push_front(&mut slab, id);
        }

        list.remove(&mut slab, ids[1]);
        assert_eq!(values(&list, &slab), vec![4, 3, 1]);
        list.remove(&mut slab, ids[3]);
        assert_eq!(values(&list, &slab), vec![3, 1]);
        list.remove(&mut slab, ids[0]);
        assert_eq!(values(&list, &slab), vec![3]);
        assert_eq!(list.len(), 1);

        // Removing an unlinked node is a no-op.
        list.remove(&mut slab, ids[0]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_move_between_lists() {
        let mut slab = Slab::new();
        let mut a = IntrusiveList::new();
        let mut b = IntrusiveList::new();
        let x = slab.insert(Node::new(7));
        a.push_front(&mut slab, x);
        a.remove(&mut slab, x);
        b.push_front(&mut slab, x);
        assert!(a.is_empty());
        assert_eq!(values(&b, &slab), vec![7]);
    }

    #[test]
    fn test_slab_reuses_vacant_slots() {
        let mut slab: Slab<Node> = Slab::new();
        let a = slab.insert(Node::new(1));
        let b = slab.insert(Node::new(2));
        assert_eq!(slab.remove(a).unwrap().value, 1);
        assert!(slab.remove(a).is_none());
        let c = slab.insert(Node::new(3));
        assert_eq!(c, a);
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get(b).unwrap().value, 2);
        assert_eq!(slab.drain().count(), 2);
        assert!(slab.is_empty());
    }
}
