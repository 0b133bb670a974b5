/// Position of a node inside a [`List`].
///
/// Ids stay valid until the node is removed. After that the slot may be
/// handed out again to a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Optional neighbour of a node.
pub(crate) type Link = Option<NodeId>;

pub(crate) struct Node<T> {
    /// Next node of the list
    pub next: Link,
    /// Previous node of the list
    pub prev: Link,
    /// Element of the node
    pub data: T,
}

/// Doubly linked list whose nodes live in a slot array and point at each
/// other by [`NodeId`] instead of by address.
///
/// Splicing is still O(1). Removed slots are recycled so the backing array
/// only grows up to the peak number of live nodes.
pub(crate) struct List<T> {
    slots: Vec<Option<Node<T>>>,
    vacant: Vec<usize>,
    head: Link,
    tail: Link,
    len: usize,
}

pub(crate) struct Iter<'a, T> {
    list: &'a List<T>,
    current: Link,
    remaining: usize,
}

impl<T> Node<T> {
    pub fn new(data: T) -> Self {
        Self { next: None, prev: None, data }
    }
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Link {
        self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.slots.get(id.0)?.as_ref()
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).map(|node| &node.data)
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots.get_mut(id.0)?.as_mut().map(|node| &mut node.data)
    }

    #[inline]
    pub fn next_of(&self, id: NodeId) -> Link {
        self.node(id)?.next
    }

    #[inline]
    pub fn prev_of(&self, id: NodeId) -> Link {
        self.node(id)?.prev
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    fn store(&mut self, node: Node<T>) -> NodeId {
        match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Appends a new node at the end of the list.
    pub fn append(&mut self, data: T) -> NodeId {
        let mut node = Node::new(data);
        node.prev = self.tail;

        let id = self.store(node);

        match self.tail.and_then(|tail| self.node_mut(tail)) {
            Some(tail) => tail.next = Some(id),
            None => self.head = Some(id),
        }

        self.tail = Some(id);
        self.len += 1;

        id
    }

    /// Inserts a new node right after `after`. Returns `None` (and drops
    /// nothing) when `after` is not a live node.
    pub fn insert_after(&mut self, after: NodeId, data: T) -> Option<NodeId> {
        let next = self.node(after)?.next;

        let mut node = Node::new(data);
        node.prev = Some(after);
        node.next = next;

        let id = self.store(node);

        if let Some(after) = self.node_mut(after) {
            after.next = Some(id);
        }

        match next.and_then(|next| self.node_mut(next)) {
            Some(next) => next.prev = Some(id),
            None => self.tail = Some(id),
        }

        self.len += 1;

        Some(id)
    }

    /// Unlinks `id` from the list and gives its element back.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let node = self.slots.get_mut(id.0)?.take()?;

        match node.prev.and_then(|prev| self.node_mut(prev)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }

        match node.next.and_then(|next| self.node_mut(next)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }

        self.vacant.push(id.0);
        self.len -= 1;

        Some(node.data)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            current: self.head,
            remaining: self.len,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let node = self.list.node(id)?;

        self.current = node.next;
        self.remaining = self.remaining.saturating_sub(1);

        Some((id, &node.data))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = (NodeId, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &List<u8>) -> Vec<u8> {
        list.iter().map(|(_, value)| *value).collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list: List<u8> = List::new();

        assert_eq!(list.len, 0);
        assert!(list.is_empty());
        assert!(list.iter().next().is_none());
        assert!(list.first().is_none());
        assert!(list.last().is_none());
    }

    #[test]
    fn append_links_both_ways() {
        let mut list = List::new();
        let a = list.append(1);
        let b = list.append(2);
        let c = list.append(3);

        assert_eq!(values(&list), vec![1, 2, 3]);
        assert_eq!(list.first(), Some(a));
        assert_eq!(list.last(), Some(c));
        assert_eq!(list.next_of(a), Some(b));
        assert_eq!(list.prev_of(c), Some(b));
        assert_eq!(list.prev_of(a), None);
        assert_eq!(list.next_of(c), None);
    }

    #[test]
    fn insert_after_middle_and_tail() {
        let mut list = List::new();
        let a = list.append(1);
        let c = list.append(3);

        let b = list.insert_after(a, 2).unwrap();
        let d = list.insert_after(c, 4).unwrap();

        assert_eq!(values(&list), vec![1, 2, 3, 4]);
        assert_eq!(list.prev_of(b), Some(a));
        assert_eq!(list.next_of(b), Some(c));
        assert_eq!(list.last(), Some(d));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut list = List::new();
        let a = list.append(1);
        let b = list.append(2);
        let c = list.append(3);
        let d = list.append(4);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(list.next_of(a), Some(c));
        assert_eq!(list.prev_of(c), Some(a));

        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.first(), Some(c));
        assert_eq!(list.prev_of(c), None);

        assert_eq!(list.remove(d), Some(4));
        assert_eq!(list.last(), Some(c));
        assert_eq!(list.next_of(c), None);

        assert_eq!(values(&list), vec![3]);
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert!(list.first().is_none());
        assert!(list.last().is_none());
    }

    #[test]
    fn removed_ids_are_rejected_then_recycled() {
        let mut list = List::new();
        let a = list.append(1);
        let _ = list.append(2);

        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(a), None);
        assert!(list.get(a).is_none());
        assert!(list.insert_after(a, 9).is_none());

        let reused = list.append(3);
        assert_eq!(reused, a);
        assert_eq!(values(&list), vec![2, 3]);
    }
}
