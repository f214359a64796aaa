//! Persistent (immutable) ordered map based on a red-black tree with
//! double-black deletion.
//!
//! This module provides [`PersistentOrderedMap`], an immutable key-ordered
//! map that uses structural sharing for efficient operations.
//!
//! # Overview
//!
//! `PersistentOrderedMap` is a persistent red-black tree. Deletion follows
//! Matt Might's reformulation: instead of the classical fix-up cases, the
//! "missing blackness" left by a deleted black node is carried as a
//! transient **double-black** color (on a node or on a dedicated empty
//! sentinel) and *bubbled* toward the root. Bubbling through a red sibling
//! temporarily produces a **negative-black** node, which the balancing
//! rewrites resolve with a bounded number of local reconstructions. Both
//! transient colors exist only inside a single `insert`/`remove` call; a
//! returned tree contains only red and black nodes.
//!
//! Every node carries the size of its subtree, which makes rank queries
//! (`count_less`/`count_greater` on a cursor) O(log n).
//!
//! - O(log n) `get`, `insert`, `remove`
//! - O(log n) `min`/`max`, `min_after`/`max_before`
//! - O(1) `len` and `is_empty`
//! - O(log n) cursor steps, amortized O(1) over a full traversal
//!
//! # Examples
//!
//! ```rust
//! use perdure::persistent::PersistentOrderedMap;
//!
//! let map = PersistentOrderedMap::new()
//!     .insert(3, "three")
//!     .insert(1, "one")
//!     .insert(2, "two");
//!
//! // Entries are always in key order
//! let keys: Vec<&i32> = map.keys().collect();
//! assert_eq!(keys, vec![&1, &2, &3]);
//!
//! // Structural sharing: the original map is preserved
//! let smaller = map.remove(&2);
//! assert_eq!(map.len(), 3);
//! assert_eq!(smaller.len(), 2);
//! ```
//!
//! # Internal Structure
//!
//! A tree returned to the caller maintains the invariants:
//! 1. The root is black
//! 2. Red nodes have only black children
//! 3. Every path from the root to an empty subtree crosses the same number
//!    of black nodes
//! 4. No node carries a transient color (negative-black or double-black)
//! 5. Every node's size annotation is 1 + size(left) + size(right)
//! 6. In-order traversal yields strictly ascending keys
//!
//! # References
//!
//! - Matt Might, "Red-black trees with a double-black sentinel: deletion in
//!   a functional setting"
//! - Okasaki, "Red-black trees in a functional setting" (1999), for the
//!   insertion rewrites

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;

use super::{PersistentStack, ReferenceCounter};

// =============================================================================
// Color Definition
// =============================================================================

/// The color of a tree node.
///
/// The variants are ordered by "blackness": `NegativeBlack < Red < Black <
/// DoubleBlack`. The two outer colors are transient: they appear only
/// within a single top-level `insert` or `remove` call and never persist in
/// a returned tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Color {
    NegativeBlack,
    Red,
    Black,
    DoubleBlack,
}

impl Color {
    /// One unit more black. Applied by `bubble` to the parent absorbing a
    /// double-black child. Never called on `DoubleBlack`.
    const fn darker(self) -> Self {
        match self {
            Self::NegativeBlack => Self::Red,
            Self::Red => Self::Black,
            Self::Black | Self::DoubleBlack => Self::DoubleBlack,
        }
    }

    /// One unit less black. Applied by `redden` and by the balancing
    /// rewrites. Never called on `NegativeBlack`.
    const fn lighter(self) -> Self {
        match self {
            Self::DoubleBlack => Self::Black,
            Self::Black => Self::Red,
            Self::Red | Self::NegativeBlack => Self::NegativeBlack,
        }
    }
}

// =============================================================================
// Tree Definition
// =============================================================================

/// Internal node structure for the red-black tree.
struct Node<K, V> {
    color: Color,
    /// Number of live entries in this subtree, including this node.
    size: usize,
    left: Tree<K, V>,
    right: Tree<K, V>,
    key: K,
    value: V,
}

/// A subtree: empty, the transient double-black empty sentinel, or a shared
/// node.
///
/// The sentinel variant carries the blackness debt of a deleted black leaf
/// upward during `remove`; it is consumed by `bubble`/`redden` within the
/// same call and never appears in a returned tree.
enum Tree<K, V> {
    Empty,
    DoubleBlackEmpty,
    Node(ReferenceCounter<Node<K, V>>),
}

impl<K, V> Clone for Tree<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::DoubleBlackEmpty => Self::DoubleBlackEmpty,
            Self::Node(node) => Self::Node(node.clone()),
        }
    }
}

impl<K, V> Tree<K, V> {
    /// Number of live entries in this subtree.
    fn size(&self) -> usize {
        match self {
            Self::Node(node) => node.size,
            Self::Empty | Self::DoubleBlackEmpty => 0,
        }
    }

    /// Effective color: empty subtrees are black leaves, the sentinel is
    /// double-black.
    fn color(&self) -> Color {
        match self {
            Self::Empty => Color::Black,
            Self::DoubleBlackEmpty => Color::DoubleBlack,
            Self::Node(node) => node.color,
        }
    }

    const fn as_arc(&self) -> Option<&ReferenceCounter<Node<K, V>>> {
        match self {
            Self::Node(node) => Some(node),
            Self::Empty | Self::DoubleBlackEmpty => None,
        }
    }

    fn as_node(&self) -> Option<&Node<K, V>> {
        self.as_arc().map(AsRef::as_ref)
    }

    const fn is_empty(&self) -> bool {
        self.as_arc().is_none()
    }

    /// Constructs a node, recomputing the size annotation from its
    /// children.
    fn node(color: Color, left: Self, right: Self, key: K, value: V) -> Self {
        let size = 1 + left.size() + right.size();
        Self::Node(ReferenceCounter::new(Node {
            color,
            size,
            left,
            right,
            key,
            value,
        }))
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    /// Creates a copy of this node with a new color; everything else,
    /// including the size annotation, is shared or reused.
    fn recolored(&self, color: Color) -> Tree<K, V> {
        Tree::Node(ReferenceCounter::new(Self {
            color,
            size: self.size,
            left: self.left.clone(),
            right: self.right.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
        }))
    }
}

impl<K: Clone, V: Clone> Tree<K, V> {
    /// Forces the root of a finished `insert`/`remove` to black.
    fn blacken(self) -> Self {
        match self {
            Self::Node(node) if node.color != Color::Black => node.recolored(Color::Black),
            other => other,
        }
    }

    /// One unit less black. The double-black empty sentinel reddens to the
    /// ordinary empty tree.
    ///
    /// `bubble` only reddens the children of a node with a double-black
    /// child, and the sibling of a double-black subtree is never empty, so
    /// the `Empty` arm is never taken in practice.
    fn redden(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::DoubleBlackEmpty => Self::Empty,
            Self::Node(node) => node.recolored(node.color.lighter()),
        }
    }

    /// Resolves an imbalance introduced in the left subtree.
    ///
    /// Fires only when the receiver is black-or-heavier. The red-red cases
    /// are Okasaki's insertion rewrites, generalized to also lighten a
    /// double-black receiver by one unit; the negative-black case can only
    /// be reached during deletion, after `bubble` reddened a red sibling.
    /// All other shapes are returned unchanged.
    fn balance_left(self) -> Self {
        let rewritten = self.balance_left_rewrite();
        rewritten.unwrap_or(self)
    }

    fn balance_left_rewrite(&self) -> Option<Self> {
        let node = self.as_node()?;
        if node.color < Color::Black {
            return None;
        }
        let left = node.left.as_node()?;

        if left.color == Color::Red {
            // Red child with a red outer grandchild: rotate right.
            if let Self::Node(outer) = &left.left
                && outer.color == Color::Red
            {
                return Some(Self::node(
                    node.color.lighter(),
                    outer.recolored(Color::Black),
                    Self::node(
                        Color::Black,
                        left.right.clone(),
                        node.right.clone(),
                        node.key.clone(),
                        node.value.clone(),
                    ),
                    left.key.clone(),
                    left.value.clone(),
                ));
            }
            // Red child with a red inner grandchild: double rotation
            // promoting the grandchild.
            if let Self::Node(inner) = &left.right
                && inner.color == Color::Red
            {
                return Some(Self::node(
                    node.color.lighter(),
                    Self::node(
                        Color::Black,
                        left.left.clone(),
                        inner.left.clone(),
                        left.key.clone(),
                        left.value.clone(),
                    ),
                    Self::node(
                        Color::Black,
                        inner.right.clone(),
                        node.right.clone(),
                        node.key.clone(),
                        node.value.clone(),
                    ),
                    inner.key.clone(),
                    inner.value.clone(),
                ));
            }
            return None;
        }

        if left.color == Color::NegativeBlack
            && let Self::Node(inner) = &left.right
        {
            // Negative-black child: both its subtrees are non-empty black
            // nodes. Rebuild a black subtree, reddening the outer grandchild
            // and locally rebalancing the reconstructed left side.
            let new_left = Self::node(
                Color::Black,
                left.left.redden(),
                inner.left.clone(),
                left.key.clone(),
                left.value.clone(),
            )
            .balance_left();
            let new_right = Self::node(
                Color::Black,
                inner.right.clone(),
                node.right.clone(),
                node.key.clone(),
                node.value.clone(),
            );
            return Some(Self::node(
                Color::Black,
                new_left,
                new_right,
                inner.key.clone(),
                inner.value.clone(),
            ));
        }
        None
    }

    /// Mirror image of [`balance_left`](Self::balance_left).
    fn balance_right(self) -> Self {
        let rewritten = self.balance_right_rewrite();
        rewritten.unwrap_or(self)
    }

    fn balance_right_rewrite(&self) -> Option<Self> {
        let node = self.as_node()?;
        if node.color < Color::Black {
            return None;
        }
        let right = node.right.as_node()?;

        if right.color == Color::Red {
            if let Self::Node(inner) = &right.left
                && inner.color == Color::Red
            {
                return Some(Self::node(
                    node.color.lighter(),
                    Self::node(
                        Color::Black,
                        node.left.clone(),
                        inner.left.clone(),
                        node.key.clone(),
                        node.value.clone(),
                    ),
                    Self::node(
                        Color::Black,
                        inner.right.clone(),
                        right.right.clone(),
                        right.key.clone(),
                        right.value.clone(),
                    ),
                    inner.key.clone(),
                    inner.value.clone(),
                ));
            }
            if let Self::Node(outer) = &right.right
                && outer.color == Color::Red
            {
                return Some(Self::node(
                    node.color.lighter(),
                    Self::node(
                        Color::Black,
                        node.left.clone(),
                        right.left.clone(),
                        node.key.clone(),
                        node.value.clone(),
                    ),
                    outer.recolored(Color::Black),
                    right.key.clone(),
                    right.value.clone(),
                ));
            }
            return None;
        }

        if right.color == Color::NegativeBlack
            && let Self::Node(inner) = &right.left
        {
            let new_left = Self::node(
                Color::Black,
                node.left.clone(),
                inner.left.clone(),
                node.key.clone(),
                node.value.clone(),
            );
            let new_right = Self::node(
                Color::Black,
                inner.right.clone(),
                right.right.redden(),
                right.key.clone(),
                right.value.clone(),
            )
            .balance_right();
            return Some(Self::node(
                Color::Black,
                new_left,
                new_right,
                inner.key.clone(),
                inner.value.clone(),
            ));
        }
        None
    }

    /// Pushes a double-black child's blackness debt up one level.
    ///
    /// The receiver absorbs one unit of blackness, both children give one
    /// up (this is where a red sibling turns negative-black), and the
    /// subtree is rebalanced toward the side the debt came from.
    fn bubble(self) -> Self {
        let rewritten = self.bubble_rewrite();
        rewritten.unwrap_or(self)
    }

    fn bubble_rewrite(&self) -> Option<Self> {
        let node = self.as_node()?;
        let from_left = node.left.color() == Color::DoubleBlack;
        if !from_left && node.right.color() != Color::DoubleBlack {
            return None;
        }
        let unbalanced = Self::node(
            node.color.darker(),
            node.left.redden(),
            node.right.redden(),
            node.key.clone(),
            node.value.clone(),
        );
        Some(if from_left {
            unbalanced.balance_right()
        } else {
            unbalanced.balance_left()
        })
    }
}

// =============================================================================
// PersistentOrderedMap Definition
// =============================================================================

/// A persistent (immutable) ordered map.
///
/// `PersistentOrderedMap` is an immutable red-black tree with double-black
/// deletion and per-node size annotations. Every update returns a new map
/// sharing all untouched nodes with its predecessor; previous versions
/// remain valid and observable, and maps are safe to share across threads.
///
/// Keys must implement `Ord`. Entries are maintained in sorted key order,
/// enabling ordered cursors, strict neighbor queries, and O(log n) rank
/// queries.
///
/// # Time Complexity
///
/// | Operation                 | Complexity |
/// |---------------------------|------------|
/// | `new`                     | O(1)       |
/// | `get` / `contains_key`    | O(log n)   |
/// | `insert`                  | O(log n)   |
/// | `remove`                  | O(log n)   |
/// | `min` / `max`             | O(log n)   |
/// | `min_after` / `max_before`| O(log n)   |
/// | `len` / `is_empty`        | O(1)       |
///
/// # Examples
///
/// ```rust
/// use perdure::persistent::PersistentOrderedMap;
///
/// let map = PersistentOrderedMap::singleton(42, "answer");
/// assert_eq!(map.get(&42), Some(&"answer"));
///
/// let map = map.insert(7, "seven").insert(99, "ninety-nine");
/// assert_eq!(map.min().unwrap().key(), &7);
/// assert_eq!(map.max().unwrap().key(), &99);
/// ```
pub struct PersistentOrderedMap<K, V> {
    root: Tree<K, V>,
}

impl<K, V> Clone for PersistentOrderedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<K, V> PersistentOrderedMap<K, V> {
    /// Creates a new empty map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::PersistentOrderedMap;
    ///
    /// let map: PersistentOrderedMap<i32, String> = PersistentOrderedMap::new();
    /// assert!(map.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { root: Tree::Empty }
    }

    /// Returns the number of entries in the map.
    ///
    /// # Complexity
    ///
    /// O(1) - read from the root's size annotation
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.root.size()
    }

    /// Returns `true` if the map contains no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Returns an iterator over the entries in ascending key order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::PersistentOrderedMap;
    ///
    /// let map = PersistentOrderedMap::new().insert(2, "b").insert(1, "a");
    /// let entries: Vec<(&i32, &&str)> = map.iter().collect();
    /// assert_eq!(entries, vec![(&1, &"a"), (&2, &"b")]);
    /// ```
    #[must_use]
    pub fn iter(&self) -> PersistentOrderedMapIterator<'_, K, V> {
        let mut entries = Vec::with_capacity(self.len());
        collect_entries(&self.root, &mut entries);
        PersistentOrderedMapIterator {
            entries,
            current_index: 0,
        }
    }

    /// Returns an iterator over the keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Returns an iterator over the values, in ascending order of their
    /// keys.
    #[must_use]
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }
}

impl<K: Ord, V> PersistentOrderedMap<K, V> {
    /// Returns a reference to the value associated with the given key.
    ///
    /// The key may be any borrowed form of the map's key type, as long as
    /// the ordering on the borrowed form matches the ordering on the key
    /// type.
    ///
    /// The lookup is a single root-to-leaf descent that tracks the last
    /// node whose key is not greater than the query, followed by one
    /// equality check.
    ///
    /// # Complexity
    ///
    /// O(log n)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::PersistentOrderedMap;
    ///
    /// let map = PersistentOrderedMap::new().insert("hello".to_string(), 42);
    ///
    /// // Can use &str to look up String keys
    /// assert_eq!(map.get("hello"), Some(&42));
    /// assert_eq!(map.get("world"), None);
    /// ```
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let candidate = find_less_than_or_equal(&self.root, key, None)?;
        (candidate.key.borrow() == key).then_some(&candidate.value)
    }

    /// Returns `true` if the map contains an entry for the given key.
    ///
    /// # Complexity
    ///
    /// O(log n)
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Returns a cursor at the minimum entry, or `None` if the map is
    /// empty.
    ///
    /// # Complexity
    ///
    /// O(log n)
    #[must_use]
    pub fn min(&self) -> Option<PersistentOrderedMapCursor<K, V>> {
        descend_min(&self.root, PersistentStack::new())
    }

    /// Returns a cursor at the maximum entry, or `None` if the map is
    /// empty.
    ///
    /// # Complexity
    ///
    /// O(log n)
    #[must_use]
    pub fn max(&self) -> Option<PersistentOrderedMapCursor<K, V>> {
        descend_max(&self.root, PersistentStack::new())
    }

    /// Returns a cursor at the minimum entry whose key is strictly greater
    /// than the given key, or `None` if there is no such entry.
    ///
    /// # Complexity
    ///
    /// O(log n)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::PersistentOrderedMap;
    ///
    /// let map = PersistentOrderedMap::new().insert(0, "a").insert(2, "b");
    /// assert_eq!(map.min_after(&0).unwrap().key(), &2);
    /// assert!(map.min_after(&2).is_none());
    /// ```
    #[must_use]
    pub fn min_after<Q>(&self, key: &Q) -> Option<PersistentOrderedMapCursor<K, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        min_greater_than(&self.root, key, PersistentStack::new())
    }

    /// Returns a cursor at the maximum entry whose key is strictly less
    /// than the given key, or `None` if there is no such entry.
    ///
    /// # Complexity
    ///
    /// O(log n)
    #[must_use]
    pub fn max_before<Q>(&self, key: &Q) -> Option<PersistentOrderedMapCursor<K, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        max_less_than(&self.root, key, PersistentStack::new())
    }
}

impl<K: Clone + Ord, V: Clone> PersistentOrderedMap<K, V> {
    /// Creates a map containing a single entry.
    #[inline]
    #[must_use]
    pub fn singleton(key: K, value: V) -> Self {
        Self::new().insert(key, value)
    }

    /// Associates a value with the given key.
    ///
    /// If the map already contains the key, the value is replaced; the size
    /// does not change. The returned map's root is always black.
    ///
    /// # Complexity
    ///
    /// O(log n)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::PersistentOrderedMap;
    ///
    /// let map1 = PersistentOrderedMap::new().insert(1, "one");
    /// let map2 = map1.insert(1, "ONE");
    ///
    /// assert_eq!(map1.get(&1), Some(&"one")); // Original unchanged
    /// assert_eq!(map2.get(&1), Some(&"ONE")); // New version
    /// ```
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> Self {
        Self {
            root: insert_into(&self.root, key, value).blacken(),
        }
    }

    /// Removes a key from the map.
    ///
    /// Returns a new map without the key; if the key is absent, returns a
    /// clone of the original map. The returned map's root is always black.
    ///
    /// # Complexity
    ///
    /// O(log n)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::PersistentOrderedMap;
    ///
    /// let map = PersistentOrderedMap::new().insert(1, "one").insert(2, "two");
    /// let removed = map.remove(&1);
    ///
    /// assert_eq!(map.len(), 2);     // Original unchanged
    /// assert_eq!(removed.len(), 1); // New version
    /// assert_eq!(removed.get(&1), None);
    /// ```
    #[must_use]
    pub fn remove<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (tree, removed) = delete_from(&self.root, key);
        if !removed {
            return self.clone();
        }
        let root = match tree {
            node @ Tree::Node(_) => node.blacken(),
            // Deleting the last entry may surface the double-black empty
            // sentinel; the resulting map is simply empty.
            Tree::Empty | Tree::DoubleBlackEmpty => Tree::Empty,
        };
        Self { root }
    }
}

impl<K: Ord, V> PersistentOrderedMap<K, V> {
    /// Verifies the structural invariants of the tree.
    ///
    /// Checks the black root, the absence of red-red edges and transient
    /// colors, equal black heights on every root-to-empty path, correct
    /// size annotations, and strictly ascending in-order keys.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Tree::Node(node) = &self.root
            && node.color != Color::Black
        {
            return Err(format!("root color is {:?}, expected Black", node.color));
        }
        check_subtree(&self.root, None, None).map(|_| ())
    }
}

// =============================================================================
// Tree Operations
// =============================================================================

fn find_less_than_or_equal<'a, K, V, Q>(
    tree: &'a Tree<K, V>,
    key: &Q,
    candidate: Option<&'a Node<K, V>>,
) -> Option<&'a Node<K, V>>
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    match tree {
        Tree::Node(node) => {
            if key < node.key.borrow() {
                find_less_than_or_equal(&node.left, key, candidate)
            } else {
                find_less_than_or_equal(&node.right, key, Some(node))
            }
        }
        Tree::Empty | Tree::DoubleBlackEmpty => candidate,
    }
}

fn insert_into<K: Clone + Ord, V: Clone>(tree: &Tree<K, V>, key: K, value: V) -> Tree<K, V> {
    let Some(node) = tree.as_node() else {
        return Tree::node(Color::Red, Tree::Empty, Tree::Empty, key, value);
    };
    match key.cmp(&node.key) {
        Ordering::Less => Tree::node(
            node.color,
            insert_into(&node.left, key, value),
            node.right.clone(),
            node.key.clone(),
            node.value.clone(),
        )
        .balance_left(),
        Ordering::Greater => Tree::node(
            node.color,
            node.left.clone(),
            insert_into(&node.right, key, value),
            node.key.clone(),
            node.value.clone(),
        )
        .balance_right(),
        Ordering::Equal => Tree::node(
            node.color,
            node.left.clone(),
            node.right.clone(),
            key,
            value,
        ),
    }
}

/// Recursive removal. Returns the new subtree and whether a key was
/// actually removed.
fn delete_from<K, V, Q>(tree: &Tree<K, V>, key: &Q) -> (Tree<K, V>, bool)
where
    K: Clone + Ord + Borrow<Q>,
    V: Clone,
    Q: Ord + ?Sized,
{
    let Some(node) = tree.as_node() else {
        return (tree.clone(), false);
    };
    match key.cmp(node.key.borrow()) {
        Ordering::Less => {
            let (left, removed) = delete_from(&node.left, key);
            if removed {
                (adopt(node, left, node.right.clone()).bubble(), true)
            } else {
                (tree.clone(), false)
            }
        }
        Ordering::Greater => {
            let (right, removed) = delete_from(&node.right, key);
            if removed {
                (adopt(node, node.left.clone(), right).bubble(), true)
            } else {
                (tree.clone(), false)
            }
        }
        Ordering::Equal => (remove_node(node), true),
    }
}

/// Rebuilds a node around new children, keeping its color, key, and value
/// and recomputing the size annotation.
fn adopt<K: Clone, V: Clone>(node: &Node<K, V>, left: Tree<K, V>, right: Tree<K, V>) -> Tree<K, V> {
    Tree::node(node.color, left, right, node.key.clone(), node.value.clone())
}

/// Unconditionally removes the entry at this node.
fn remove_node<K: Clone + Ord, V: Clone>(node: &Node<K, V>) -> Tree<K, V> {
    if !node.left.is_empty() && !node.right.is_empty() {
        // Two children: replace this entry with its predecessor, extracted
        // from the left subtree.
        let (left, predecessor_key, predecessor_value) = remove_max(
            node.left
                .as_node()
                .expect("non-empty subtree must be a node"),
        );
        return Tree::node(
            node.color,
            left,
            node.right.clone(),
            predecessor_key,
            predecessor_value,
        )
        .bubble();
    }
    if let Some(child) = node.left.as_node().or_else(|| node.right.as_node()) {
        // One child: it replaces this node, recolored black to preserve the
        // black height.
        return child.recolored(Color::Black);
    }
    // No children: a red leaf vanishes; a black leaf leaves its blackness
    // debt behind as the double-black empty sentinel.
    if node.color == Color::Red {
        Tree::Empty
    } else {
        Tree::DoubleBlackEmpty
    }
}

/// Extracts the maximum entry of a subtree. Returns the reduced subtree
/// (already bubbled) and the extracted key and value.
fn remove_max<K: Clone + Ord, V: Clone>(node: &Node<K, V>) -> (Tree<K, V>, K, V) {
    match node.right.as_node() {
        None => (
            remove_node(node),
            node.key.clone(),
            node.value.clone(),
        ),
        Some(right_node) => {
            let (right, removed_key, removed_value) = remove_max(right_node);
            (
                adopt(node, node.left.clone(), right).bubble(),
                removed_key,
                removed_value,
            )
        }
    }
}

fn check_subtree<K: Ord, V>(
    tree: &Tree<K, V>,
    lower: Option<&K>,
    upper: Option<&K>,
) -> Result<usize, String> {
    let node = match tree {
        Tree::Empty => return Ok(0),
        Tree::DoubleBlackEmpty => {
            return Err("double-black empty sentinel escaped a removal".to_string());
        }
        Tree::Node(node) => node,
    };

    match node.color {
        Color::Red | Color::Black => {}
        transient => return Err(format!("transient color {transient:?} escaped")),
    }
    if node.color == Color::Red
        && (node.left.color() == Color::Red || node.right.color() == Color::Red)
    {
        return Err("red node has a red child".to_string());
    }
    if lower.is_some_and(|bound| node.key <= *bound)
        || upper.is_some_and(|bound| node.key >= *bound)
    {
        return Err("in-order keys are not strictly ascending".to_string());
    }
    if node.size != 1 + node.left.size() + node.right.size() {
        return Err(format!(
            "size annotation {} does not match subtree sizes {} and {}",
            node.size,
            node.left.size(),
            node.right.size()
        ));
    }

    let left_height = check_subtree(&node.left, lower, Some(&node.key))?;
    let right_height = check_subtree(&node.right, Some(&node.key), upper)?;
    if left_height != right_height {
        return Err(format!(
            "unbalanced black heights: {left_height} on the left, {right_height} on the right"
        ));
    }
    Ok(left_height + usize::from(node.color == Color::Black))
}

// =============================================================================
// Cursor
// =============================================================================

/// The persistent stack of ancestors carried by a cursor, top = nearest
/// ancestor on the path from the root.
type Lineage<K, V> = PersistentStack<ReferenceCounter<Node<K, V>>>;

/// A cursor over a snapshot of a [`PersistentOrderedMap`].
///
/// A cursor represents one entry together with the lineage of ancestors on
/// the path from the root, which lets [`next`](Self::next) and
/// [`prev`](Self::prev) ascend without parent pointers. Cursors are
/// snapshots: a cursor keeps iterating the map version it was created from,
/// unaffected by later updates.
///
/// # Examples
///
/// ```rust
/// use perdure::persistent::PersistentOrderedMap;
///
/// let map = PersistentOrderedMap::new().insert(1, "a").insert(2, "b");
/// let cursor = map.min().unwrap();
/// assert_eq!(cursor.key(), &1);
/// assert_eq!(cursor.next().unwrap().key(), &2);
/// ```
pub struct PersistentOrderedMapCursor<K, V> {
    lineage: Lineage<K, V>,
    node: ReferenceCounter<Node<K, V>>,
}

impl<K, V> Clone for PersistentOrderedMapCursor<K, V> {
    fn clone(&self) -> Self {
        Self {
            lineage: self.lineage.clone(),
            node: self.node.clone(),
        }
    }
}

impl<K, V> PersistentOrderedMapCursor<K, V> {
    /// Returns the key of the entry at the cursor.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        &self.node.key
    }

    /// Returns the value of the entry at the cursor.
    #[inline]
    #[must_use]
    pub fn value(&self) -> &V {
        &self.node.value
    }
}

impl<K: Ord, V> PersistentOrderedMapCursor<K, V> {
    /// Returns a cursor at the next entry in key order, or `None` at the
    /// maximum.
    ///
    /// # Complexity
    ///
    /// O(log n) worst-case, amortized O(1) when iterating over the entire
    /// map: each edge of the tree is traversed a bounded number of times
    /// across a full walk.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        if self.node.right.as_arc().is_some() {
            return descend_min(&self.node.right, self.lineage.push(self.node.clone()));
        }
        let mut lineage = self.lineage.clone();
        while let Some((ancestor, rest)) = lineage.uncons() {
            if self.node.key < ancestor.key {
                return Some(Self {
                    node: ancestor.clone(),
                    lineage: rest,
                });
            }
            lineage = rest;
        }
        None
    }

    /// Returns a cursor at the previous entry in key order, or `None` at
    /// the minimum.
    ///
    /// # Complexity
    ///
    /// As [`next`](Self::next).
    #[must_use]
    pub fn prev(&self) -> Option<Self> {
        if self.node.left.as_arc().is_some() {
            return descend_max(&self.node.left, self.lineage.push(self.node.clone()));
        }
        let mut lineage = self.lineage.clone();
        while let Some((ancestor, rest)) = lineage.uncons() {
            if ancestor.key < self.node.key {
                return Some(Self {
                    node: ancestor.clone(),
                    lineage: rest,
                });
            }
            lineage = rest;
        }
        None
    }

    /// Returns the number of entries in the map with keys strictly less
    /// than this cursor's key.
    ///
    /// # Complexity
    ///
    /// O(log n), using the per-node size annotations.
    #[must_use]
    pub fn count_less(&self) -> usize {
        let mut count = self.node.left.size();
        for ancestor in self.lineage.iter() {
            if ancestor.key < self.node.key {
                count += 1 + ancestor.left.size();
            }
        }
        count
    }

    /// Returns the number of entries in the map with keys strictly greater
    /// than this cursor's key.
    ///
    /// # Complexity
    ///
    /// O(log n), using the per-node size annotations.
    #[must_use]
    pub fn count_greater(&self) -> usize {
        let mut count = self.node.right.size();
        for ancestor in self.lineage.iter() {
            if self.node.key < ancestor.key {
                count += 1 + ancestor.right.size();
            }
        }
        count
    }
}

fn descend_min<K, V>(
    tree: &Tree<K, V>,
    lineage: Lineage<K, V>,
) -> Option<PersistentOrderedMapCursor<K, V>> {
    let mut lineage = lineage;
    let mut current = tree.as_arc()?.clone();
    loop {
        let Some(left) = current.left.as_arc().cloned() else {
            return Some(PersistentOrderedMapCursor {
                lineage,
                node: current,
            });
        };
        lineage = lineage.push(current);
        current = left;
    }
}

fn descend_max<K, V>(
    tree: &Tree<K, V>,
    lineage: Lineage<K, V>,
) -> Option<PersistentOrderedMapCursor<K, V>> {
    let mut lineage = lineage;
    let mut current = tree.as_arc()?.clone();
    loop {
        let Some(right) = current.right.as_arc().cloned() else {
            return Some(PersistentOrderedMapCursor {
                lineage,
                node: current,
            });
        };
        lineage = lineage.push(current);
        current = right;
    }
}

fn min_greater_than<K, V, Q>(
    tree: &Tree<K, V>,
    key: &Q,
    lineage: Lineage<K, V>,
) -> Option<PersistentOrderedMapCursor<K, V>>
where
    K: Ord + Borrow<Q>,
    Q: Ord + ?Sized,
{
    let node = tree.as_arc()?;
    match key.cmp(node.key.borrow()) {
        Ordering::Less => {
            if let Some(found) = min_greater_than(&node.left, key, lineage.push(node.clone())) {
                return Some(found);
            }
            // Nothing greater in the left subtree: this node is the answer.
            Some(PersistentOrderedMapCursor {
                lineage,
                node: node.clone(),
            })
        }
        Ordering::Greater => min_greater_than(&node.right, key, lineage.push(node.clone())),
        Ordering::Equal => descend_min(&node.right, lineage.push(node.clone())),
    }
}

fn max_less_than<K, V, Q>(
    tree: &Tree<K, V>,
    key: &Q,
    lineage: Lineage<K, V>,
) -> Option<PersistentOrderedMapCursor<K, V>>
where
    K: Ord + Borrow<Q>,
    Q: Ord + ?Sized,
{
    let node = tree.as_arc()?;
    match key.cmp(node.key.borrow()) {
        Ordering::Greater => {
            if let Some(found) = max_less_than(&node.right, key, lineage.push(node.clone())) {
                return Some(found);
            }
            Some(PersistentOrderedMapCursor {
                lineage,
                node: node.clone(),
            })
        }
        Ordering::Less => max_less_than(&node.left, key, lineage.push(node.clone())),
        Ordering::Equal => descend_max(&node.left, lineage.push(node.clone())),
    }
}

// =============================================================================
// Iterators
// =============================================================================

fn collect_entries<'a, K, V>(tree: &'a Tree<K, V>, entries: &mut Vec<(&'a K, &'a V)>) {
    if let Tree::Node(node) = tree {
        collect_entries(&node.left, entries);
        entries.push((&node.key, &node.value));
        collect_entries(&node.right, entries);
    }
}

/// An iterator over the entries of a [`PersistentOrderedMap`] in ascending
/// key order.
pub struct PersistentOrderedMapIterator<'a, K, V> {
    entries: Vec<(&'a K, &'a V)>,
    current_index: usize,
}

impl<'a, K, V> Iterator for PersistentOrderedMapIterator<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.current_index).copied()?;
        self.current_index += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len().saturating_sub(self.current_index);
        (remaining, Some(remaining))
    }
}

impl<K, V> ExactSizeIterator for PersistentOrderedMapIterator<'_, K, V> {}

/// An owning iterator over the entries of a [`PersistentOrderedMap`] in
/// ascending key order.
pub struct PersistentOrderedMapIntoIterator<K, V> {
    entries: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for PersistentOrderedMapIntoIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl<K, V> ExactSizeIterator for PersistentOrderedMapIntoIterator<K, V> {}

// =============================================================================
// Standard Trait Implementations
// =============================================================================

impl<K, V> Default for PersistentOrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Ord, V: Clone> FromIterator<(K, V)> for PersistentOrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iterator: I) -> Self {
        iterator
            .into_iter()
            .fold(Self::new(), |map, (key, value)| map.insert(key, value))
    }
}

impl<K: Clone, V: Clone> IntoIterator for PersistentOrderedMap<K, V> {
    type Item = (K, V);
    type IntoIter = PersistentOrderedMapIntoIterator<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        let entries: Vec<(K, V)> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        PersistentOrderedMapIntoIterator {
            entries: entries.into_iter(),
        }
    }
}

impl<'a, K, V> IntoIterator for &'a PersistentOrderedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = PersistentOrderedMapIterator<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for PersistentOrderedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<K: Eq, V: Eq> Eq for PersistentOrderedMap<K, V> {}

impl<K: Hash, V: Hash> Hash for PersistentOrderedMap<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        for (key, value) in self {
            key.hash(state);
            value.hash(state);
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentOrderedMap<K, V> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
