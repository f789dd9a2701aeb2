//! Address-ordered AVL trees of chunk headers.
//!
//! A tree never owns memory of its own. Each node is the [`ChunkHeader`] at
//! the start of the chunk it describes, and its key is the address of that
//! header. Links are stored as addresses rather than pointers, so holding a
//! link does not imply a borrow of the linked chunk; every access goes back
//! through the region's [`BasePtr`].
//!
//! All operations are iterative. The path from the root is recorded in a
//! fixed-capacity stack and retraced bottom-up to restore balance.

use core::{cmp::Ordering, num::NonZeroUsize};

use crate::base::BasePtr;

/// The header stored at the start of every chunk.
///
/// While the chunk is tracked by an allocator, its header is a node of
/// exactly one [`AvlTree`]: the free tree of its class, or the allocated tree.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ChunkHeader {
    pub left: Option<NonZeroUsize>,
    pub right: Option<NonZeroUsize>,
    /// Height of the subtree rooted at this node; a leaf has height 1.
    pub height: u8,
    /// Size class of the chunk.
    pub power: u8,
    /// Index of the block containing the chunk.
    pub block: u8,
    pub is_free: bool,
}

impl ChunkHeader {
    fn leaf(is_free: bool, block: u8, power: u8) -> ChunkHeader {
        ChunkHeader {
            left: None,
            right: None,
            height: 1,
            power,
            block,
            is_free,
        }
    }
}

// An AVL tree of height h holds at least fib(h + 2) - 1 nodes, so 64 levels
// is far beyond any tree whose nodes fit in the address space.
const MAX_HEIGHT: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

/// The nodes visited on the way down from the root, with the direction taken
/// at each.
struct Path {
    steps: [(NonZeroUsize, Dir); MAX_HEIGHT],
    len: usize,
}

impl Path {
    fn new() -> Path {
        Path {
            steps: [(NonZeroUsize::MIN, Dir::Left); MAX_HEIGHT],
            len: 0,
        }
    }

    fn push(&mut self, node: NonZeroUsize, dir: Dir) {
        assert!(self.len < MAX_HEIGHT, "tree exceeds maximum height");

        self.steps[self.len] = (node, dir);
        self.len += 1;
    }

    fn steps(&self) -> &[(NonZeroUsize, Dir)] {
        &self.steps[..self.len]
    }
}

// Node accessors. Each one holds a reference to a header only for the
// duration of the call.
//
// SAFETY (all of them): `node` must be the address of an initialized header
// within the provenance of `base`.

unsafe fn child(base: BasePtr, node: NonZeroUsize, dir: Dir) -> Option<NonZeroUsize> {
    let header = unsafe { base.header_mut(node) };
    match dir {
        Dir::Left => header.left,
        Dir::Right => header.right,
    }
}

unsafe fn set_child(base: BasePtr, node: NonZeroUsize, dir: Dir, to: Option<NonZeroUsize>) {
    let header = unsafe { base.header_mut(node) };
    match dir {
        Dir::Left => header.left = to,
        Dir::Right => header.right = to,
    }
}

unsafe fn height(base: BasePtr, node: Option<NonZeroUsize>) -> u8 {
    node.map_or(0, |n| unsafe { base.header_mut(n).height })
}

unsafe fn update_height(base: BasePtr, node: NonZeroUsize) {
    unsafe {
        let left = height(base, child(base, node, Dir::Left));
        let right = height(base, child(base, node, Dir::Right));
        base.header_mut(node).height = left.max(right) + 1;
    }
}

/// Right subtree height minus left subtree height.
unsafe fn balance(base: BasePtr, node: NonZeroUsize) -> i32 {
    unsafe {
        let left = height(base, child(base, node, Dir::Left));
        let right = height(base, child(base, node, Dir::Right));
        i32::from(right) - i32::from(left)
    }
}

/// Lifts the right child of `node` into its place, returning the new subtree
/// root.
unsafe fn rotate_left(base: BasePtr, node: NonZeroUsize) -> NonZeroUsize {
    unsafe {
        let pivot = child(base, node, Dir::Right).expect("rotate_left without right child");
        set_child(base, node, Dir::Right, child(base, pivot, Dir::Left));
        set_child(base, pivot, Dir::Left, Some(node));

        update_height(base, node);
        update_height(base, pivot);

        pivot
    }
}

/// Lifts the left child of `node` into its place, returning the new subtree
/// root.
unsafe fn rotate_right(base: BasePtr, node: NonZeroUsize) -> NonZeroUsize {
    unsafe {
        let pivot = child(base, node, Dir::Left).expect("rotate_right without left child");
        set_child(base, node, Dir::Left, child(base, pivot, Dir::Right));
        set_child(base, pivot, Dir::Right, Some(node));

        update_height(base, node);
        update_height(base, pivot);

        pivot
    }
}

/// Restores the AVL property at `node`, assuming both of its subtrees are
/// balanced and have correct heights. Returns the new subtree root.
unsafe fn rebalance(base: BasePtr, node: NonZeroUsize) -> NonZeroUsize {
    unsafe {
        match balance(base, node) {
            -2 => {
                let left = child(base, node, Dir::Left).expect("left-heavy node without left child");
                if balance(base, left) > 0 {
                    let lifted = rotate_left(base, left);
                    set_child(base, node, Dir::Left, Some(lifted));
                }
                rotate_right(base, node)
            }

            2 => {
                let right =
                    child(base, node, Dir::Right).expect("right-heavy node without right child");
                if balance(base, right) < 0 {
                    let lifted = rotate_right(base, right);
                    set_child(base, node, Dir::Right, Some(lifted));
                }
                rotate_left(base, node)
            }

            -1..=1 => {
                update_height(base, node);
                node
            }

            bf => panic!("balance factor {bf} out of range"),
        }
    }
}

/// An AVL tree of chunk headers, keyed by address.
#[derive(Debug)]
pub struct AvlTree {
    root: Option<NonZeroUsize>,
    len: usize,
}

impl AvlTree {
    pub const fn new() -> AvlTree {
        AvlTree { root: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Writes a fresh header at `addr` and links it into the tree.
    ///
    /// Returns `false`, leaving the tree and the memory at `addr` untouched,
    /// if `addr` is already a key.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - Every node of `self` must be an initialized header within the
    ///   provenance of `base`.
    /// - `addr` must be aligned for `ChunkHeader`, within the provenance of
    ///   `base`, and valid for writes of `size_of::<ChunkHeader>()` bytes.
    /// - `addr` must not be a node of any other tree.
    pub unsafe fn insert(
        &mut self,
        base: BasePtr,
        addr: NonZeroUsize,
        is_free: bool,
        block: u8,
        power: u8,
    ) -> bool {
        let mut path = Path::new();
        let mut cur = self.root;

        while let Some(node) = cur {
            let dir = match addr.cmp(&node) {
                Ordering::Less => Dir::Left,
                Ordering::Greater => Dir::Right,
                Ordering::Equal => return false,
            };

            path.push(node, dir);
            cur = unsafe { child(base, node, dir) };
        }

        unsafe {
            base.init_header_at(addr, ChunkHeader::leaf(is_free, block, power));
            self.retrace(base, &path, Some(addr));
        }

        self.len += 1;
        true
    }

    /// Unlinks the node at `addr`.
    ///
    /// Returns `false` if `addr` is not a key of the tree. The header memory
    /// itself is left as it was.
    ///
    /// # Safety
    ///
    /// Every node of `self` must be an initialized header within the
    /// provenance of `base`.
    pub unsafe fn remove(&mut self, base: BasePtr, addr: NonZeroUsize) -> bool {
        let mut path = Path::new();
        let mut cur = self.root;

        let node = loop {
            let node = match cur {
                Some(n) => n,
                None => return false,
            };

            let dir = match addr.cmp(&node) {
                Ordering::Less => Dir::Left,
                Ordering::Greater => Dir::Right,
                Ordering::Equal => break node,
            };

            path.push(node, dir);
            cur = unsafe { child(base, node, dir) };
        };

        let (left, right) = {
            let header = unsafe { base.header_mut(node) };
            (header.left, header.right)
        };

        let replacement = match (left, right) {
            (Some(left), Some(right)) => {
                // The in-order successor is relinked into the removed node's
                // position. Its own slot is taken by its right child.
                let slot = path.len;
                path.push(node, Dir::Right);

                let mut succ = right;
                while let Some(next) = unsafe { child(base, succ, Dir::Left) } {
                    path.push(succ, Dir::Left);
                    succ = next;
                }

                path.steps[slot].0 = succ;

                let succ_right = unsafe { child(base, succ, Dir::Right) };
                unsafe {
                    set_child(base, succ, Dir::Left, Some(left));

                    // If the successor is the immediate right child, its right
                    // link is rewritten by the retrace instead.
                    if succ != right {
                        set_child(base, succ, Dir::Right, Some(right));
                    }
                }

                succ_right
            }

            (left, right) => left.or(right),
        };

        unsafe { self.retrace(base, &path, replacement) };

        self.len -= 1;
        true
    }

    /// Hangs `subtree` below the last step of `path`, then rebalances every
    /// node on the path from the bottom up.
    unsafe fn retrace(&mut self, base: BasePtr, path: &Path, mut subtree: Option<NonZeroUsize>) {
        for &(node, dir) in path.steps().iter().rev() {
            unsafe {
                set_child(base, node, dir, subtree);
                subtree = Some(rebalance(base, node));
            }
        }

        self.root = subtree;
    }

    /// Returns the lowest address in the tree.
    ///
    /// # Safety
    ///
    /// Every node of `self` must be an initialized header within the
    /// provenance of `base`.
    pub unsafe fn smallest(&self, base: BasePtr) -> Option<NonZeroUsize> {
        let mut cur = self.root?;

        while let Some(left) = unsafe { child(base, cur, Dir::Left) } {
            cur = left;
        }

        Some(cur)
    }

    /// Returns the greatest address strictly below `addr`.
    ///
    /// Returns `None` if `addr` is itself a key, since `addr` then names a
    /// header rather than anything inside a chunk.
    ///
    /// # Safety
    ///
    /// Every node of `self` must be an initialized header within the
    /// provenance of `base`.
    pub unsafe fn predecessor(&self, base: BasePtr, addr: NonZeroUsize) -> Option<NonZeroUsize> {
        let mut cur = self.root;
        let mut candidate = None;

        while let Some(node) = cur {
            match addr.cmp(&node) {
                Ordering::Greater => {
                    candidate = Some(node);
                    cur = unsafe { child(base, node, Dir::Right) };
                }
                Ordering::Less => cur = unsafe { child(base, node, Dir::Left) },
                Ordering::Equal => return None,
            }
        }

        candidate
    }

    /// Returns `true` if `addr` is a key of the tree.
    ///
    /// # Safety
    ///
    /// Every node of `self` must be an initialized header within the
    /// provenance of `base`.
    pub unsafe fn contains(&self, base: BasePtr, addr: NonZeroUsize) -> bool {
        let mut cur = self.root;

        while let Some(node) = cur {
            cur = match addr.cmp(&node) {
                Ordering::Less => unsafe { child(base, node, Dir::Left) },
                Ordering::Greater => unsafe { child(base, node, Dir::Right) },
                Ordering::Equal => return true,
            };
        }

        false
    }
}

#[cfg(test)]
impl AvlTree {
    /// Returns the height of the tree.
    pub fn height(&self, base: BasePtr) -> usize {
        unsafe { height(base, self.root).into() }
    }

    /// Calls `f` on every node in ascending address order.
    pub fn for_each(&self, base: BasePtr, mut f: impl FnMut(NonZeroUsize, ChunkHeader)) {
        let mut stack = Path::new();
        let mut cur = self.root;

        loop {
            while let Some(node) = cur {
                stack.push(node, Dir::Left);
                cur = unsafe { child(base, node, Dir::Left) };
            }

            if stack.len == 0 {
                break;
            }

            stack.len -= 1;
            let (node, _) = stack.steps[stack.len];
            let header = unsafe { *base.header_mut(node) };
            f(node, header);
            cur = header.right;
        }
    }

    /// Checks ordering, cached heights and the AVL property of every node.
    pub fn is_valid(&self, base: BasePtr) -> bool {
        fn check(
            base: BasePtr,
            node: Option<NonZeroUsize>,
            lo: Option<NonZeroUsize>,
            hi: Option<NonZeroUsize>,
            count: &mut usize,
        ) -> Option<u8> {
            let node = match node {
                Some(n) => n,
                None => return Some(0),
            };

            if lo.map_or(false, |lo| node <= lo) || hi.map_or(false, |hi| node >= hi) {
                return None;
            }

            *count += 1;
            let header = unsafe { *base.header_mut(node) };
            let left = check(base, header.left, lo, Some(node), count)?;
            let right = check(base, header.right, Some(node), hi, count)?;

            let balanced = (i32::from(right) - i32::from(left)).abs() <= 1;
            let height = left.max(right) + 1;
            (balanced && header.height == height).then_some(height)
        }

        let mut count = 0;
        check(base, self.root, None, None, &mut count).is_some() && count == self.len
    }
}
