use std::collections::{HashMap, HashSet};

use im::Vector;

use crate::api::{Comment, CommentId};

#[derive(Clone, Debug, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,

    /// Replies, in chronological order
    pub children: Vector<CommentNode>,
}

/// Threaded view of a flat comment listing
///
/// All traversals use explicit stacks, so arbitrarily deep reply chains are
/// fine. Cloning is cheap, as nodes are shared between copies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommentTree {
    pub roots: Vector<CommentNode>,
}

impl CommentTree {
    /// Rows whose parent is not part of `rows` become top-level comments
    pub fn build(rows: impl IntoIterator<Item = Comment>) -> CommentTree {
        let mut rows = rows.into_iter().collect::<Vec<_>>();
        rows.sort_by_key(|c| (c.created_at, c.id));
        let order = rows.iter().map(|c| c.id).collect::<Vec<_>>();
        let present = order.iter().copied().collect::<HashSet<_>>();

        let mut children: HashMap<CommentId, Vec<CommentId>> = HashMap::new();
        let mut roots = Vec::new();
        for c in &rows {
            match c.parent_id.filter(|p| *p != c.id && present.contains(p)) {
                Some(p) => children.entry(p).or_default().push(c.id),
                None => roots.push(c.id),
            }
        }
        let mut by_id = rows.into_iter().map(|c| (c.id, c)).collect::<HashMap<_, _>>();

        let mut visited = HashSet::new();
        let mut built: HashMap<CommentId, CommentNode> = HashMap::new();
        let mut res = Vector::new();
        // rows caught in a parent cycle are unreachable from the roots, so they get promoted
        let starts = roots
            .into_iter()
            .chain(order.iter().copied())
            .collect::<Vec<_>>();
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut stack = vec![(start, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    let kids = children
                        .get(&id)
                        .map(|k| k.iter().filter_map(|k| built.remove(k)).collect())
                        .unwrap_or_default();
                    if let Some(comment) = by_id.remove(&id) {
                        built.insert(
                            id,
                            CommentNode {
                                comment,
                                children: kids,
                            },
                        );
                    }
                } else if visited.insert(id) {
                    stack.push((id, true));
                    if let Some(kids) = children.get(&id) {
                        stack.extend(
                            kids.iter()
                                .rev()
                                .filter(|k| !visited.contains(*k))
                                .map(|k| (*k, false)),
                        );
                    }
                }
            }
            if let Some(node) = built.remove(&start) {
                res.push_back(node);
            }
        }
        CommentTree { roots: res }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Total number of comments, replies included
    pub fn len(&self) -> usize {
        self.walk().len()
    }

    /// Pre-order listing of every comment along with its depth
    pub fn walk(&self) -> Vec<(usize, &Comment)> {
        let mut res = Vec::new();
        let mut stack = self.roots.iter().rev().map(|n| (0, n)).collect::<Vec<_>>();
        while let Some((depth, node)) = stack.pop() {
            res.push((depth, &node.comment));
            stack.extend(node.children.iter().rev().map(|n| (depth + 1, n)));
        }
        res
    }

    /// Indices leading to `id`, starting from the roots
    fn path_to(&self, id: CommentId) -> Option<Vec<usize>> {
        let mut stack = self
            .roots
            .iter()
            .enumerate()
            .map(|(i, n)| (vec![i], n))
            .collect::<Vec<_>>();
        while let Some((path, node)) = stack.pop() {
            if node.comment.id == id {
                return Some(path);
            }
            for (i, n) in node.children.iter().enumerate() {
                let mut p = path.clone();
                p.push(i);
                stack.push((p, n));
            }
        }
        None
    }

    pub fn find(&self, id: CommentId) -> Option<&CommentNode> {
        let path = self.path_to(id)?;
        let (first, rest) = path.split_first()?;
        let mut node = self.roots.get(*first)?;
        for i in rest {
            node = node.children.get(*i)?;
        }
        Some(node)
    }

    /// Applies `f` to the children of the node at `path`, or to the roots if `path` is empty
    fn edit_children<R>(
        &mut self,
        path: &[usize],
        f: impl FnOnce(&mut Vector<CommentNode>) -> R,
    ) -> Option<R> {
        let mut levels = vec![self.roots.clone()];
        for i in path {
            let next = levels.last()?.get(*i)?.children.clone();
            levels.push(next);
        }
        let res = f(levels.last_mut()?);
        for (k, i) in path.iter().enumerate().rev() {
            let kids = levels.pop()?;
            let mut node = levels[k].get(*i)?.clone();
            node.children = kids;
            levels[k].set(*i, node);
        }
        self.roots = levels.pop()?;
        Some(res)
    }

    /// Detaches the comment and all its replies
    pub fn remove(&mut self, id: CommentId) -> Option<CommentNode> {
        let path = self.path_to(id)?;
        let (last, parents) = path.split_last()?;
        self.edit_children(parents, |kids| kids.remove(*last))
    }

    /// Puts a detached node back under its parent, or at the top level if the
    /// parent is gone, keeping siblings in chronological order
    pub fn insert(&mut self, node: CommentNode) {
        let path = node
            .comment
            .parent_id
            .and_then(|p| self.path_to(p))
            .unwrap_or_default();
        let key = (node.comment.created_at, node.comment.id);
        self.edit_children(&path, |kids| {
            let pos = kids
                .iter()
                .position(|n| (n.comment.created_at, n.comment.id) > key)
                .unwrap_or(kids.len());
            kids.insert(pos, node);
        });
    }
}
