//! Read-only queries over the commit DAG.
//!
//! Commits reference parents by content hash, so a commit can only name
//! parents that existed before it; cycles are impossible for well-formed
//! data. `check_acyclic` still verifies this for records mirrored from a
//! ledger we do not control.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::commit::Commit;
use crate::types::CommitHash;

/// A view over a set of known commits keyed by hash.
pub struct CommitGraph<'a> {
    commits: &'a HashMap<CommitHash, Commit>,
}

impl<'a> CommitGraph<'a> {
    pub fn new(commits: &'a HashMap<CommitHash, Commit>) -> Self {
        Self { commits }
    }

    pub fn contains(&self, hash: &CommitHash) -> bool {
        self.commits.contains_key(hash)
    }

    /// Direct parents, or `None` if the commit is unknown.
    pub fn parents(&self, hash: &CommitHash) -> Option<&'a [CommitHash]> {
        self.commits.get(hash).map(|c| c.previous_commit_hashes.as_slice())
    }

    /// Transitive closure of `previous_commit_hashes`, excluding `hash` itself
    /// unless it is reachable from its own parents.
    ///
    /// Unknown parents are included but not expanded.
    pub fn ancestors(&self, hash: &CommitHash) -> HashSet<CommitHash> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<CommitHash> = self
            .parents(hash)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(parents) = self.parents(&next) {
                queue.extend(parents.iter().copied());
            }
        }
        seen
    }

    /// Whether `ancestor` is reachable from `descendant` through parent links.
    /// A commit counts as its own ancestor here, so tip updates to the same
    /// commit are accepted.
    pub fn is_ancestor(&self, ancestor: &CommitHash, descendant: &CommitHash) -> bool {
        ancestor == descendant || self.ancestors(descendant).contains(ancestor)
    }

    /// Commits that start a lineage.
    pub fn roots(&self) -> Vec<CommitHash> {
        let mut roots: Vec<CommitHash> = self
            .commits
            .iter()
            .filter(|(_, c)| c.is_root())
            .map(|(h, _)| *h)
            .collect();
        roots.sort();
        roots
    }

    /// Commits no other known commit names as a parent.
    pub fn heads(&self) -> Vec<CommitHash> {
        let referenced: HashSet<&CommitHash> = self
            .commits
            .values()
            .flat_map(|c| c.previous_commit_hashes.iter())
            .collect();
        let mut heads: Vec<CommitHash> = self
            .commits
            .keys()
            .filter(|h| !referenced.contains(h))
            .copied()
            .collect();
        heads.sort();
        heads
    }

    /// Returns the first commit found inside its own ancestry, if any.
    pub fn check_acyclic(&self) -> Result<(), CommitHash> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<CommitHash, Mark> = HashMap::with_capacity(self.commits.len());

        for start in self.commits.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // Iterative DFS: (node, index of next parent to visit)
            let mut stack: Vec<(CommitHash, usize)> = vec![(*start, 0)];
            marks.insert(*start, Mark::Visiting);

            while let Some((node, idx)) = stack.pop() {
                let parents = self.parents(&node).unwrap_or(&[]);
                if idx < parents.len() {
                    stack.push((node, idx + 1));
                    let parent = parents[idx];
                    match marks.get(&parent) {
                        Some(Mark::Visiting) => return Err(parent),
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(parent, Mark::Visiting);
                            stack.push((parent, 0));
                        }
                    }
                } else {
                    marks.insert(node, Mark::Done);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash, PeerId};

    fn commit(parents: Vec<CommitHash>, state: u8) -> (CommitHash, Commit) {
        let c = Commit {
            state: vec![state],
            previous_commit_hashes: parents,
            authors: vec![PeerId([1; 32])],
            witnesses: vec![],
            meta: None,
        };
        (c.hash().unwrap(), c)
    }

    /// root ─ a ─ b ─┐
    ///        └ c ───┴ merge
    fn diamond() -> (HashMap<CommitHash, Commit>, [CommitHash; 5]) {
        let (root, rc) = commit(vec![], 0);
        let (a, ac) = commit(vec![root], 1);
        let (b, bc) = commit(vec![a], 2);
        let (c, cc) = commit(vec![a], 3);
        let (m, mc) = commit(vec![b, c], 4);
        let map = HashMap::from([(root, rc), (a, ac), (b, bc), (c, cc), (m, mc)]);
        (map, [root, a, b, c, m])
    }

    #[test]
    fn test_ancestors_of_merge() {
        let (map, [root, a, b, c, m]) = diamond();
        let graph = CommitGraph::new(&map);
        let anc = graph.ancestors(&m);
        assert_eq!(anc, HashSet::from([root, a, b, c]));
        assert!(!anc.contains(&m));
    }

    #[test]
    fn test_is_ancestor() {
        let (map, [root, _a, b, c, m]) = diamond();
        let graph = CommitGraph::new(&map);
        assert!(graph.is_ancestor(&root, &m));
        assert!(graph.is_ancestor(&m, &m));
        assert!(!graph.is_ancestor(&b, &c));
        assert!(!graph.is_ancestor(&m, &root));
    }

    #[test]
    fn test_roots_and_heads() {
        let (map, [root, _, _, _, m]) = diamond();
        let graph = CommitGraph::new(&map);
        assert_eq!(graph.roots(), vec![root]);
        assert_eq!(graph.heads(), vec![m]);
    }

    #[test]
    fn test_no_commit_is_its_own_ancestor() {
        let (map, hashes) = diamond();
        let graph = CommitGraph::new(&map);
        for h in hashes {
            assert!(!graph.ancestors(&h).contains(&h));
        }
        assert_eq!(graph.check_acyclic(), Ok(()));
    }

    #[test]
    fn test_check_acyclic_detects_forged_cycle() {
        // Content addressing prevents this; forge the mapping by hand.
        let x = Hash::of(b"x");
        let y = Hash::of(b"y");
        let (_, mut cx) = commit(vec![y], 1);
        let (_, mut cy) = commit(vec![x], 2);
        cx.previous_commit_hashes = vec![y];
        cy.previous_commit_hashes = vec![x];
        let map = HashMap::from([(x, cx), (y, cy)]);
        assert!(CommitGraph::new(&map).check_acyclic().is_err());
    }

    #[test]
    fn test_unknown_parent_is_not_expanded() {
        let dangling = Hash::of(b"elsewhere");
        let (h, c) = commit(vec![dangling], 7);
        let map = HashMap::from([(h, c)]);
        let graph = CommitGraph::new(&map);
        assert_eq!(graph.ancestors(&h), HashSet::from([dangling]));
        assert!(graph.parents(&dangling).is_none());
    }
}
