//! Prefix index over slash-delimited service names.
//!
//! Cardinality is small (hundreds of services), so one lock over the whole
//! tree is enough. The invariants that matter: a searcher never sees a torn
//! path and never gets back a name whose terminal is unset.

use std::collections::HashMap;
use std::sync::Mutex;

use gantry_core::{split_segments, Result};

#[derive(Default)]
struct TrieNode {
    set: bool,
    path: String,
    children: HashMap<String, TrieNode>,
}

impl TrieNode {
    fn collect(&self, out: &mut Vec<String>) {
        if self.set {
            out.push(self.path.clone());
        }
        for child in self.children.values() {
            child.collect(out);
        }
    }

    fn delete(&mut self, segments: &[&str]) {
        if segments.is_empty() {
            self.set = false;
            return;
        }
        if let Some(child) = self.children.get_mut(segments[0]) {
            child.delete(&segments[1..]);
            if !child.set && child.children.is_empty() {
                self.children.remove(segments[0]);
            }
        }
    }
}

#[derive(Default)]
pub struct WordTrie {
    root: Mutex<TrieNode>,
}

impl WordTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a path, marking its terminal node. Idempotent.
    pub fn add(&self, path: &str) -> Result<()> {
        let segments = split_segments(path)?;
        if segments.is_empty() {
            return Ok(());
        }
        let mut root = self.lock();
        let mut node = &mut *root;
        for segment in &segments {
            node = node.children.entry((*segment).to_string()).or_default();
        }
        node.set = true;
        node.path = path.strip_prefix('/').unwrap_or(path).to_string();
        Ok(())
    }

    /// Unset a path's terminal and prune empty nodes upward. Deleting a path
    /// that was never added is a no-op.
    pub fn delete(&self, path: &str) -> Result<()> {
        let segments = split_segments(path)?;
        if segments.is_empty() {
            return Ok(());
        }
        self.lock().delete(&segments);
        Ok(())
    }

    /// Every set path starting with `prefix`, segment-aligned. An empty
    /// prefix enumerates all set paths. Order is unspecified.
    #[must_use]
    pub fn search(&self, prefix: &str) -> Vec<String> {
        let Ok(segments) = split_segments(prefix) else {
            return Vec::new();
        };
        let root = self.lock();
        let mut node = &*root;
        for segment in &segments {
            match node.children.get(*segment) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        let mut matches = Vec::new();
        node.collect(&mut matches);
        matches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrieNode> {
        match self.root.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn as_set(v: Vec<String>) -> HashSet<String> {
        v.into_iter().collect()
    }

    #[test]
    fn search_is_segment_aligned() {
        let trie = WordTrie::new();
        trie.add("a/b/1").unwrap();
        trie.add("a/b/2").unwrap();
        trie.add("a/bc/3").unwrap();

        assert_eq!(
            as_set(trie.search("a/b")),
            as_set(vec!["a/b/1".into(), "a/b/2".into()])
        );
        assert_eq!(as_set(trie.search("a/bc")), as_set(vec!["a/bc/3".into()]));
    }

    #[test]
    fn search_includes_the_prefix_itself_when_set() {
        let trie = WordTrie::new();
        trie.add("a/b").unwrap();
        trie.add("a/b/1").unwrap();

        assert_eq!(
            as_set(trie.search("a/b")),
            as_set(vec!["a/b".into(), "a/b/1".into()])
        );
    }

    #[test]
    fn empty_prefix_enumerates_everything() {
        let trie = WordTrie::new();
        trie.add("a/1").unwrap();
        trie.add("b/2").unwrap();
        assert_eq!(trie.search("").len(), 2);
    }

    #[test]
    fn delete_prunes_but_keeps_siblings() {
        let trie = WordTrie::new();
        trie.add("a/b/1").unwrap();
        trie.add("a/b/2").unwrap();

        trie.delete("a/b/1").unwrap();
        assert_eq!(as_set(trie.search("a")), as_set(vec!["a/b/2".into()]));

        trie.delete("a/b/2").unwrap();
        assert!(trie.search("").is_empty());
    }

    #[test]
    fn delete_unknown_path_is_a_noop() {
        let trie = WordTrie::new();
        trie.add("a/b").unwrap();
        trie.delete("a/x/y").unwrap();
        trie.delete("z").unwrap();
        assert_eq!(as_set(trie.search("")), as_set(vec!["a/b".into()]));
    }

    #[test]
    fn deleting_intermediate_keeps_descendants() {
        let trie = WordTrie::new();
        trie.add("a/b").unwrap();
        trie.add("a/b/c").unwrap();

        trie.delete("a/b").unwrap();
        assert_eq!(as_set(trie.search("")), as_set(vec!["a/b/c".into()]));
    }

    #[test]
    fn add_rejects_empty_segments() {
        let trie = WordTrie::new();
        assert!(trie.add("a//b").is_err());
        assert!(trie.add("/a/b").is_ok());
    }

    #[test]
    fn add_delete_sequences_match_naive_model() {
        let trie = WordTrie::new();
        let mut model: HashSet<String> = HashSet::new();
        let ops = [
            ("add", "s/1"),
            ("add", "s/2"),
            ("add", "t/x/1"),
            ("del", "s/1"),
            ("add", "s/1"),
            ("del", "t/x/1"),
            ("del", "t/x/1"),
            ("add", "t/x/2"),
            ("del", "s/2"),
        ];
        for (op, path) in ops {
            match op {
                "add" => {
                    trie.add(path).unwrap();
                    model.insert(path.to_string());
                }
                _ => {
                    trie.delete(path).unwrap();
                    model.remove(path);
                }
            }
            let live: HashSet<String> = trie.search("").into_iter().collect();
            assert_eq!(live, model, "after {op} {path}");
        }
    }
}
