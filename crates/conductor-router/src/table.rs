use std::collections::HashMap;

/// A longest-prefix-match table over dot-separated address components.
///
/// Prefix boundaries honour dots: a route at `example.a` matches
/// `example.a.b` but not `example.ab`. The empty prefix is the default
/// route. Each prefix holds at most one value, so resolution never needs a
/// tie-break. Insertion and resolution walk one trie node per address
/// component.
#[derive(Clone, Debug)]
pub struct RoutingTable<T> {
    root: Node<T>,
    len: usize,
}

#[derive(Clone, Debug)]
struct Node<T> {
    value: Option<T>,
    children: HashMap<String, Node<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            value: None,
            children: HashMap::new(),
        }
    }
}

impl<T> Default for RoutingTable<T> {
    fn default() -> Self {
        RoutingTable {
            root: Node::default(),
            len: 0,
        }
    }
}

/// Trailing dots are tolerated on keys (`example.` and `example` are the
/// same prefix); the empty string addresses the root.
fn segments(prefix: &str) -> impl Iterator<Item = &str> {
    prefix
        .trim_end_matches('.')
        .split('.')
        .filter(|segment| !segment.is_empty())
}

impl<T> RoutingTable<T> {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the value at exactly this prefix, replacing any previous one.
    /// Returns the previous value if the prefix was already present.
    pub fn insert(&mut self, prefix: &str, value: T) -> Option<T> {
        let mut node = &mut self.root;
        for segment in segments(prefix) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Removes the value at exactly this prefix. Empty branches are pruned
    /// so the trie never outgrows the live prefix set.
    pub fn delete(&mut self, prefix: &str) -> Option<T> {
        let segments: Vec<&str> = segments(prefix).collect();
        let removed = Self::delete_in(&mut self.root, &segments);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn delete_in(node: &mut Node<T>, segments: &[&str]) -> Option<T> {
        match segments.split_first() {
            None => node.value.take(),
            Some((head, rest)) => {
                let child = node.children.get_mut(*head)?;
                let removed = Self::delete_in(child, rest);
                if removed.is_some() && child.value.is_none() && child.children.is_empty() {
                    node.children.remove(*head);
                }
                removed
            }
        }
    }

    /// Returns the value at exactly this prefix, without prefix matching.
    pub fn get(&self, prefix: &str) -> Option<&T> {
        let mut node = &self.root;
        for segment in segments(prefix) {
            node = node.children.get(segment)?;
        }
        node.value.as_ref()
    }

    /// Returns the value at the longest prefix that is equal to `address`
    /// or a dot-aligned ancestor of it.
    pub fn resolve(&self, address: &str) -> Option<&T> {
        let mut node = &self.root;
        let mut best = node.value.as_ref();
        for segment in segments(address) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if child.value.is_some() {
                        best = child.value.as_ref();
                    }
                }
                None => break,
            }
        }
        best
    }

    /// All live prefixes in lexicographic order.
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes = Vec::with_capacity(self.len);
        let mut path = String::new();
        Self::collect(&self.root, &mut path, &mut prefixes);
        prefixes.sort();
        prefixes
    }

    fn collect(node: &Node<T>, path: &mut String, prefixes: &mut Vec<String>) {
        if node.value.is_some() {
            prefixes.push(path.clone());
        }
        for (segment, child) in node.children.iter() {
            let rollback = path.len();
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(segment);
            Self::collect(child, path, prefixes);
            path.truncate(rollback);
        }
    }
}
