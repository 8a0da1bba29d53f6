//! Union-find arena over message ids.
//!
//! Nodes are dense `u32` indices into parallel vectors; a side map turns a
//! message id into its node. Merges are permanent: there is no split.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::MessageId;

/// On-disk form of the arena. Derived indexes are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArenaSnapshot {
    ids: Vec<MessageId>,
    parent: Vec<u32>,
    rank: Vec<u8>,
    /// Thread key ("p:<provider id>" or "s:<subject>|<domain>") to a member.
    keys: BTreeMap<String, MessageId>,
    /// Normalized subject to the participant domains seen with it, in order.
    subject_domains: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ArenaSnapshot", into = "ArenaSnapshot")]
pub struct ThreadArena {
    ids: Vec<MessageId>,
    parent: Vec<u32>,
    rank: Vec<u8>,
    index: HashMap<MessageId, u32>,
    /// Valid at roots only: smallest member id and the member list.
    min_id: Vec<MessageId>,
    members: Vec<Vec<u32>>,
    keys: BTreeMap<String, MessageId>,
    subject_domains: BTreeMap<String, Vec<String>>,
}

impl From<ArenaSnapshot> for ThreadArena {
    fn from(snap: ArenaSnapshot) -> Self {
        let n = snap.ids.len().min(snap.parent.len());
        let mut arena = ThreadArena {
            ids: snap.ids[..n].to_vec(),
            parent: snap.parent[..n].to_vec(),
            rank: snap.rank,
            keys: snap.keys,
            subject_domains: snap.subject_domains,
            ..Default::default()
        };
        arena.rank.resize(n, 0);
        // Out-of-range parents would make `root` loop or panic; treat them as roots.
        for i in 0..n {
            if arena.parent[i] as usize >= n {
                arena.parent[i] = i as u32;
            }
        }
        arena.rebuild();
        arena
    }
}

impl From<ThreadArena> for ArenaSnapshot {
    fn from(arena: ThreadArena) -> Self {
        ArenaSnapshot {
            ids: arena.ids,
            parent: arena.parent,
            rank: arena.rank,
            keys: arena.keys,
            subject_domains: arena.subject_domains,
        }
    }
}

impl ThreadArena {
    fn rebuild(&mut self) {
        let n = self.ids.len();
        self.index = self.ids.iter().enumerate().map(|(i, id)| (*id, i as u32)).collect();
        self.min_id = self.ids.clone();
        self.members = vec![Vec::new(); n];
        for i in 0..n {
            let root = self.root(i as u32) as usize;
            self.members[root].push(i as u32);
            if self.ids[i] < self.min_id[root] {
                self.min_id[root] = self.ids[i];
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.index.contains_key(&id)
    }

    /// Node for `id`, creating a singleton if needed.
    pub fn ensure(&mut self, id: MessageId) -> u32 {
        if let Some(&node) = self.index.get(&id) {
            return node;
        }
        let node = self.ids.len() as u32;
        self.ids.push(id);
        self.parent.push(node);
        self.rank.push(0);
        self.min_id.push(id);
        self.members.push(vec![node]);
        self.index.insert(id, node);
        node
    }

    /// Root without path compression.
    fn root(&self, mut node: u32) -> u32 {
        while self.parent[node as usize] != node {
            node = self.parent[node as usize];
        }
        node
    }

    /// Root with path halving.
    fn find(&mut self, mut node: u32) -> u32 {
        while self.parent[node as usize] != node {
            let grandparent = self.parent[self.parent[node as usize] as usize];
            self.parent[node as usize] = grandparent;
            node = grandparent;
        }
        node
    }

    /// Merge the threads of `a` and `b`. Returns true if they were separate.
    pub fn union(&mut self, a: MessageId, b: MessageId) -> bool {
        let na = self.ensure(a);
        let nb = self.ensure(b);
        let ra = self.find(na);
        let rb = self.find(nb);
        if ra == rb {
            return false;
        }
        let (big, small) = match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => (rb, ra),
            std::cmp::Ordering::Greater => (ra, rb),
            std::cmp::Ordering::Equal => {
                self.rank[ra as usize] = self.rank[ra as usize].saturating_add(1);
                (ra, rb)
            }
        };
        self.parent[small as usize] = big;
        let moved = std::mem::take(&mut self.members[small as usize]);
        self.members[big as usize].extend(moved);
        let small_min = self.min_id[small as usize];
        if small_min < self.min_id[big as usize] {
            self.min_id[big as usize] = small_min;
        }
        true
    }

    pub fn same_thread(&self, a: MessageId, b: MessageId) -> bool {
        match (self.index.get(&a), self.index.get(&b)) {
            (Some(&na), Some(&nb)) => self.root(na) == self.root(nb),
            _ => false,
        }
    }

    /// Canonical thread id: `thr-<smallest member id>`.
    pub fn thread_id(&self, id: MessageId) -> Option<String> {
        let node = *self.index.get(&id)?;
        let root = self.root(node);
        Some(format!("thr-{}", self.min_id[root as usize]))
    }

    /// Every member of `id`'s thread, ascending.
    pub fn members_of(&self, id: MessageId) -> Vec<MessageId> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };
        let root = self.root(node);
        let mut out: Vec<MessageId> = self.members[root as usize]
            .iter()
            .map(|n| self.ids[*n as usize])
            .collect();
        out.sort_unstable();
        out
    }

    pub fn key_owner(&self, key: &str) -> Option<MessageId> {
        self.keys.get(key).copied()
    }

    /// Bind `key` to `id` unless it is already bound.
    pub fn bind_key(&mut self, key: &str, id: MessageId) {
        self.keys.entry(key.to_string()).or_insert(id);
    }

    pub fn subject_domains(&self, subject: &str) -> &[String] {
        self.subject_domains.get(subject).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remember that `domain` was seen with `subject` (first sighting wins the order).
    pub fn record_subject_domain(&mut self, subject: &str, domain: &str) {
        let seen = self.subject_domains.entry(subject.to_string()).or_default();
        if !seen.iter().any(|d| d == domain) {
            seen.push(domain.to_string());
        }
    }
}
