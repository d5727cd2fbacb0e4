//! Many-to-many link storage.
//!
//! Links live outside every field map, one set of id pairs per link table.
//! Both sides of a relation declare the same table with their columns
//! swapped; [`LinkTableInfo::our_index`] puts each id at a fixed position so
//! the two sides share a single stored pair.

use ormcache_core::LinkTableInfo;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Symmetric many-to-many relation storage keyed by link table name.
#[derive(Debug, Default, Clone)]
pub struct LinkTable {
    tables: HashMap<&'static str, HashSet<[i64; 2]>>,
}

fn pair(link: &LinkTableInfo, ours: i64, theirs: i64) -> [i64; 2] {
    let mut pair = [0; 2];
    pair[link.our_index()] = ours;
    pair[link.their_index()] = theirs;
    pair
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `ours` to every id of `theirs`.
    pub fn add(&mut self, link: &LinkTableInfo, ours: i64, theirs: &[i64]) {
        let set = self.tables.entry(link.table_name).or_default();
        for &id in theirs {
            set.insert(pair(link, ours, id));
        }
    }

    /// Drop every link of `ours` on this table.
    pub fn remove_all(&mut self, link: &LinkTableInfo, ours: i64) {
        let idx = link.our_index();
        if let Some(set) = self.tables.get_mut(link.table_name) {
            set.retain(|p| p[idx] != ours);
        }
    }

    /// Replace the links of `ours` with exactly `theirs`.
    pub fn replace(&mut self, link: &LinkTableInfo, ours: i64, theirs: &[i64]) {
        self.remove_all(link, ours);
        self.add(link, ours, theirs);
    }

    /// Ids linked to `ours`, ascending.
    pub fn linked(&self, link: &LinkTableInfo, ours: i64) -> Vec<i64> {
        let (our_idx, their_idx) = (link.our_index(), link.their_index());
        self.tables
            .get(link.table_name)
            .map(|set| {
                set.iter()
                    .filter(|p| p[our_idx] == ours)
                    .map(|p| p[their_idx])
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace `from` by `to` at position `index` of every pair in `table`.
    ///
    /// Used when a placeholder id is promoted to its database id.
    pub fn rewrite_id(&mut self, table: &str, index: usize, from: i64, to: i64) {
        let Some(set) = self.tables.get_mut(table) else {
            return;
        };
        let moved: Vec<[i64; 2]> = set.iter().filter(|p| p[index] == from).copied().collect();
        for mut p in moved {
            set.remove(&p);
            p[index] = to;
            set.insert(p);
        }
    }

    /// Number of stored pairs in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, HashSet::len)
    }
}
