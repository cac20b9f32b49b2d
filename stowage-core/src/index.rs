//! In-memory identifier index.
//!
//! Three views over the same identifiers: a prefix trie for resolving shortened identifiers, one
//! name table per category and the snapshot to volume containment map. The index is a cache of
//! the metadata store and can always be rebuilt from it.

use std::collections::{BTreeMap, HashMap, HashSet};

use radix_trie::{Trie, TrieCommon, TrieKey};
use smol_str::SmolStr;
use stowage_common::{MetadataStore, Snapshot, StowageError, StowageResult, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Volume,
    Snapshot,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Volume => write!(f, "Volume"),
            Category::Snapshot => write!(f, "Snapshot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IdKey(SmolStr);

impl TrieKey for IdKey {
    fn encode_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

#[derive(Debug, Default)]
pub struct IdentifierIndex {
    ids: Trie<IdKey, Category>,
    names: HashMap<Category, HashMap<String, String>>,
    containment: HashMap<String, String>,
}

/// Ordered copy of the index contents, used to compare indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexView {
    pub ids: BTreeMap<String, Category>,
    pub names: BTreeMap<(Category, String), String>,
    pub containment: BTreeMap<String, String>,
}

impl IdentifierIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from every record in `store`. A duplicate identifier or name means the
    /// store is corrupt and fails the rebuild.
    pub fn rebuild_from_store(store: &MetadataStore) -> StowageResult<Self> {
        let mut index = Self::new();
        for volume in store.load_all()? {
            index.add_volume(&volume)?;
        }
        tracing::info!(
            volumes = index.count(Category::Volume),
            snapshots = index.count(Category::Snapshot),
            "Rebuilt identifier index"
        );
        Ok(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.get(&IdKey(SmolStr::new(id))).is_some()
    }

    pub fn category(&self, id: &str) -> Option<Category> {
        self.ids.get(&IdKey(SmolStr::new(id))).copied()
    }

    pub fn count(&self, category: Category) -> usize {
        self.ids.values().filter(|c| **c == category).count()
    }

    pub fn add(&mut self, id: &str, category: Category) -> StowageResult<()> {
        if self.contains(id) {
            return Err(StowageError::Conflict(format!("Identifier {id} already exists")));
        }
        self.ids.insert(IdKey(SmolStr::new(id)), category);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(&IdKey(SmolStr::new(id))).is_some()
    }

    /// Resolve a full identifier or a prefix of exactly one identifier.
    pub fn resolve(&self, prefix: &str) -> StowageResult<String> {
        if prefix.is_empty() {
            return Err(StowageError::NotFound("Empty identifier".to_string()));
        }
        if self.contains(prefix) {
            return Ok(prefix.to_string());
        }

        let key = IdKey(SmolStr::new(prefix));
        let mut matches = self
            .ids
            .get_raw_descendant(&key)
            .into_iter()
            .flat_map(|sub| sub.keys().cloned().collect::<Vec<_>>())
            .filter(|k| k.0.starts_with(prefix));

        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.0.to_string()),
            (Some(_), Some(_)) => Err(StowageError::AmbiguousIdentifier(format!(
                "{prefix} matches more than one identifier"
            ))),
            (None, _) => Err(StowageError::NotFound(format!("Identifier {prefix}"))),
        }
    }

    pub fn bind_name(&mut self, category: Category, name: &str, id: &str) -> StowageResult<()> {
        let names = self.names.entry(category).or_default();
        match names.get(name) {
            Some(bound) if bound == id => Ok(()),
            Some(bound) => Err(StowageError::Conflict(format!(
                "{category} name {name} is already used by {bound}"
            ))),
            None => {
                names.insert(name.to_string(), id.to_string());
                Ok(())
            }
        }
    }

    pub fn unbind_name(&mut self, category: Category, name: &str) {
        if let Some(names) = self.names.get_mut(&category) {
            names.remove(name);
        }
    }

    pub fn resolve_name(&self, category: Category, name: &str) -> StowageResult<String> {
        self.names
            .get(&category)
            .and_then(|names| names.get(name))
            .cloned()
            .ok_or_else(|| StowageError::NotFound(format!("{category} name {name}")))
    }

    pub fn bind_containment(&mut self, child: &str, parent: &str) -> StowageResult<()> {
        match self.containment.get(child) {
            Some(bound) if bound == parent => Ok(()),
            Some(bound) => Err(StowageError::Conflict(format!(
                "{child} already belongs to {bound}"
            ))),
            None => {
                self.containment.insert(child.to_string(), parent.to_string());
                Ok(())
            }
        }
    }

    pub fn parent_of(&self, child: &str) -> StowageResult<String> {
        self.containment
            .get(child)
            .cloned()
            .ok_or_else(|| StowageError::NotFound(format!("Parent of {child}")))
    }

    /// Resolve a name, full identifier or unique identifier prefix of the given category.
    pub fn lookup(&self, category: Category, reference: &str) -> StowageResult<String> {
        if let Ok(id) = self.resolve_name(category, reference) {
            return Ok(id);
        }
        let id = self.resolve(reference).map_err(|e| match e {
            StowageError::NotFound(_) => StowageError::NotFound(format!("{category} {reference}")),
            e => e,
        })?;
        match self.category(&id) {
            Some(found) if found == category => Ok(id),
            _ => Err(StowageError::NotFound(format!("{category} {reference}"))),
        }
    }

    fn check_name_free(&self, category: Category, name: &str) -> StowageResult<()> {
        match self.resolve_name(category, name) {
            Ok(bound) => Err(StowageError::Conflict(format!(
                "{category} name {name} is already used by {bound}"
            ))),
            Err(_) => Ok(()),
        }
    }

    /// Index a volume and its embedded snapshots. Nothing is changed when any of them conflicts.
    pub fn add_volume(&mut self, volume: &Volume) -> StowageResult<()> {
        if self.contains(&volume.id) {
            return Err(StowageError::Conflict(format!(
                "Identifier {} already exists",
                volume.id
            )));
        }
        if let Some(name) = &volume.name {
            self.check_name_free(Category::Volume, name)?;
        }

        let mut seen_ids = HashSet::new();
        let mut seen_names = HashSet::new();
        for snapshot in volume.snapshots.values() {
            if self.contains(&snapshot.id) || snapshot.id == volume.id || !seen_ids.insert(&snapshot.id) {
                return Err(StowageError::Conflict(format!(
                    "Identifier {} already exists",
                    snapshot.id
                )));
            }
            if let Some(name) = &snapshot.name {
                self.check_name_free(Category::Snapshot, name)?;
                if !seen_names.insert(name) {
                    return Err(StowageError::Conflict(format!(
                        "Snapshot name {name} is used twice in volume {}",
                        volume.id
                    )));
                }
            }
        }

        self.add(&volume.id, Category::Volume)?;
        if let Some(name) = &volume.name {
            self.bind_name(Category::Volume, name, &volume.id)?;
        }
        for snapshot in volume.snapshots.values() {
            self.insert_snapshot(snapshot, &volume.id)?;
        }
        Ok(())
    }

    pub fn remove_volume(&mut self, volume: &Volume) {
        for snapshot in volume.snapshots.values() {
            self.remove_snapshot(snapshot);
        }
        if let Some(name) = &volume.name {
            self.unbind_name(Category::Volume, name);
        }
        self.remove(&volume.id);
    }

    /// Index a new snapshot of `volume_id`. Nothing is changed on conflict.
    pub fn add_snapshot(&mut self, snapshot: &Snapshot, volume_id: &str) -> StowageResult<()> {
        if self.category(volume_id) != Some(Category::Volume) {
            return Err(StowageError::NotFound(format!("Volume {volume_id}")));
        }
        if self.contains(&snapshot.id) {
            return Err(StowageError::Conflict(format!(
                "Identifier {} already exists",
                snapshot.id
            )));
        }
        if let Some(name) = &snapshot.name {
            self.check_name_free(Category::Snapshot, name)?;
        }
        self.insert_snapshot(snapshot, volume_id)
    }

    fn insert_snapshot(&mut self, snapshot: &Snapshot, volume_id: &str) -> StowageResult<()> {
        self.add(&snapshot.id, Category::Snapshot)?;
        self.bind_containment(&snapshot.id, volume_id)?;
        if let Some(name) = &snapshot.name {
            self.bind_name(Category::Snapshot, name, &snapshot.id)?;
        }
        Ok(())
    }

    pub fn remove_snapshot(&mut self, snapshot: &Snapshot) {
        if let Some(name) = &snapshot.name {
            self.unbind_name(Category::Snapshot, name);
        }
        self.containment.remove(&snapshot.id);
        self.remove(&snapshot.id);
    }

    pub fn view(&self) -> IndexView {
        IndexView {
            ids: self
                .ids
                .iter()
                .map(|(k, c)| (k.0.to_string(), *c))
                .collect(),
            names: self
                .names
                .iter()
                .flat_map(|(category, names)| {
                    names
                        .iter()
                        .map(move |(name, id)| ((*category, name.clone()), id.clone()))
                })
                .collect(),
            containment: self
                .containment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use stowage_common::ErrorKind;

    use super::*;

    fn volume(id: &str, name: Option<&str>, snapshots: &[(&str, Option<&str>)]) -> Volume {
        let mut volume = Volume::new(id.to_string(), name.map(str::to_string), 1, "loopback");
        for (snapshot_id, snapshot_name) in snapshots {
            volume.snapshots.insert(
                snapshot_id.to_string(),
                Snapshot::new(
                    snapshot_id.to_string(),
                    snapshot_name.map(str::to_string),
                    id,
                ),
            );
        }
        volume
    }

    #[test]
    fn resolve_unique_prefixes() {
        let mut index = IdentifierIndex::new();
        for id in ["abc123", "abd456", "ff00"] {
            index.add(id, Category::Volume).unwrap();
        }

        assert_eq!(index.resolve("abc").unwrap(), "abc123");
        assert_eq!(index.resolve("f").unwrap(), "ff00");
        assert_eq!(index.resolve("ab").unwrap_err().kind(), ErrorKind::AmbiguousIdentifier);
        assert_eq!(index.resolve("x").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(index.resolve("abc1234").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(index.resolve("").unwrap_err().kind(), ErrorKind::NotFound);
        for id in ["abc123", "abd456", "ff00"] {
            assert_eq!(index.resolve(id).unwrap(), id);
        }
    }

    #[test]
    fn full_identifier_wins_over_longer_ones() {
        let mut index = IdentifierIndex::new();
        index.add("ab", Category::Volume).unwrap();
        index.add("abc", Category::Volume).unwrap();
        assert_eq!(index.resolve("ab").unwrap(), "ab");
        assert_eq!(index.resolve("abc").unwrap(), "abc");
        assert_eq!(index.resolve("a").unwrap_err().kind(), ErrorKind::AmbiguousIdentifier);
    }

    #[test]
    fn names_are_per_category() {
        let mut index = IdentifierIndex::new();
        index.add_volume(&volume("v1", Some("data"), &[("s1", Some("data"))])).unwrap();
        assert_eq!(index.resolve_name(Category::Volume, "data").unwrap(), "v1");
        assert_eq!(index.resolve_name(Category::Snapshot, "data").unwrap(), "s1");
        assert_eq!(index.parent_of("s1").unwrap(), "v1");

        let err = index
            .add_volume(&volume("v2", Some("data"), &[]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!index.contains("v2"));

        assert_eq!(index.lookup(Category::Volume, "data").unwrap(), "v1");
        assert_eq!(index.lookup(Category::Snapshot, "s").unwrap(), "s1");
        assert_eq!(
            index.lookup(Category::Volume, "s1").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn failed_add_leaves_index_untouched() {
        let mut index = IdentifierIndex::new();
        index.add_volume(&volume("v1", None, &[("s1", Some("nightly"))])).unwrap();
        let before = index.view();

        let clash = volume("v2", Some("fresh"), &[("s2", None), ("s3", Some("nightly"))]);
        assert_eq!(index.add_volume(&clash).unwrap_err().kind(), ErrorKind::Conflict);
        let dup = volume("v3", None, &[("s1", None)]);
        assert_eq!(index.add_volume(&dup).unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(index.view(), before);

        let snapshot = Snapshot::new("s4".to_string(), Some("nightly".to_string()), "v1");
        assert_eq!(
            index.add_snapshot(&snapshot, "v1").unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(index.view(), before);
    }

    #[test]
    fn remove_volume_unbinds_everything() {
        let mut index = IdentifierIndex::new();
        let v = volume("v1", Some("data"), &[("s1", Some("a")), ("s2", None)]);
        index.add_volume(&v).unwrap();
        index.remove_volume(&v);
        assert_eq!(index.view(), IndexView::default());
        assert_eq!(index.parent_of("s1").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn rebuild_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        let volumes = vec![
            volume("0a1", Some("alpha"), &[("5b2", Some("daily")), ("5b3", None)]),
            volume("0a2", None, &[("7c1", Some("weekly"))]),
            volume("9ff", Some("omega"), &[]),
        ];
        for v in &volumes {
            store.save(v).unwrap();
        }

        let rebuilt = IdentifierIndex::rebuild_from_store(&store).unwrap();
        let again = IdentifierIndex::rebuild_from_store(&store).unwrap();
        assert_eq!(rebuilt.view(), again.view());

        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let mut index = IdentifierIndex::new();
            for i in order {
                index.add_volume(&volumes[i]).unwrap();
            }
            assert_eq!(index.view(), rebuilt.view());
        }

        let view = rebuilt.view();
        assert_eq!(view.ids.len(), 6);
        assert_eq!(view.containment.get("7c1").map(String::as_str), Some("0a2"));
        assert_eq!(rebuilt.resolve("5b2").unwrap(), "5b2");
        assert_eq!(rebuilt.resolve("0a").unwrap_err().kind(), ErrorKind::AmbiguousIdentifier);
    }

    #[test]
    fn corrupt_store_fails_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.save(&volume("v1", Some("same"), &[])).unwrap();
        store.save(&volume("v2", Some("same"), &[])).unwrap();
        let err = IdentifierIndex::rebuild_from_store(&store).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
