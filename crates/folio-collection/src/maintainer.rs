//! Index maintenance
//!
//! The collection drives all index updates through a uniform
//! `IndexMaintainer` vector instead of per-index closure arrays. One
//! implementation exists today, backed by the core `SecondaryIndex`;
//! the trait is the seam for future index kinds.

use folio_core::{
    FolioResult, IndexDefinition, IndexKey, PortableIndex, SecondaryIndex,
};

/// Uniform index-maintenance hooks driven by the collection engine.
///
/// `ensure` materializes the empty tree; until it runs the maintainer
/// holds only its definition. `check_insert` must not mutate: the engine
/// validates every index before touching any tree so failed writes leave
/// no partial index state behind.
pub trait IndexMaintainer: Send {
    /// The definition this maintainer enforces.
    fn definition(&self) -> &IndexDefinition;

    /// Materialize the (empty) tree.
    fn ensure(&mut self);

    /// Validate an insert without mutating.
    fn check_insert(&self, key: &IndexKey, primary: &IndexKey) -> FolioResult<()>;

    /// Record an insert.
    fn on_insert(&mut self, key: IndexKey, primary: IndexKey);

    /// Record a value change: remove the old payload, insert the new.
    /// `None` on either side means the record was / is not indexed
    /// (sparse null).
    fn on_update(
        &mut self,
        old: Option<&IndexKey>,
        new: Option<IndexKey>,
        old_primary: &IndexKey,
        new_primary: &IndexKey,
    ) -> FolioResult<()>;

    /// Record a removal.
    fn on_remove(&mut self, key: &IndexKey, primary: &IndexKey);

    /// Drop the tree contents and re-insert from a scan.
    fn rebuild(&mut self, entries: &mut dyn Iterator<Item = (IndexKey, IndexKey)>);

    /// Primary keys stored under a key.
    fn lookup(&self, key: &IndexKey) -> Vec<IndexKey>;

    /// `(key, payloads)` pairs with `key <= end`, in key order.
    fn range_through(&self, end: &IndexKey) -> Vec<(IndexKey, Vec<IndexKey>)>;

    /// Total payload count.
    fn len(&self) -> usize;

    /// True when the tree holds nothing.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten to the portable persisted form.
    fn to_portable(&self) -> PortableIndex;

    /// Replace the tree from a portable form.
    fn load_portable(&mut self, portable: &PortableIndex);

    /// Drop every entry, keeping the definition.
    fn clear(&mut self);
}

/// The standard maintainer over an ordered-tree index.
#[derive(Debug)]
pub struct BTreeIndexMaintainer {
    def: IndexDefinition,
    index: Option<SecondaryIndex>,
}

impl BTreeIndexMaintainer {
    /// Maintainer for a definition; the tree materializes on `ensure`.
    pub fn new(def: IndexDefinition) -> Self {
        BTreeIndexMaintainer { def, index: None }
    }

    fn tree(&self) -> Option<&SecondaryIndex> {
        self.index.as_ref()
    }

    fn tree_mut(&mut self) -> &mut SecondaryIndex {
        // ensure() runs during collection construction, before any write
        self.index
            .get_or_insert_with(|| SecondaryIndex::for_definition(&self.def))
    }
}

impl IndexMaintainer for BTreeIndexMaintainer {
    fn definition(&self) -> &IndexDefinition {
        &self.def
    }

    fn ensure(&mut self) {
        if self.index.is_none() {
            self.index = Some(SecondaryIndex::for_definition(&self.def));
        }
    }

    fn check_insert(&self, key: &IndexKey, primary: &IndexKey) -> FolioResult<()> {
        match self.tree() {
            Some(tree) => tree.check_insert(key, primary),
            None => Ok(()),
        }
    }

    fn on_insert(&mut self, key: IndexKey, primary: IndexKey) {
        self.tree_mut().insert(key, primary);
    }

    fn on_update(
        &mut self,
        old: Option<&IndexKey>,
        new: Option<IndexKey>,
        old_primary: &IndexKey,
        new_primary: &IndexKey,
    ) -> FolioResult<()> {
        // a pure payload swap (same key, new primary) is not a violation
        let same_key = matches!((old, &new), (Some(o), Some(n)) if o == n);
        if !same_key {
            if let Some(new_key) = &new {
                self.tree_mut().check_insert(new_key, new_primary)?;
            }
        }
        if let Some(old_key) = old {
            self.tree_mut().remove(old_key, old_primary);
        }
        if let Some(new_key) = new {
            self.tree_mut().insert(new_key, new_primary.clone());
        }
        Ok(())
    }

    fn on_remove(&mut self, key: &IndexKey, primary: &IndexKey) {
        self.tree_mut().remove(key, primary);
    }

    fn rebuild(&mut self, entries: &mut dyn Iterator<Item = (IndexKey, IndexKey)>) {
        let tree = self.tree_mut();
        tree.clear();
        for (key, primary) in entries {
            tree.insert(key, primary);
        }
    }

    fn lookup(&self, key: &IndexKey) -> Vec<IndexKey> {
        self.tree()
            .map(|tree| tree.lookup(key).to_vec())
            .unwrap_or_default()
    }

    fn range_through(&self, end: &IndexKey) -> Vec<(IndexKey, Vec<IndexKey>)> {
        self.tree()
            .map(|tree| tree.range_through(end))
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.tree().map(|tree| tree.len()).unwrap_or(0)
    }

    fn to_portable(&self) -> PortableIndex {
        match self.tree() {
            Some(tree) => tree.to_portable(&self.def),
            None => PortableIndex {
                def: self.def.clone(),
                entries: Vec::new(),
            },
        }
    }

    fn load_portable(&mut self, portable: &PortableIndex) {
        self.index = Some(SecondaryIndex::from_portable(portable));
    }

    fn clear(&mut self) {
        if let Some(tree) = self.index.as_mut() {
            tree.clear();
        }
    }
}
