use uuid::Uuid;

use crate::document::Document;
use crate::query::{Collection, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: Uuid,
}

/// One delivery from a live subscription: the full ordered result set, plus
/// what changed since the previous delivery on the same subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    pub changes: Vec<DocumentChange>,
}

impl Snapshot {
    /// First delivery of a subscription: every document counts as added.
    pub fn initial(documents: Vec<Document>) -> Self {
        let changes = documents
            .iter()
            .map(|d| DocumentChange {
                kind: ChangeKind::Added,
                id: d.id,
            })
            .collect();
        Self { documents, changes }
    }

    pub fn removed(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Removed)
            .map(|c| c.id)
    }
}

/// Broadcast by the store after every committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: Collection,
    pub id: Uuid,
    pub kind: ChangeKind,
}

impl ChangeNotice {
    /// Whether a subscription running `query` needs to re-evaluate.
    pub fn concerns(&self, query: &Query) -> bool {
        self.collection == query.collection
    }
}
