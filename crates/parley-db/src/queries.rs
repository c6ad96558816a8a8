use crate::Database;
use crate::models::DocumentRow;
use anyhow::Result;
use parley_types::document::Document;
use parley_types::events::{ChangeKind, ChangeNotice};
use parley_types::query::{Collection, Filter, Mutation, Query};
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

impl Database {
    // -- Documents --

    pub fn insert_document(
        &self,
        collection: Collection,
        id: Uuid,
        data: &Map<String, Value>,
    ) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)",
                (collection.as_str(), id.to_string(), json),
            )?;
            Ok(())
        })
    }

    /// Merge `fields` into an existing document. Returns false if it does not exist.
    pub fn update_document(
        &self,
        collection: Collection,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(row) = query_document(&tx, collection, id)? else {
                return Ok(false);
            };

            let mut doc = row.into_document()?;
            for (key, value) in fields {
                doc.data.insert(key.clone(), value.clone());
            }

            tx.execute(
                "UPDATE documents SET data = ?3, updated_at = datetime('now')
                 WHERE collection = ?1 AND id = ?2",
                (
                    collection.as_str(),
                    id.to_string(),
                    serde_json::to_string(&doc.data)?,
                ),
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Returns false if the document did not exist.
    pub fn delete_document(&self, collection: Collection, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                (collection.as_str(), id.to_string()),
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_document(&self, collection: Collection, id: Uuid) -> Result<Option<Document>> {
        self.with_conn(|conn| query_document(conn, collection, id))?
            .map(DocumentRow::into_document)
            .transpose()
    }

    /// Evaluate a query against a collection. Rows that fail to decode are
    /// skipped with a warning rather than failing the whole read.
    pub fn run_query(&self, query: &Query) -> Result<Vec<Document>> {
        // Single-document lookups skip the collection scan.
        if let Some(Filter::Eq(field, Value::String(id))) = &query.filter {
            if field == "id" {
                let Ok(id) = id.parse::<Uuid>() else {
                    return Ok(vec![]);
                };
                return Ok(query.evaluate(self.get_document(query.collection, id)?));
            }
        }

        let rows = self.with_conn(|conn| query_collection(conn, query.collection))?;
        let docs = rows.into_iter().filter_map(|row| match row.into_document() {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("Skipping corrupt document: {:#}", e);
                None
            }
        });
        Ok(query.evaluate(docs))
    }

    /// Apply a mutation. Returns `None` when an update or delete targets a
    /// missing document.
    pub fn apply_mutation(&self, mutation: &Mutation) -> Result<Option<ChangeNotice>> {
        let notice = match mutation {
            Mutation::Insert { collection, data } => {
                let id = Uuid::new_v4();
                self.insert_document(*collection, id, data)?;
                Some((*collection, id, ChangeKind::Added))
            }
            Mutation::Update {
                collection,
                id,
                fields,
            } => self
                .update_document(*collection, *id, fields)?
                .then_some((*collection, *id, ChangeKind::Modified)),
            Mutation::Delete { collection, id } => self
                .delete_document(*collection, *id)?
                .then_some((*collection, *id, ChangeKind::Removed)),
        };

        Ok(notice.map(|(collection, id, kind)| ChangeNotice {
            collection,
            id,
            kind,
        }))
    }
}

fn query_document(conn: &Connection, collection: Collection, id: Uuid) -> Result<Option<DocumentRow>> {
    let mut stmt = conn.prepare(
        "SELECT collection, id, data, updated_at FROM documents WHERE collection = ?1 AND id = ?2",
    )?;

    let row = stmt
        .query_row((collection.as_str(), id.to_string()), |row| {
            Ok(DocumentRow {
                collection: row.get(0)?,
                id: row.get(1)?,
                data: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_collection(conn: &Connection, collection: Collection) -> Result<Vec<DocumentRow>> {
    let mut stmt = conn.prepare(
        "SELECT collection, id, data, updated_at FROM documents WHERE collection = ?1",
    )?;

    let rows = stmt
        .query_map([collection.as_str()], |row| {
            Ok(DocumentRow {
                collection: row.get(0)?,
                id: row.get(1)?,
                data: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn update_merges_top_level_fields() {
        let db = Database::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.insert_document(Collection::Messages, id, &object(json!({ "text": "a", "edited": false })))
            .unwrap();

        assert!(db
            .update_document(Collection::Messages, id, &object(json!({ "edited": true })))
            .unwrap());

        let doc = db.get_document(Collection::Messages, id).unwrap().unwrap();
        assert_eq!(doc.field("text"), json!("a"));
        assert_eq!(doc.field("edited"), json!(true));
    }

    #[test]
    fn missing_targets_report_no_change() {
        let db = Database::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        assert!(db.apply_mutation(&Mutation::delete(Collection::Users, id)).unwrap().is_none());
        assert!(db
            .apply_mutation(&Mutation::update(Collection::Users, id, Map::new()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn collections_are_isolated() {
        let db = Database::open_in_memory().unwrap();
        let notice = db
            .apply_mutation(&Mutation::Insert {
                collection: Collection::Users,
                data: object(json!({ "username": "ana" })),
            })
            .unwrap()
            .unwrap();
        assert_eq!(notice.kind, ChangeKind::Added);

        let users = db.run_query(&Query::new(Collection::Users)).unwrap();
        let messages = db.run_query(&Query::new(Collection::Messages)).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, notice.id);
        assert!(messages.is_empty());
    }

    #[test]
    fn id_lookup_uses_the_primary_key() {
        let db = Database::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        db.insert_document(Collection::Messages, id, &object(json!({ "text": "x" }))).unwrap();

        let query = Query::new(Collection::Messages).filter(Filter::eq("id", id));
        assert_eq!(db.run_query(&query).unwrap().len(), 1);

        let bogus = Query::new(Collection::Messages).filter(Filter::eq("id", "not-a-uuid"));
        assert!(db.run_query(&bogus).unwrap().is_empty());
    }

    #[test]
    fn duplicate_channel_names_violate_the_index() {
        let db = Database::open_in_memory().unwrap();
        let data = object(json!({ "name": "general" }));
        db.insert_document(Collection::Channels, Uuid::new_v4(), &data).unwrap();
        assert!(db.insert_document(Collection::Channels, Uuid::new_v4(), &data).is_err());
        // Names are only unique among channels.
        db.insert_document(Collection::Users, Uuid::new_v4(), &data).unwrap();
    }
}
