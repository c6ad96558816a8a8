//! Database row types, mapping directly to SQLite rows.
//! Kept apart from the parley-types document model so the SQL layer stays
//! independent of how documents are interpreted.

use anyhow::{Context, Result};
use parley_types::document::Document;
use serde_json::Value;

pub struct DocumentRow {
    pub collection: String,
    pub id: String,
    pub data: String,
    pub updated_at: String,
}

impl DocumentRow {
    pub fn into_document(self) -> Result<Document> {
        let id = self
            .id
            .parse()
            .with_context(|| format!("corrupt id '{}' in {}", self.id, self.collection))?;
        match serde_json::from_str(&self.data)
            .with_context(|| format!("corrupt data on {} document '{}'", self.collection, self.id))?
        {
            Value::Object(data) => Ok(Document::new(id, data)),
            _ => anyhow::bail!("{} document '{}' is not a JSON object", self.collection, self.id),
        }
    }
}
