use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A stored document: store-assigned id plus its JSON fields.
///
/// The id is kept outside `data`, the way the store keys it. `decode`
/// folds it back in so typed models can carry an `id` field.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: Uuid, data: Map<String, Value>) -> Self {
        Self { id, data }
    }

    /// Build a document from a typed model. An `id` field on the model is
    /// dropped from `data`.
    pub fn from_model<T: Serialize>(id: Uuid, model: &T) -> serde_json::Result<Self> {
        let mut data = to_object(model)?;
        data.remove("id");
        Ok(Self { id, data })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let mut data = self.data.clone();
        data.insert("id".into(), Value::String(self.id.to_string()));
        serde_json::from_value(Value::Object(data))
    }

    /// Field lookup; `id` resolves to the document id. Missing fields read as null.
    pub fn field(&self, name: &str) -> Value {
        if name == "id" {
            return Value::String(self.id.to_string());
        }
        self.data.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// Serialize a model into a JSON object, rejecting non-object values.
pub fn to_object<T: Serialize>(model: &T) -> serde_json::Result<Map<String, Value>> {
    match serde_json::to_value(model)? {
        Value::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Uuid,
        body: String,
    }

    #[test]
    fn id_lives_outside_data() {
        let id = Uuid::new_v4();
        let doc = Document::from_model(id, &Note { id, body: "x".into() }).unwrap();
        assert!(!doc.data.contains_key("id"));
        assert_eq!(doc.field("id"), Value::String(id.to_string()));
        assert_eq!(doc.field("missing"), Value::Null);

        let note: Note = doc.decode().unwrap();
        assert_eq!(note.id, id);
        assert_eq!(note.body, "x");
    }

    #[test]
    fn non_object_models_are_rejected() {
        assert!(to_object(&42).is_err());
    }
}
