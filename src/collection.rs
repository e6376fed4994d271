use std::collections::BTreeMap;

use serde_json::Value;

use crate::document::DocumentId;
use crate::error::{Error, Result};
use crate::query;

/// In-memory collection of JSON documents keyed by `_id`.
pub struct Collection {
    name: String,
    docs: BTreeMap<DocumentId, Value>,
    next_id: DocumentId,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fresh_id(&mut self) -> Result<DocumentId> {
        while self.docs.contains_key(&self.next_id) {
            self.next_id = self
                .next_id
                .checked_add(1)
                .ok_or_else(|| Error::IdsExhausted(self.name.clone()))?;
        }
        Ok(self.next_id)
    }

    /// Insert a document and return the key it is stored under.
    ///
    /// An integer `_id` supplied by the caller becomes the key and must be
    /// unused. A missing `_id` is filled in with the next free key; any other
    /// `_id` value is kept as-is and the document gets a fresh key.
    pub fn insert(&mut self, mut data: Value) -> Result<DocumentId> {
        let supplied = match data.as_object() {
            Some(obj) => obj.get("_id").map(Value::as_u64),
            None => return Err(Error::NotAnObject),
        };

        let id = match supplied {
            Some(Some(id)) if self.docs.contains_key(&id) => return Err(Error::DuplicateId(id)),
            Some(Some(id)) => id,
            Some(None) => self.fresh_id()?,
            None => {
                let id = self.fresh_id()?;
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("_id".to_string(), Value::Number(id.into()));
                }
                id
            }
        };
        self.next_id = self.next_id.max(id.saturating_add(1));
        self.docs.insert(id, data);
        Ok(id)
    }

    /// Insert several documents. Either all of them are inserted or none
    /// (on a non-object document or a duplicate `_id`).
    pub fn insert_many(&mut self, docs: Vec<Value>) -> Result<Vec<DocumentId>> {
        let next_id = self.next_id;
        let mut inserted = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.insert(doc) {
                Ok(id) => inserted.push(id),
                Err(e) => {
                    for id in inserted {
                        self.docs.remove(&id);
                    }
                    self.next_id = next_id;
                    return Err(e);
                }
            }
        }
        Ok(inserted)
    }

    pub fn get(&self, id: DocumentId) -> Option<&Value> {
        self.docs.get(&id)
    }

    /// Documents matching `query_json`, in `_id` order.
    pub fn find(&self, query_json: &Value) -> Result<Vec<Value>> {
        let query = query::parse_query(query_json)?;
        Ok(self
            .docs
            .values()
            .filter(|doc| query::matches_value(&query, doc))
            .cloned()
            .collect())
    }

    pub fn all(&self) -> Vec<Value> {
        self.docs.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.docs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_assigns_sequential_ids() {
        let mut col = Collection::new("c");
        assert_eq!(col.insert(json!({"a": 1})).unwrap(), 1);
        assert_eq!(col.insert(json!({"a": 2})).unwrap(), 2);
        assert_eq!(col.get(2).unwrap(), &json!({"_id": 2, "a": 2}));
    }

    #[test]
    fn explicit_ids_are_kept_and_skipped() {
        let mut col = Collection::new("c");
        assert_eq!(col.insert(json!({"_id": 5})).unwrap(), 5);
        assert_eq!(col.insert(json!({})).unwrap(), 6);
        assert_eq!(col.count(), 2);
    }

    #[test]
    fn duplicate_and_foreign_ids() {
        let mut col = Collection::new("c");
        col.insert(json!({"_id": 3})).unwrap();
        assert!(matches!(col.insert(json!({"_id": 3})), Err(Error::DuplicateId(3))));
        let id = col.insert(json!({"_id": "abc"})).unwrap();
        assert_eq!(col.get(id).unwrap()["_id"], "abc");
    }

    #[test]
    fn exhausted_id_space_is_an_error() {
        let mut col = Collection::new("c");
        col.insert(json!({"_id": u64::MAX})).unwrap();
        assert!(matches!(col.insert(json!({})), Err(Error::IdsExhausted(_))));
        assert_eq!(col.count(), 1);
    }

    #[test]
    fn insert_many_is_all_or_nothing() {
        let mut col = Collection::new("c");
        assert!(col.insert_many(vec![json!({"a": 1}), json!(3)]).is_err());
        assert_eq!(col.count(), 0);
        assert_eq!(col.insert_many(vec![json!({}), json!({})]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn find_filters() {
        let mut col = Collection::new("c");
        col.insert_many(vec![json!({"v": 1}), json!({"v": 5}), json!({"v": 9})])
            .unwrap();
        assert_eq!(col.find(&json!({"v": {"$gt": 2}})).unwrap().len(), 2);
        assert_eq!(col.find(&json!({})).unwrap().len(), 3);
    }
}
