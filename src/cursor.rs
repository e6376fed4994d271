//! Result cursors and the typed mapping layer on top of them.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// Raw result stream of an aggregation. Each call pulls the next batch;
/// `Ok(None)` means the cursor is exhausted.
pub trait Cursor {
    fn next_batch(&mut self) -> Result<Option<Vec<Value>>>;
}

/// Cursor over documents already materialized by the embedded engine,
/// handed out `batch_size` at a time.
pub struct BatchCursor {
    docs: std::vec::IntoIter<Value>,
    batch_size: usize,
}

impl BatchCursor {
    pub fn new(docs: Vec<Value>, batch_size: usize) -> Self {
        Self {
            docs: docs.into_iter(),
            batch_size: batch_size.max(1),
        }
    }
}

impl Cursor for BatchCursor {
    fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        let batch: Vec<Value> = self.docs.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

/// Per-stream cache: identical documents sharing an `_id` within one result
/// stream map to the same record instance. A document whose `_id` is cached
/// but whose content differs (an unwound array element, say) is not a hit.
pub struct EntityCache<U> {
    entries: HashMap<(String, String), (Value, Arc<U>)>,
}

impl<U> EntityCache<U> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The record cached under `(collection, id)`, if it was mapped from a
    /// document equal to `doc`.
    pub fn get(&self, collection: &str, id: &str, doc: &Value) -> Option<Arc<U>> {
        self.entries
            .get(&(collection.to_string(), id.to_string()))
            .filter(|(cached, _)| cached == doc)
            .map(|(_, record)| Arc::clone(record))
    }

    /// Cache `record` unless another document already holds this `_id`.
    pub fn put(&mut self, collection: &str, id: String, doc: Value, record: Arc<U>) {
        self.entries
            .entry((collection.to_string(), id))
            .or_insert((doc, record));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<U> Default for EntityCache<U> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy, single-pass sequence of typed results.
///
/// A new batch is requested from the cursor only once the buffered one is
/// drained. Dropping the iterator drops the cursor.
pub struct MappedResults<U> {
    cursor: Box<dyn Cursor>,
    collection: String,
    cache: EntityCache<U>,
    buffer: VecDeque<Value>,
    exhausted: bool,
    _target: PhantomData<fn() -> U>,
}

impl<U: DeserializeOwned> MappedResults<U> {
    pub fn new(cursor: Box<dyn Cursor>, collection: impl Into<String>, cache: EntityCache<U>) -> Self {
        Self {
            cursor,
            collection: collection.into(),
            cache,
            buffer: VecDeque::new(),
            exhausted: false,
            _target: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn cache(&self) -> &EntityCache<U> {
        &self.cache
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            match self.cursor.next_batch()? {
                Some(batch) => {
                    debug!(collection = %self.collection, size = batch.len(), "pulled result batch");
                    self.buffer.extend(batch);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    fn map_document(&mut self, doc: Value) -> Result<Arc<U>> {
        let key = doc.get("_id").map(Value::to_string);
        let Some(id) = key else {
            return Ok(Arc::new(serde_json::from_value::<U>(doc)?));
        };
        if let Some(hit) = self.cache.get(&self.collection, &id, &doc) {
            return Ok(hit);
        }
        let record = Arc::new(serde_json::from_value::<U>(doc.clone())?);
        self.cache.put(&self.collection, id, doc, Arc::clone(&record));
        Ok(record)
    }
}

impl<U: DeserializeOwned> Iterator for MappedResults<U> {
    type Item = Result<Arc<U>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            // A failed cursor yields its error once and then ends the stream
            self.exhausted = true;
            return Some(Err(e));
        }
        let doc = self.buffer.pop_front()?;
        Some(self.map_document(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde::Deserialize;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        _id: i64,
        v: i64,
    }

    /// Counts how many batches were requested.
    struct CountingCursor {
        inner: BatchCursor,
        pulls: Rc<Cell<usize>>,
    }

    impl Cursor for CountingCursor {
        fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
            self.pulls.set(self.pulls.get() + 1);
            self.inner.next_batch()
        }
    }

    struct FailingCursor;

    impl Cursor for FailingCursor {
        fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
            Err(Error::InvalidPipeline("boom".into()))
        }
    }

    fn rows(n: i64) -> Vec<Value> {
        (0..n).map(|i| json!({"_id": i, "v": i * 10})).collect()
    }

    #[test]
    fn batch_cursor_chunks() {
        let mut cursor = BatchCursor::new(rows(5), 2);
        assert_eq!(cursor.next_batch().unwrap().unwrap().len(), 2);
        assert_eq!(cursor.next_batch().unwrap().unwrap().len(), 2);
        assert_eq!(cursor.next_batch().unwrap().unwrap().len(), 1);
        assert!(cursor.next_batch().unwrap().is_none());
    }

    #[test]
    fn results_pull_batches_lazily() {
        let pulls = Rc::new(Cell::new(0));
        let cursor = CountingCursor {
            inner: BatchCursor::new(rows(5), 2),
            pulls: Rc::clone(&pulls),
        };
        let mut results: MappedResults<Row> =
            MappedResults::new(Box::new(cursor), "rows", EntityCache::new());
        assert_eq!(pulls.get(), 0);

        assert_eq!(results.next().unwrap().unwrap().v, 0);
        assert_eq!(pulls.get(), 1);
        results.next().unwrap().unwrap();
        assert_eq!(pulls.get(), 1);
        results.next().unwrap().unwrap();
        assert_eq!(pulls.get(), 2);

        assert_eq!(results.by_ref().count(), 2);
        assert!(results.next().is_none());
    }

    #[test]
    fn repeated_ids_share_one_record() {
        let docs = vec![
            json!({"_id": 1, "v": 10}),
            json!({"_id": 1, "v": 10}),
            json!({"_id": 2, "v": 20}),
        ];
        let results: MappedResults<Row> =
            MappedResults::new(Box::new(BatchCursor::new(docs, 10)), "rows", EntityCache::new());
        let records: Vec<Arc<Row>> = results.map(|r| r.unwrap()).collect();
        assert!(Arc::ptr_eq(&records[0], &records[1]));
        assert!(!Arc::ptr_eq(&records[0], &records[2]));
    }

    #[test]
    fn same_id_with_different_content_is_mapped_separately() {
        let docs = vec![
            json!({"_id": 1, "v": 10}),
            json!({"_id": 1, "v": 11}),
            json!({"_id": 1, "v": 10}),
        ];
        let results: MappedResults<Row> =
            MappedResults::new(Box::new(BatchCursor::new(docs, 10)), "rows", EntityCache::new());
        let records: Vec<Arc<Row>> = results.map(|r| r.unwrap()).collect();
        let values: Vec<i64> = records.iter().map(|r| r.v).collect();
        assert_eq!(values, vec![10, 11, 10]);
        assert!(!Arc::ptr_eq(&records[0], &records[1]));
        assert!(Arc::ptr_eq(&records[0], &records[2]));
    }

    #[test]
    fn mapping_errors_surface_per_item() {
        let docs = vec![json!({"_id": 1, "v": "not a number"}), json!({"_id": 2, "v": 2})];
        let mut results: MappedResults<Row> =
            MappedResults::new(Box::new(BatchCursor::new(docs, 10)), "rows", EntityCache::new());
        assert!(matches!(results.next(), Some(Err(Error::Json(_)))));
        assert_eq!(*results.next().unwrap().unwrap(), Row { _id: 2, v: 2 });
    }

    #[test]
    fn cursor_failure_ends_stream() {
        let mut results: MappedResults<Row> =
            MappedResults::new(Box::new(FailingCursor), "rows", EntityCache::new());
        assert!(matches!(results.next(), Some(Err(Error::InvalidPipeline(_)))));
        assert!(results.next().is_none());
    }
}
