use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::aggregation::{AggregationPipeline, AggregationSource};
use crate::collection::Collection;
use crate::cursor::{BatchCursor, Cursor};
use crate::document::DocumentId;
use crate::error::{Error, Result};
use crate::options::AggregationOptions;
use crate::pipeline::Pipeline;
use crate::schema::Entity;

/// Embedded document store answering aggregation requests in memory.
///
/// Thread-safe: a `RwLock` guards the collections map and each collection
/// has its own `RwLock`, so reads on different collections never block each
/// other.
#[derive(Default)]
pub struct Datastore {
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an Arc to a collection's RwLock, auto-creating if needed.
    fn get_or_create_collection(&self, name: &str) -> Arc<RwLock<Collection>> {
        {
            let cols = self.collections.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(col) = cols.get(name) {
                return Arc::clone(col);
            }
        }
        let mut cols = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            cols.entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Collection::new(name)))),
        )
    }

    pub fn list_collections(&self) -> Vec<String> {
        let cols = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        cols.keys().cloned().collect()
    }

    pub fn drop_collection(&self, name: &str) -> bool {
        let mut cols = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        cols.remove(name).is_some()
    }

    pub fn insert(&self, collection: &str, doc: Value) -> Result<DocumentId> {
        let col = self.get_or_create_collection(collection);
        let mut col = col.write().unwrap_or_else(PoisonError::into_inner);
        col.insert(doc)
    }

    pub fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<DocumentId>> {
        let col = self.get_or_create_collection(collection);
        let mut col = col.write().unwrap_or_else(PoisonError::into_inner);
        col.insert_many(docs)
    }

    pub fn find(&self, collection: &str, query: &Value) -> Result<Vec<Value>> {
        let col = self.get_or_create_collection(collection);
        let col = col.read().unwrap_or_else(PoisonError::into_inner);
        col.find(query)
    }

    pub fn count(&self, collection: &str) -> usize {
        let col = self.get_or_create_collection(collection);
        let col = col.read().unwrap_or_else(PoisonError::into_inner);
        col.count()
    }

    /// Store a typed record in its entity's collection. The record is
    /// serialized with its serde field names, which are the stored names.
    pub fn save<T: Entity + Serialize>(&self, record: &T) -> Result<DocumentId> {
        self.insert(T::schema().collection(), serde_json::to_value(record)?)
    }

    pub fn save_many<T: Entity + Serialize>(&self, records: &[T]) -> Result<Vec<DocumentId>> {
        let docs = records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.insert_many(T::schema().collection(), docs)
    }

    /// Start a pipeline over the collection of `S`, mapping results to `U`.
    pub fn create_aggregation<S, U>(&self) -> AggregationPipeline<'_, S, U>
    where
        S: Entity,
        U: DeserializeOwned,
    {
        AggregationPipeline::new(self)
    }
}

impl AggregationSource for Datastore {
    fn aggregate(
        &self,
        collection: &str,
        stages: &[Value],
        options: &AggregationOptions,
    ) -> Result<Box<dyn Cursor>> {
        if options.batch_size == 0 {
            return Err(Error::InvalidQuery("batchSize must be positive".into()));
        }
        let started = Instant::now();
        let pipeline = Pipeline::parse(stages)?;

        let docs = {
            let col = self.get_or_create_collection(collection);
            let col = col.read().unwrap_or_else(PoisonError::into_inner);
            col.all()
        };
        let input = docs.len();
        let results = pipeline.execute(docs)?;

        let elapsed = started.elapsed();
        if let Some(limit) = options.max_time_ms {
            if elapsed >= Duration::from_millis(limit) {
                warn!(collection, limit_ms = limit, ?elapsed, "aggregation exceeded its time limit");
                return Err(Error::Timeout(limit));
            }
        }
        debug!(
            collection,
            stages = pipeline.len(),
            input,
            output = results.len(),
            allow_disk_use = options.allow_disk_use,
            ?elapsed,
            "aggregation executed"
        );

        Ok(Box::new(BatchCursor::new(results, options.batch_size)))
    }
}
