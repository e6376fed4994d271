//! Fluent, typed construction of aggregation pipelines.
//!
//! ```
//! use oxidb_pipeline::{
//!     Accumulator, Datastore, Entity, Group, Matcher, Projection, Schema, Sort,
//! };
//! use serde::Deserialize;
//!
//! struct Book;
//!
//! impl Entity for Book {
//!     fn schema() -> Schema {
//!         Schema::new("Book", "books")
//!             .field("author", "a")
//!             .field("copies", "c")
//!     }
//! }
//!
//! #[derive(Deserialize)]
//! struct CopiesByAuthor {
//!     _id: String,
//!     copies: i64,
//! }
//!
//! # fn main() -> oxidb_pipeline::Result<()> {
//! let db = Datastore::new();
//! db.insert("books", serde_json::json!({"a": "Le Guin", "c": 3}))?;
//! db.insert("books", serde_json::json!({"a": "Le Guin", "c": 2}))?;
//!
//! let mut pipeline = db.create_aggregation::<Book, CopiesByAuthor>();
//! pipeline
//!     .project(&[Projection::new("author"), Projection::new("copies")])?
//!     .group("a", &[Group::grouping("copies", Accumulator::sum("c"))])?
//!     .matching(&[Matcher::gte("copies", 5)])?
//!     .sort(&[Sort::descending("copies")])?;
//!
//! let totals: Vec<_> = pipeline.aggregate()?.collect::<Result<_, _>>()?;
//! assert_eq!(totals[0].copies, 5);
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::compiler::StageCompiler;
use crate::cursor::{Cursor, EntityCache, MappedResults};
use crate::error::{Error, Result};
use crate::operators::{Group, GroupId, Matcher, Projection, Sort};
use crate::options::AggregationOptions;
use crate::schema::{Entity, Schema};

/// The database's aggregation entry point: runs a stage sequence against a
/// collection and returns a cursor over the raw result documents.
pub trait AggregationSource {
    fn aggregate(
        &self,
        collection: &str,
        stages: &[Value],
        options: &AggregationOptions,
    ) -> Result<Box<dyn Cursor>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Empty,
    Building,
    Aggregated,
}

/// Builder for a pipeline over source records `S`, producing results `U`.
///
/// Stage operations compile their descriptors into one stage document and
/// append it, in call order. A call that fails appends nothing; stages from
/// earlier calls stay in place.
pub struct AggregationPipeline<'db, S, U> {
    source: &'db dyn AggregationSource,
    compiler: StageCompiler,
    stages: Vec<Value>,
    state: PipelineState,
    _types: PhantomData<fn() -> (S, U)>,
}

impl<'db, S: Entity, U: DeserializeOwned> AggregationPipeline<'db, S, U> {
    pub fn new(source: &'db dyn AggregationSource) -> Self {
        Self {
            source,
            compiler: StageCompiler::new(S::schema()),
            stages: Vec::new(),
            state: PipelineState::Empty,
            _types: PhantomData,
        }
    }

    pub fn schema(&self) -> &Schema {
        self.compiler.schema()
    }

    pub fn stages(&self) -> &[Value] {
        &self.stages
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn push_stage<F>(&mut self, compile: F) -> Result<&mut Self>
    where
        F: FnOnce(&StageCompiler, bool) -> Result<Value>,
    {
        if self.state == PipelineState::Aggregated {
            warn!(collection = %self.schema().collection(), "stage added to a consumed pipeline");
            return Err(Error::PipelineConsumed);
        }
        let first_stage = self.stages.is_empty();
        let stage = compile(&self.compiler, first_stage)?;
        debug!(%stage, first_stage, "appending stage");
        self.stages.push(stage);
        self.state = PipelineState::Building;
        Ok(self)
    }

    /// Append a `$project` stage. Only when it is the first stage are field
    /// names translated to their stored names.
    pub fn project(&mut self, projections: &[Projection]) -> Result<&mut Self> {
        self.push_stage(|compiler, first| compiler.project(projections, first))
    }

    /// Append a `$group` stage. `id` is a field name (`"author"`), a list of
    /// key components (`vec![Group::key("year"), ...]`) or [`GroupId::Null`].
    pub fn group(&mut self, id: impl Into<GroupId>, groupings: &[Group]) -> Result<&mut Self> {
        let id = id.into();
        self.push_stage(|compiler, _| compiler.group(&id, groupings))
    }

    /// Append a `$match` stage.
    pub fn matching(&mut self, matchers: &[Matcher]) -> Result<&mut Self> {
        self.push_stage(|compiler, _| compiler.matching(matchers))
    }

    pub fn sort(&mut self, sorts: &[Sort]) -> Result<&mut Self> {
        self.push_stage(|compiler, _| compiler.sort(sorts))
    }

    pub fn skip(&mut self, n: u64) -> Result<&mut Self> {
        self.push_stage(|compiler, _| compiler.skip(n))
    }

    pub fn limit(&mut self, n: u64) -> Result<&mut Self> {
        self.push_stage(|compiler, _| compiler.limit(n))
    }

    pub fn unwind(&mut self, field: &str) -> Result<&mut Self> {
        self.push_stage(|compiler, _| compiler.unwind(field))
    }

    /// Run the pipeline with default options.
    pub fn aggregate(&mut self) -> Result<MappedResults<U>> {
        self.aggregate_with(AggregationOptions::default())
    }

    /// Run the pipeline. The builder is consumed by this call: any further
    /// stage operation or `aggregate` fails with [`Error::PipelineConsumed`].
    pub fn aggregate_with(&mut self, options: AggregationOptions) -> Result<MappedResults<U>> {
        if self.state == PipelineState::Aggregated {
            warn!(collection = %self.schema().collection(), "pipeline aggregated twice");
            return Err(Error::PipelineConsumed);
        }
        self.state = PipelineState::Aggregated;

        let collection = self.compiler.schema().collection().to_string();
        let submitted = Value::Array(self.stages.clone());
        debug!(%collection, stages = %submitted, "submitting aggregation");
        let cursor = self.source.aggregate(&collection, &self.stages, &options)?;
        Ok(MappedResults::new(cursor, collection, EntityCache::new()))
    }
}
