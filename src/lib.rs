pub mod aggregation;
pub mod collection;
pub mod compiler;
pub mod cursor;
pub mod document;
pub mod engine;
pub mod error;
pub mod operators;
pub mod options;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod value;

pub use aggregation::{AggregationPipeline, AggregationSource, PipelineState};
pub use cursor::{BatchCursor, Cursor, EntityCache, MappedResults};
pub use document::{Document, DocumentId};
pub use engine::Datastore;
pub use error::{Error, Result};
pub use operators::{Accumulator, Direction, Group, GroupId, Matcher, Projection, Sort};
pub use options::{AggregationOptions, parse_aggregation_options};
pub use schema::{Entity, FieldResolver, Schema};
