use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no mapped field '{field}' on entity {entity}")]
    UnknownField { entity: String, field: String },

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("aggregation pipeline has already been executed")]
    PipelineConsumed,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("aggregation exceeded time limit of {0}ms")]
    Timeout(u64),

    #[error("duplicate _id: {0}")]
    DuplicateId(u64),

    #[error("no free _id left in collection {0}")]
    IdsExhausted(String),

    #[error("document must be a JSON object")]
    NotAnObject,
}

pub type Result<T> = std::result::Result<T, Error>;
