use thiserror::Error;

use crate::trace::NodeId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Graph parse error: {reason}, node id: {node_id}")]
    MalformedNode { node_id: NodeId, reason: String },

    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Run op error: {message}, node id: {node_id}, func: {operator}, inputs: {arguments}")]
    Execution {
        node_id: NodeId,
        operator: String,
        message: String,
        arguments: String,
    },

    #[error("Operator error: {0}")]
    OperatorError(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Build a structural error for the node currently being decoded
    pub fn malformed(node_id: NodeId, reason: impl Into<String>) -> Self {
        Error::MalformedNode {
            node_id,
            reason: reason.into(),
        }
    }
}
