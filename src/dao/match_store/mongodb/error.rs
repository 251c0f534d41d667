use mongodb::{bson, error::Error as MongoError};
use thiserror::Error;
use uuid::Uuid;

/// Result alias for MongoDB backend operations.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Failures of the MongoDB backend, converted to `StorageError` at the trait boundary.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// Connection string could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        /// Rejected connection string.
        uri: String,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Driver client could not be built.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Server never answered during startup.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        /// Pings attempted.
        attempts: u32,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Periodic ping failed.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Index creation failed.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        /// Target collection.
        collection: &'static str,
        /// Index name.
        index: &'static str,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// A value could not be converted to BSON.
    #[error("failed to encode {what} for match `{id}`")]
    Encode {
        /// Match concerned.
        id: Uuid,
        /// Kind of value being encoded.
        what: &'static str,
        /// Encoder error.
        #[source]
        source: bson::error::Error,
    },
    /// Insert failed.
    #[error("failed to save match `{id}`")]
    SaveMatch {
        /// Match concerned.
        id: Uuid,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Targeted update failed.
    #[error("failed to update match `{id}`")]
    UpdateMatch {
        /// Match concerned.
        id: Uuid,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Lookup failed.
    #[error("failed to load match `{id}`")]
    LoadMatch {
        /// Match concerned.
        id: Uuid,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Stored `_id` is not a UUID.
    #[error("stored match `{id}` has a malformed identifier")]
    MalformedId {
        /// Raw stored identifier.
        id: String,
    },
    /// Listing query failed.
    #[error("failed to list matches")]
    ListMatches {
        /// Driver error.
        #[source]
        source: MongoError,
    },
}
