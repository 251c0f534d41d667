/// Match session storage and retrieval operations.
pub mod match_store;
/// Persisted match session model.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
