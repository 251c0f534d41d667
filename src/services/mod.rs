/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Match lifecycle control plane: create, join, query, end, pause, resume.
pub mod match_service;
/// Final standings computed from player scores and answer events.
pub mod ranking;
/// Background connection and health supervision of the match store.
pub mod storage_supervisor;
/// Per-player WebSocket read and write loops.
pub mod websocket_service;
