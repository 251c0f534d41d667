use serde::Serialize;
use utoipa::ToSchema;

/// Body of the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the match store is unreachable.
    pub status: String,
}

impl HealthResponse {
    /// Store reachable.
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }

    /// Running without a store.
    pub fn degraded() -> Self {
        Self {
            status: "degraded".into(),
        }
    }
}
