use lib_notify::core::StatsSnapshot;
use serde::{Deserialize, Serialize};

/// Query string of `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeQuery {
    pub tenant_id: Option<String>,
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub env: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub connections: usize,
    pub scopes: usize,
    pub accepting: bool,
    pub dispatch: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
