//! # REST API Endpoints
//!
//! Control-plane HTTP endpoints: agent registration, enumeration, and the
//! health probe. Agent keys are returned exactly once, in the registration
//! response; the list and inspect views never include them.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{AgentRecord, AppState};

#[derive(Deserialize)]
pub struct RegisterQuery {
    #[serde(default)]
    name: Option<String>,
}

/// Registration response. The only place `agent_key` ever appears.
#[derive(Serialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub agent_key: String,
    pub name: String,
    pub message: String,
}

/// Public view of an agent record.
#[derive(Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub name: String,
    pub online: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub child_alive: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub clients: usize,
}

impl AgentView {
    fn from_record(rec: &AgentRecord, clients: usize) -> Self {
        Self {
            agent_id: rec.agent_id.clone(),
            name: rec.name.clone(),
            online: rec.online(),
            connected_at: rec.connected_at,
            last_heartbeat: rec.last_heartbeat,
            child_alive: rec.child_alive,
            created_at: rec.created_at,
            clients,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agents_total: usize,
    pub agents_online: usize,
    pub clients_connected: usize,
}

fn bound_clients(state: &AppState, agent_id: &str) -> usize {
    state
        .clients_by_agent
        .get(agent_id)
        .map(|set| set.len())
        .unwrap_or(0)
}

/// `POST /api/agents?name=…` — registers a new agent and returns its
/// credentials.
pub async fn register_agent(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
) -> (StatusCode, Json<RegisterResponse>) {
    let name = query.name.unwrap_or_else(|| "unnamed".to_string());
    let (agent_id, agent_key) = state.register_agent(&name);

    (
        StatusCode::CREATED,
        Json(RegisterResponse {
            agent_id,
            agent_key,
            name,
            message: "Store the agent key now; it will not be shown again".to_string(),
        }),
    )
}

/// `GET /api/agents` — lists all registered agents.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentView>> {
    let agents: Vec<AgentView> = state
        .agents
        .iter()
        .map(|entry| AgentView::from_record(entry.value(), bound_clients(&state, entry.key())))
        .collect();
    Json(agents)
}

/// `GET /api/agents/{id}` — inspects one agent.
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentView>, StatusCode> {
    let clients = bound_clients(&state, &agent_id);
    state
        .agents
        .get(&agent_id)
        .map(|rec| Json(AgentView::from_record(rec.value(), clients)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// `GET /health` — liveness probe with connection counts.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        agents_total: state.agents.len(),
        agents_online: state.agents_online(),
        clients_connected: state.clients.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_inspect() {
        let state = AppState::new();
        let (status, Json(resp)) = register_agent(
            State(state.clone()),
            Query(RegisterQuery {
                name: Some("laptop".into()),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(resp.name, "laptop");
        assert!(resp.agent_id.len() >= 10);
        assert!(resp.agent_key.len() >= 40);

        let Json(view) = get_agent(State(state.clone()), Path(resp.agent_id.clone()))
            .await
            .unwrap();
        assert_eq!(view.agent_id, resp.agent_id);
        assert!(!view.online);
        assert_eq!(view.clients, 0);

        let err = get_agent(State(state), Path("missing".into()))
            .await
            .err()
            .unwrap();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_never_leaks_keys() {
        let state = AppState::new();
        state.register_agent("a");
        let Json(views) = list_agents(State(state)).await;
        let json = serde_json::to_string(&views).unwrap();
        assert!(!json.contains("agent_key"));
    }

    #[tokio::test]
    async fn health_counts() {
        let state = AppState::new();
        state.register_agent("a");
        let Json(h) = health(State(state)).await;
        assert_eq!(h.status, "healthy");
        assert_eq!(h.agents_total, 1);
        assert_eq!(h.agents_online, 0);
        assert_eq!(h.clients_connected, 0);
    }
}
