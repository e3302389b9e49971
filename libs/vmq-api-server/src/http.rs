use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use vmq_engine::{BrokerError, GroupDescription, GroupPhase};

use super::AppState;

#[derive(Serialize)]
struct TopicView {
    name: String,
    partitions: u32,
}

#[derive(Serialize)]
struct MemberView {
    id: String,
    topics: Vec<String>,
    prefetch: usize,
    last_heartbeat_ms: u64,
    partitions: Vec<String>,
}

#[derive(Serialize)]
struct PartitionView {
    topic: String,
    partition: u32,
    owner: Option<String>,
    committed: Option<u64>,
    in_flight: usize,
}

#[derive(Serialize)]
struct GroupView {
    name: String,
    phase: &'static str,
    generation: u64,
    members: Vec<MemberView>,
    partitions: Vec<PartitionView>,
}

impl From<GroupDescription> for GroupView {
    fn from(group: GroupDescription) -> Self {
        Self {
            name: group.name,
            phase: match group.phase {
                GroupPhase::Stable => "stable",
                GroupPhase::Rebalancing => "rebalancing",
            },
            generation: group.generation,
            members: group
                .members
                .into_iter()
                .map(|m| MemberView {
                    id: m.id,
                    topics: m.topics,
                    prefetch: m.prefetch,
                    last_heartbeat_ms: m.last_heartbeat_ms,
                    partitions: m.partitions.iter().map(ToString::to_string).collect(),
                })
                .collect(),
            partitions: group
                .partitions
                .into_iter()
                .map(|p| PartitionView {
                    topic: p.tp.topic,
                    partition: p.tp.partition,
                    owner: p.owner,
                    committed: p.committed,
                    in_flight: p.in_flight,
                })
                .collect(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/topics
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_topics(State(state): State<AppState>) -> impl IntoResponse {
    let topics: Vec<TopicView> = state
        .broker
        .topics()
        .into_iter()
        .map(|t| TopicView {
            name: t.name,
            partitions: t.partitions,
        })
        .collect();
    axum::Json(topics).into_response()
}

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/groups, GET /api/groups/{name}
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_groups(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.broker.groups()).into_response()
}

pub(crate) async fn handle_describe_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.broker.describe_group(&name) {
        Ok(group) => axum::Json(GroupView::from(group)).into_response(),
        Err(e @ BrokerError::UnknownGroup(_)) => (StatusCode::NOT_FOUND, format!("error: {e}")).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {e}")).into_response(),
    }
}
