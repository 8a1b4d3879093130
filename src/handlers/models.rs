// GET /v1/models

use axum::response::{IntoResponse, Json};
use serde::Serialize;

use crate::config::MODEL_MAP;

#[derive(Debug, Serialize)]
pub struct Model {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
    pub display_name: String,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<Model>,
}

pub async fn handle_list_models() -> impl IntoResponse {
    Json(list_models())
}

fn list_models() -> ModelsResponse {
    let mut ids: Vec<&str> = MODEL_MAP.keys().copied().collect();
    ids.sort_unstable();

    let data = ids
        .into_iter()
        .map(|id| Model {
            id: id.to_string(),
            object: "model",
            created: 1234567890,
            owned_by: "anthropic",
            display_name: id.to_string(),
            type_: "text",
            max_tokens: 200000,
        })
        .collect();

    ModelsResponse {
        object: "list",
        data,
    }
}
