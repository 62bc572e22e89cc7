// HTTP layer - thin axum dispatch over the engine

//! # Server Module
//!
//! Every operation is a POST with a JSON body. The common request envelope is
//! `{ "authentification_token": <user-identifier>, "param": <object> }`; the
//! common response envelope is `{ "success": bool, "hash"?: string,
//! "parma_exception"?: <error record>, "exception"?: string, ... }`.
//!
//! Handlers do three things: assert the token identifies a known user, hand
//! `param` to the engine on a blocking task (container runs may take
//! arbitrarily long), and fold the outcome into the envelope. Tagged
//! [`FlowError`]s come back as `parma_exception`; anything else (panics on
//! the blocking task) comes back as `exception`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::runtime::NodeRuntime;
use crate::engine::{data, node, run, user, view, workflow};
use crate::store::EntityStore;
use crate::{FlowError, Result};

/// Shared application state: the entity store and the runtime seam.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EntityStore>,
    pub runtime: Arc<dyn NodeRuntime>,
}

/// Common request envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub authentification_token: Option<String>,
    #[serde(default)]
    pub param: Value,
}

/// Build the full operation router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/store", post(store_tables))
        .route("/user", post(add_user))
        .route("/data", post(add_data))
        .route("/node", post(add_node))
        .route("/workflow", post(add_workflow))
        .route("/refine", post(refine))
        .route("/run", post(run_workflow))
        .route("/get_data", post(get_data))
        .route("/export", post(export))
        .route("/view/table", post(view_table))
        .route("/view/data_of", post(view_data_of))
        .route("/view/log_of", post(view_log_of))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run an authenticated engine call on a blocking task and fold the result
/// into the response envelope.
async fn dispatch<F>(state: AppState, envelope: Envelope, operation: F) -> Json<Value>
where
    F: FnOnce(&AppState, Value, &str) -> Result<Value> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || {
        let token = envelope
            .authentification_token
            .ok_or(FlowError::NoUserLoggedIn)?;
        state.store.assert_user_exists(&token)?;
        operation(&state, envelope.param, &token)
    })
    .await;

    match outcome {
        Ok(Ok(body)) => Json(body),
        Ok(Err(error)) => Json(json!({ "success": false, "parma_exception": error.report() })),
        Err(join_error) => Json(json!({ "success": false, "exception": join_error.to_string() })),
    }
}

/// Wrap an identifier-returning registration into the envelope.
fn with_hash(result: Result<String>) -> Result<Value> {
    result.map(|hash| json!({ "success": true, "hash": hash }))
}

async fn login(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    let name = envelope
        .param
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match user::login(&state.store, &name) {
        Ok(hash) => {
            info!(user = %name, "login");
            Json(json!({ "success": true, "hash": hash }))
        }
        Err(error) => Json(json!({ "success": false, "parma_exception": error.report() })),
    }
}

async fn store_tables(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, _param, _user| {
        state.store.persist()?;
        Ok(json!({ "success": true }))
    })
    .await
}

async fn add_user(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, token| {
        with_hash(user::add_user(&state.store, param, token))
    })
    .await
}

async fn add_data(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, token| {
        with_hash(data::add_data(&state.store, param, token))
    })
    .await
}

async fn add_node(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, token| {
        with_hash(node::add_node(
            &state.store,
            state.runtime.as_ref(),
            param,
            token,
        ))
    })
    .await
}

async fn add_workflow(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, token| {
        with_hash(workflow::add_workflow(&state.store, param, token))
    })
    .await
}

async fn refine(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, token| {
        with_hash(workflow::refine_workflow(&state.store, param, token))
    })
    .await
}

async fn run_workflow(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, token| {
        with_hash(run::run_workflow(
            &state.store,
            state.runtime.as_ref(),
            param,
            token,
        ))
    })
    .await
}

async fn get_data(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, _token| {
        view::get_data(&state.store, param)
    })
    .await
}

async fn export(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, _token| {
        view::export(&state.store, param)?;
        Ok(json!({ "success": true }))
    })
    .await
}

async fn view_table(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, _token| {
        let mut body = view::view_table(&state.store, param)?;
        body["success"] = json!(true);
        Ok(body)
    })
    .await
}

async fn view_data_of(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, _token| {
        let mut body = view::view_data_of(&state.store, param)?;
        body["success"] = json!(true);
        Ok(body)
    })
    .await
}

async fn view_log_of(State(state): State<AppState>, Json(envelope): Json<Envelope>) -> Json<Value> {
    dispatch(state, envelope, |state, param, _token| {
        let mut body = view::view_log_of(&state.store, param)?;
        body["success"] = json!(true);
        Ok(body)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::FakeRuntime;
    use crate::store::test_support::empty_store;
    use serde_json::json;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let (store, guard) = empty_store();
        (
            AppState {
                store: Arc::new(store),
                runtime: Arc::new(FakeRuntime::copying()),
            },
            guard,
        )
    }

    #[tokio::test]
    async fn test_unauthenticated_request_reports_no_user() {
        let (state, _guard) = test_state();
        let envelope = Envelope {
            authentification_token: None,
            param: json!({}),
        };
        let Json(body) = dispatch(state, envelope, |_state, _param, _user| {
            Ok(json!({ "success": true }))
        })
        .await;
        assert_eq!(body["success"], false);
        assert_eq!(body["parma_exception"]["msg"], "NO_USER_LOGGED_IN");
    }

    #[tokio::test]
    async fn test_login_then_authenticated_view() {
        let (state, _guard) = test_state();
        let root =
            crate::engine::user::bootstrap_superuser(&state.store, "root", "Root").unwrap();

        let Json(login_body) = login(
            State(state.clone()),
            Json(Envelope {
                authentification_token: None,
                param: json!({ "name": "root" }),
            }),
        )
        .await;
        assert_eq!(login_body["success"], true);
        assert_eq!(login_body["hash"].as_str(), Some(root.as_str()));

        let Json(view_body) = view_table(
            State(state),
            Json(Envelope {
                authentification_token: Some(root),
                param: json!({ "name": "user" }),
            }),
        )
        .await;
        assert_eq!(view_body["success"], true);
        assert!(view_body["table"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_user_error_folds_into_envelope() {
        let (state, _guard) = test_state();
        let root =
            crate::engine::user::bootstrap_superuser(&state.store, "root", "Root").unwrap();
        let Json(body) = add_workflow(
            State(state),
            Json(Envelope {
                authentification_token: Some(root),
                param: json!({ "name": "broken" }),
            }),
        )
        .await;
        assert_eq!(body["success"], false);
        assert_eq!(body["parma_exception"]["category"], "USER_ERROR");
    }
}
