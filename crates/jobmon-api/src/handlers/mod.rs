// HTTP route modules, one per entity family. Every version of the API
// mounts the same authoritative route set; see main.rs for the version
// nesting.

pub mod admin;
pub mod array;
pub mod bind;
pub mod queries;
pub mod task_instance;
pub mod workflow;

use axum::Router;

use crate::AppState;

/// The full route set for one API version.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .merge(bind::routes(state.clone()))
        .merge(workflow::routes(state.clone()))
        .merge(array::routes(state.clone()))
        .merge(task_instance::routes(state.clone()))
        .merge(queries::routes(state.clone()))
        .merge(admin::routes(state))
}
