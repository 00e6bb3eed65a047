use axum::{Extension, Router};

use crate::state::AppState;

pub mod autosave;
pub mod health;
pub mod router;
pub mod shell;
pub mod vms;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/worker/v1", vms::router().merge(shell::router()))
        .layer(Extension(state))
}
