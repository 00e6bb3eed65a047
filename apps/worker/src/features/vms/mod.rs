use axum::Router;

pub mod manager;
pub mod recovery;
pub mod routes;

pub fn router() -> Router {
    routes::router()
}
