// Axiom Gateway - bridges synchronous HTTP asks to out-of-process inference workers

pub mod config;
pub mod middleware;
pub mod models;
pub mod process;
pub mod queue;
pub mod routes;
pub mod types;
pub mod utils;

pub use config::Config;
pub use models::{AppState, Backend};

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
