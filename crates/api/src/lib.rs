//! Operations HTTP surface for the enrichment engine.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
