pub mod routes;

// Re-export route handlers for convenience
pub use routes::appspaces;
pub use routes::migrations;
pub use routes::state::AppState;
pub use routes::versions;
