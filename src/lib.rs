pub mod api; pub mod config; pub mod error; pub mod fallback; pub mod interactions;
pub mod model; pub mod relay; pub mod util; pub mod validate;
