mod app;
mod history;
mod sorting;

pub use app::{add_routes, AppState};
