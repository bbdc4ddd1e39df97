#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod client;
pub mod constants;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod normalize;
pub mod relay;
pub mod routes;
pub mod session;
pub mod specs;
pub mod store;
pub mod text;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
