pub mod config;
pub mod context;
pub mod docker;
pub mod env;
pub mod error;
pub mod layers;
pub mod pipeline;
pub mod stage;
pub mod templates;
pub mod token;
pub mod utils;
