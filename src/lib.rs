pub mod clean;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod labels;
pub mod layout;
pub mod load;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod store;
