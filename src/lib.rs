pub mod config;
pub mod device;
pub mod embedding;
pub mod evaluate;
pub mod loader;
pub mod logging;
pub mod models;
pub mod plot;
pub mod tracking;
pub mod tsne;
pub mod video;
