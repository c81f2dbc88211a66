pub mod analiza;
pub mod engine;
pub mod loader;
