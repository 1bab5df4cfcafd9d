pub mod cache;
pub mod corrections;
pub mod db;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod imaging;
pub mod matching;
pub mod models;
pub mod nutrition;
pub mod openfoodfacts;
pub mod payload;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod service;
pub mod settings;
pub mod store;
