pub mod classify;
pub mod derivatives;
pub mod file_service;
pub mod intake;
pub mod layout;
pub mod metadata_store;
pub mod presets;
pub mod retrieval;
pub mod sessions;
