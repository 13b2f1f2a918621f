// Export attack implementations
pub mod correlation;
pub mod partial_key;
pub mod state_recovery;
pub mod table_build;
pub mod table_search;
