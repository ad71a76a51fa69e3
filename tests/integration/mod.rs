pub mod common;
pub mod conversation_test;
pub mod persistence_test;
pub mod query_test;
