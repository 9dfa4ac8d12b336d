pub mod pending_store;
