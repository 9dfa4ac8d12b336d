pub mod directory_connection;
pub mod directory_pool;
pub mod resolver;
pub mod user_cache;
