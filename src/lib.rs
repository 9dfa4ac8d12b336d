pub mod config;
pub mod crypto;
pub mod directory;
pub mod messenger;
pub mod model;
pub mod peer;
pub mod pending;
pub mod util;
pub mod test_util;
