//! CLI commands implementation

pub mod cleanup;
pub mod init;
pub mod migrate;
pub mod query;
pub mod status;
pub mod validate;
pub mod versions;

pub use cleanup::*;
pub use init::*;
pub use migrate::*;
pub use query::*;
pub use status::*;
pub use validate::*;
pub use versions::*;
