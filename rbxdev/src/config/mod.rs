mod error;
mod project_toml;
mod resolved;

pub use error::*;
pub use project_toml::*;
pub use resolved::*;
