pub mod gateway;
pub mod loader;

pub use gateway::*;
pub use loader::load;
