pub mod kind;
pub mod descriptor;
pub mod outcome;

pub use kind::*;
pub use descriptor::*;
pub use outcome::*;
