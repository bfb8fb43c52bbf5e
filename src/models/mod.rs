mod deployment;
mod detection;

pub use deployment::*;
pub use detection::*;
