pub mod status;
pub mod upload;

pub use status::*;
pub use upload::*;
