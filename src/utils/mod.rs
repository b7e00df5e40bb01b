mod fetch;
mod paths;
mod process;

pub use fetch::*;
pub use paths::*;
pub use process::*;
