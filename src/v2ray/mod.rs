mod launcher;
mod manager;

pub use launcher::*;
pub use manager::*;
