mod gfwlist;
mod server;

pub use gfwlist::*;
pub use server::*;
