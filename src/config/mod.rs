mod compiler;
mod import;
mod manager;
mod share_link;
mod subscription;

pub use compiler::*;
pub use import::*;
pub use manager::*;
pub use share_link::ShareLink;
pub(crate) use share_link::decode_base64;
pub use subscription::*;
