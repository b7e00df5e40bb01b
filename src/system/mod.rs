mod command;
mod gsettings;
mod networksetup;
mod proxy;
mod registry;

pub use command::*;
pub use gsettings::GsettingsProxy;
pub use networksetup::NetworkSetupProxy;
pub use proxy::*;
pub use registry::RegistryProxy;
