pub mod process;
pub mod status;
pub mod tunnel;

pub use process::{LaunchSpec, ProcessState, ProcessStatus};
pub use status::{SettingsView, StatusSnapshot, TunnelInfo};
pub use tunnel::TunnelType;
