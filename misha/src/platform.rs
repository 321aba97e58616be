//! OS integration: interface configuration, host routes and resolver control.
//!
//! Only macOS is supported as a client platform; everywhere else these fail at
//! setup with a clear error. Relay mode never touches any of this.

#[cfg(target_os = "macos")]
#[path = "platform/macos.rs"]
mod imp;

#[cfg(not(target_os = "macos"))]
#[path = "platform/unsupported.rs"]
mod imp;

pub use imp::{bring_up, get_dns, install_routes, set_dns, uninstall_routes};
