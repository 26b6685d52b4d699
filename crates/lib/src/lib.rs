//! runprobe core library: gateway client, device identity, configuration, and the
//! flag-toggle benchmark harness used by the CLI.

pub mod bench;
pub mod config;
pub mod device;
pub mod gateway;
