#![deny(missing_docs)]
#![doc = "Command line front end of the virtual accelerator: server configuration and the `run`, `cycle`, `pvs` and `config` commands."]

pub mod commands;
pub mod config;

pub use config::{load_server_config, resolve, ServerConfig};
