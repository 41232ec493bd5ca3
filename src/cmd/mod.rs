//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled             |
//! |----------|------------------------------|
//! | `run`    | `Run`, `Dispatch`, `Worker`  |
//! | `status` | `Status`, `List`             |
//! | `config` | `Config`                     |

pub mod config;
pub mod run;
pub mod status;

pub use config::{cmd_config, cmd_config_init};
pub use run::{cmd_dispatch, cmd_run, cmd_worker};
pub use status::{cmd_list, cmd_status};
