//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `init`    | `Init`                           |
//! | `serve`   | `Serve`                          |
//! | `config`  | `Config`                         |
//! | `user`    | `User create`, `User list`       |

pub mod config;
pub mod init;
pub mod serve;
pub mod user;

pub use config::cmd_config;
pub use init::cmd_init;
pub use serve::{ServeArgs, cmd_serve};
pub use user::cmd_user;
