//! Test fixture client for the Huter query engine.
//!
//! A [`Gateway`] either launches its own engine process or attaches to one
//! that is already running, accumulates engine options through chained
//! setters, and turns each run into a CLI-style argument list sent over the
//! gateway protocol. The engine's answer comes back as plain rows, error
//! strings and an opaque engine output value.
//!
//! Typical usage:
//! ```no_run
//! use huter_gateway::{ColumnValue, Gateway, GatewayConfig, LaunchConfig};
//!
//! let config = GatewayConfig::launch()
//!     .with_launch(LaunchConfig::from_env().with_jar_dirs(["/opt/huter/lib"]))
//!     .with_auto_clean(true);
//! let mut gateway = Gateway::new(config).expect("working directory");
//!
//! let result = gateway
//!     .run(Some("SELECT true AS hooray, named_struct('haha', 3)"))
//!     .expect("engine should answer");
//! assert!(result.errors.is_empty());
//! assert_eq!(result.output[0][0], ColumnValue::Bool(true));
//! ```
//!
//! Query failures reported by the engine land in [`QueryResult::errors`];
//! only failures of the invocation itself are returned as [`GatewayError`].

mod config;
mod error;
mod gateway;
mod launcher;
pub mod options;
pub mod protocol;
mod workdir;

pub use config::{
    class_path, resolve_attach_port, EngineSource, GatewayConfig, LaunchConfig,
    DEFAULT_ENTRY_CLASS, DEFAULT_GATEWAY_PORT, DEFAULT_JAR_DIR, ENV_JAR_DIRS, ENV_SHOW_JVM_OUTPUT,
};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{ColumnValue, Gateway, Ownership, QueryResult};
pub use launcher::{LogLine, LogStream};
pub use options::{join_path, render_option, OptionValue, Options};
pub use protocol::Connection;
pub use workdir::WorkingDirectory;
