use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::Connection;

/// Path-separator joined list of directories scanned for engine jars.
pub const ENV_JAR_DIRS: &str = "HUTER_DIR";
/// Truthy values forward the engine's stdout/stderr to this process.
pub const ENV_SHOW_JVM_OUTPUT: &str = "HUTER_SHOW_JVM_OUTPUT";
/// Jar directory used when [`ENV_JAR_DIRS`] is unset.
pub const DEFAULT_JAR_DIR: &str = "/opt/huter/lib/";
/// Port a pre-launched engine listens on when the caller does not name one.
pub const DEFAULT_GATEWAY_PORT: u16 = 25333;
/// Main class started in owned mode.
pub const DEFAULT_ENTRY_CLASS: &str = "com.trivago.huter.gateway.GatewayServer";

const DEFAULT_PROGRAM: &str = "java";
const DEFAULT_JVM_OPTIONS: [&str; 2] = ["-Xmx2048m", "-Xms2048m"];

/// Process-level configuration for launching an owned engine.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Executable to start, `java` unless overridden.
    pub program: PathBuf,
    /// Memory flags and other runtime options placed before the class path.
    pub jvm_options: Vec<String>,
    /// Directories scanned (non-recursively) for `*.jar` files.
    pub jar_dirs: Vec<PathBuf>,
    /// Main class serving the gateway protocol.
    pub entry_class: String,
    /// Additional CLI arguments passed through after the entry class.
    pub extra_args: Vec<String>,
    /// Extra environment variables applied to the child process.
    pub env: BTreeMap<String, String>,
    /// Forward engine stdout/stderr lines to this process's streams.
    pub show_output: bool,
    /// Upper bound on how long to wait for the engine to announce its listen address.
    pub startup_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            jvm_options: DEFAULT_JVM_OPTIONS.iter().map(|opt| opt.to_string()).collect(),
            jar_dirs: vec![PathBuf::from(DEFAULT_JAR_DIR)],
            entry_class: DEFAULT_ENTRY_CLASS.to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            show_output: false,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

impl LaunchConfig {
    /// Create a config targeting a specific launcher executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with [`ENV_JAR_DIRS`] and [`ENV_SHOW_JVM_OUTPUT`].
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dirs) = env::var_os(ENV_JAR_DIRS) {
            config.jar_dirs = env::split_paths(&dirs).collect();
        }
        if let Ok(flag) = env::var(ENV_SHOW_JVM_OUTPUT) {
            config.show_output = is_truthy(&flag);
        }
        config
    }

    /// Replace the executable started for the engine.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Replace the runtime options placed before the class path.
    pub fn with_jvm_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.jvm_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the directories scanned for engine jars.
    pub fn with_jar_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.jar_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the main class serving the gateway protocol.
    pub fn with_entry_class(mut self, entry_class: impl Into<String>) -> Self {
        self.entry_class = entry_class.into();
        self
    }

    /// Add a passthrough CLI argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Add an environment variable override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Forward engine output to this process instead of only capturing it.
    pub fn with_show_output(mut self, show: bool) -> Self {
        self.show_output = show;
        self
    }

    /// Override the startup timeout used while waiting for the listen address.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Class path built from every jar found in [`LaunchConfig::jar_dirs`].
    pub fn class_path(&self) -> GatewayResult<OsString> {
        class_path(&self.jar_dirs)
    }
}

/// Where the gateway gets its engine connection from.
#[derive(Debug)]
pub enum EngineSource {
    /// Start a new engine process owned by the gateway.
    Launch,
    /// Attach to a running engine on this port; `<= 0` means the default port.
    Attach(i32),
    /// Use an already connected channel as is.
    Existing(Connection),
}

impl EngineSource {
    /// Whether this source starts an engine the gateway owns.
    pub fn is_launch(&self) -> bool {
        matches!(self, EngineSource::Launch)
    }
}

/// Construction-time configuration of a [`Gateway`](crate::Gateway).
#[derive(Debug)]
pub struct GatewayConfig {
    /// How the engine connection is acquired.
    pub source: EngineSource,
    /// Delete the working directory when the gateway is released.
    pub auto_clean: bool,
    /// Launch settings, only consulted for [`EngineSource::Launch`].
    pub launch: LaunchConfig,
}

impl GatewayConfig {
    /// Launch an owned engine using environment-derived defaults.
    pub fn launch() -> Self {
        Self::from_source(EngineSource::Launch)
    }

    /// Attach to a pre-launched engine.
    pub fn attach(port: i32) -> Self {
        Self::from_source(EngineSource::Attach(port))
    }

    /// Wrap an existing connection.
    pub fn existing(connection: Connection) -> Self {
        Self::from_source(EngineSource::Existing(connection))
    }

    fn from_source(source: EngineSource) -> Self {
        Self {
            source,
            auto_clean: true,
            launch: LaunchConfig::from_env(),
        }
    }

    /// Choose whether the working directory is deleted on release.
    pub fn with_auto_clean(mut self, auto_clean: bool) -> Self {
        self.auto_clean = auto_clean;
        self
    }

    /// Replace the launch settings used for an owned engine.
    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }
}

/// Resolve the port to attach to; non-positive values select the default.
pub fn resolve_attach_port(port: i32) -> GatewayResult<u16> {
    if port <= 0 {
        return Ok(DEFAULT_GATEWAY_PORT);
    }
    u16::try_from(port).map_err(|_| GatewayError::config(format!("port out of range: {port}")))
}

/// Collect `*.jar` files directly inside each directory and join them with
/// the platform path separator. Missing directories are skipped.
pub fn class_path<P: AsRef<Path>>(dirs: &[P]) -> GatewayResult<OsString> {
    let mut jars = Vec::new();
    for dir in dirs {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "jar directory missing, skipping");
            continue;
        }

        let mut found = Vec::new();
        for entry in fs_err::read_dir(dir)? {
            let path = entry?.path();
            let is_jar = path.extension().is_some_and(|ext| ext == "jar");
            if is_jar && path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        jars.extend(found);
    }

    debug!(jars = jars.len(), "engine class path assembled");
    env::join_paths(jars).map_err(|err| GatewayError::config(err.to_string()))
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    ["1", "true", "yes"]
        .iter()
        .any(|truthy| value.eq_ignore_ascii_case(truthy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    #[test]
    fn class_path_lists_jars_without_recursing() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        fs_err::write(first.path().join("b.jar"), b"").unwrap();
        fs_err::write(first.path().join("a.jar"), b"").unwrap();
        fs_err::write(first.path().join("notes.txt"), b"").unwrap();
        fs_err::create_dir(first.path().join("nested")).unwrap();
        fs_err::write(first.path().join("nested").join("deep.jar"), b"").unwrap();
        fs_err::write(second.path().join("engine.jar"), b"").unwrap();

        let missing = first.path().join("does-not-exist");
        let joined = class_path(&[first.path(), missing.as_path(), second.path()]).unwrap();
        let entries: Vec<PathBuf> = env::split_paths(&joined).collect();

        assert_eq!(
            entries,
            vec![
                first.path().join("a.jar"),
                first.path().join("b.jar"),
                second.path().join("engine.jar"),
            ]
        );
    }

    #[test]
    fn class_path_is_empty_without_jars() {
        let empty = tempdir().unwrap();
        assert!(class_path(&[empty.path()]).unwrap().is_empty());
    }

    #[test]
    fn env_overrides_jar_dirs_and_output_flag() {
        let dirs = env::join_paths(["/a/lib", "/b/lib"]).unwrap();
        temp_env::with_vars(
            [
                (ENV_JAR_DIRS, Some(dirs.as_os_str())),
                (ENV_SHOW_JVM_OUTPUT, Some(OsStr::new("YES"))),
            ],
            || {
                let config = LaunchConfig::from_env();
                assert_eq!(
                    config.jar_dirs,
                    vec![PathBuf::from("/a/lib"), PathBuf::from("/b/lib")]
                );
                assert!(config.show_output);
            },
        );
    }

    #[test]
    fn defaults_apply_without_env() {
        temp_env::with_vars_unset([ENV_JAR_DIRS, ENV_SHOW_JVM_OUTPUT], || {
            let config = LaunchConfig::from_env();
            assert_eq!(config.jar_dirs, vec![PathBuf::from(DEFAULT_JAR_DIR)]);
            assert!(!config.show_output);
            assert_eq!(config.jvm_options, vec!["-Xmx2048m", "-Xms2048m"]);
        });
    }

    #[test]
    fn output_flag_accepts_only_known_truthy_values() {
        for value in ["1", "true", "True", "yes"] {
            assert!(is_truthy(value), "{value} should be truthy");
        }
        for value in ["0", "false", "no", "on", ""] {
            assert!(!is_truthy(value), "{value} should be falsy");
        }
    }

    #[test]
    fn attach_port_defaults_when_not_positive() {
        assert_eq!(resolve_attach_port(0).unwrap(), DEFAULT_GATEWAY_PORT);
        assert_eq!(resolve_attach_port(-1).unwrap(), DEFAULT_GATEWAY_PORT);
        assert_eq!(resolve_attach_port(4242).unwrap(), 4242);
        assert!(matches!(
            resolve_attach_port(70_000),
            Err(GatewayError::Config(_))
        ));
    }
}
