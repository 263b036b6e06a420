use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{resolve_attach_port, EngineSource, GatewayConfig, LaunchConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::launcher::{EngineProcess, LogLine, SHUTDOWN_GRACE};
use crate::options::{self, join_path, path_value, render_option, Options, WORKING_ROOT_FLAG};
use crate::protocol::{Connection, RunOutcome};
use crate::workdir::WorkingDirectory;

/// Whether the gateway is responsible for terminating the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Started by this gateway; shut down on release.
    Owned,
    /// Managed elsewhere; only detached on release.
    Borrowed,
}

/// One column of an output row.
///
/// Composite engine values (structs, arrays, maps) arrive as their
/// engine-native encoded string and are kept as [`ColumnValue::Text`].
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<Value> for ColumnValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ColumnValue::Null,
            Value::Bool(flag) => ColumnValue::Bool(flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    ColumnValue::Int(int)
                } else if number.is_u64() {
                    // Past i64::MAX: keep the exact digits instead of rounding through f64.
                    ColumnValue::Text(number.to_string())
                } else {
                    ColumnValue::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => ColumnValue::Text(text),
            composite @ (Value::Array(_) | Value::Object(_)) => {
                ColumnValue::Text(composite.to_string())
            }
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(flag: bool) -> Self {
        ColumnValue::Bool(flag)
    }
}

impl From<i32> for ColumnValue {
    fn from(int: i32) -> Self {
        ColumnValue::Int(int.into())
    }
}

impl From<i64> for ColumnValue {
    fn from(int: i64) -> Self {
        ColumnValue::Int(int)
    }
}

impl From<f64> for ColumnValue {
    fn from(float: f64) -> Self {
        ColumnValue::Float(float)
    }
}

impl From<&str> for ColumnValue {
    fn from(text: &str) -> Self {
        ColumnValue::Text(text.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(text: String) -> Self {
        ColumnValue::Text(text)
    }
}

/// Decoded answer of one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Rows produced by the test query.
    pub output: Vec<Vec<ColumnValue>>,
    /// Query-level failures reported by the engine.
    pub errors: Vec<String>,
    /// Engine output passed through without interpretation.
    pub engine_output: Value,
}

impl QueryResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

impl From<RunOutcome> for QueryResult {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            output: outcome
                .output
                .into_iter()
                .map(|row| row.into_iter().map(ColumnValue::from).collect())
                .collect(),
            errors: outcome.errors,
            engine_output: outcome.engine_output,
        }
    }
}

/// Client driving one engine instance from a test.
///
/// Options accumulate through the setters below and are flattened into a
/// CLI-style argument list on every run. The engine connection is acquired
/// lazily on first use and released when the gateway is closed or dropped.
///
/// ```no_run
/// use huter_gateway::Gateway;
///
/// let mut gateway = Gateway::non_auto_cleaned()?;
/// gateway
///     .set_table_definitions_root(&["/repo"])?
///     .set_query_file(&["/repo", "hive_page.hql"])?
///     .add_setup_file(&["/repo", "test", "setup.hql"])?
///     .set_test_query_file(&["/repo", "test", "test_1.hql"])?
///     .add_param_file(&["/repo", "test", "parameters.ini"])?
///     .add_table_file(&["/repo", "test", "table_list.txt"])?
///     .set_name("test_the_script");
///
/// let result = gateway.run(None)?;
/// assert!(result.is_success(), "{:?}", result.errors);
/// # Ok::<(), huter_gateway::GatewayError>(())
/// ```
#[derive(Debug)]
pub struct Gateway {
    source: Option<EngineSource>,
    ownership: Ownership,
    launch: LaunchConfig,
    engine: Option<EngineProcess>,
    connection: Option<Connection>,
    options: Options,
    released: bool,
    // Dropped last so the engine is gone before its directory is removed.
    workdir: WorkingDirectory,
}

impl Gateway {
    /// Build an unopened gateway; no engine is contacted until the first run.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let ownership = if config.source.is_launch() {
            Ownership::Owned
        } else {
            Ownership::Borrowed
        };
        let workdir = WorkingDirectory::create(config.auto_clean)?;

        let mut gateway = Self {
            source: Some(config.source),
            ownership,
            launch: config.launch,
            engine: None,
            connection: None,
            options: Options::new(),
            released: false,
            workdir,
        };
        let log_dir = gateway.workdir.log_dir();
        gateway.options.set(options::LOG_DIR, path_value(&log_dir));
        Ok(gateway)
    }

    /// Launches its own engine; the working directory is deleted on release.
    pub fn auto_cleaned() -> GatewayResult<Self> {
        Self::new(GatewayConfig::launch())
    }

    /// Launches its own engine; the working directory is kept for inspection.
    pub fn non_auto_cleaned() -> GatewayResult<Self> {
        Self::new(GatewayConfig::launch().with_auto_clean(false))
    }

    /// Attaches to an engine on the default port; the working directory is deleted on release.
    pub fn pre_launched_auto_cleaned() -> GatewayResult<Self> {
        Self::new(GatewayConfig::attach(-1))
    }

    /// Attaches to an engine on the default port; the working directory is kept.
    pub fn pre_launched_non_auto_cleaned() -> GatewayResult<Self> {
        Self::new(GatewayConfig::attach(-1).with_auto_clean(false))
    }

    /// Whether release shuts the engine down or only detaches.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Shorthand for `ownership() == Ownership::Owned`.
    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    /// Whether acquisition has been attempted.
    pub fn is_open(&self) -> bool {
        self.source.is_none()
    }

    /// Scratch directory created for this gateway.
    pub fn working_dir(&self) -> &Path {
        self.workdir.path()
    }

    /// Root handed to the engine through `-r`.
    pub fn work_root(&self) -> PathBuf {
        self.workdir.work_root()
    }

    /// Options accumulated for the next run.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Address of the connected engine, once open.
    pub fn engine_address(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(Connection::peer_addr)
    }

    /// Output captured from an owned engine process.
    pub fn engine_logs(&self) -> Vec<LogLine> {
        self.engine
            .as_ref()
            .map(EngineProcess::logs)
            .unwrap_or_default()
    }

    /// Acquire the engine connection now instead of on the first run.
    pub fn open(&mut self) -> GatewayResult<&mut Self> {
        self.connection()?;
        Ok(self)
    }

    fn connection(&mut self) -> GatewayResult<&mut Connection> {
        if self.connection.is_none() {
            let source = self.source.take().ok_or(GatewayError::ConnectionClosed)?;
            let connection = self.acquire(source)?;
            self.connection = Some(connection);
        }
        self.connection.as_mut().ok_or(GatewayError::ConnectionClosed)
    }

    fn acquire(&mut self, source: EngineSource) -> GatewayResult<Connection> {
        match source {
            EngineSource::Launch => {
                let engine = EngineProcess::spawn(&self.launch)?;
                let address = engine.address();
                // Stored before connecting so a failed connect still reaps the child.
                self.engine = Some(engine);
                Connection::connect(address)
            }
            EngineSource::Attach(port) => {
                let port = resolve_attach_port(port)?;
                info!(port, "attaching to pre-launched engine");
                Connection::connect((Ipv4Addr::LOCALHOST, port))
            }
            EngineSource::Existing(connection) => {
                debug!(peer = %connection.peer_addr(), "using provided engine connection");
                Ok(connection)
            }
        }
    }

    // ---------------------------------------------------------------- options

    /// Replace the directories scanned for engine jars before launch.
    pub fn set_jar_dirs<I, P>(&mut self, dirs: I) -> GatewayResult<&mut Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        if self.is_open() {
            return Err(GatewayError::config("gateway is already opened"));
        }
        if !self.is_owned() {
            return Err(GatewayError::config(
                "jar directories only apply to a launched engine",
            ));
        }
        self.launch.jar_dirs = dirs.into_iter().map(Into::into).collect();
        Ok(self)
    }

    /// Set any option by name, replacing a previous value.
    pub fn set_option(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.set(name, value);
        self
    }

    /// Append to any list option by name.
    pub fn add_option(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.add(name, value);
        self
    }

    /// Drop every accumulated option, including the default log directory.
    pub fn clear_options(&mut self) -> &mut Self {
        self.options.clear();
        self
    }

    pub fn set_root(&mut self, work_root: impl Into<String>) -> &mut Self {
        self.set_option(options::ROOT, work_root)
    }

    /// Directory relative table definition files are resolved against.
    pub fn set_table_definitions_root<P: AsRef<Path>>(
        &mut self,
        parts: &[P],
    ) -> GatewayResult<&mut Self> {
        self.set_path_option(options::TABLE_DEFINITIONS_ROOT, parts)
    }

    pub fn set_log_dir<P: AsRef<Path>>(&mut self, parts: &[P]) -> GatewayResult<&mut Self> {
        self.set_path_option(options::LOG_DIR, parts)
    }

    /// Main query, run after setup and before the test query.
    pub fn set_query_file<P: AsRef<Path>>(&mut self, parts: &[P]) -> GatewayResult<&mut Self> {
        self.set_path_option(options::QUERY_FILE, parts)
    }

    pub fn set_query(&mut self, query: impl Into<String>) -> &mut Self {
        self.set_option(options::QUERY, query)
    }

    /// Test query file; the test query produces the output rows.
    pub fn set_test_query_file<P: AsRef<Path>>(
        &mut self,
        parts: &[P],
    ) -> GatewayResult<&mut Self> {
        self.set_path_option(options::TEST_QUERY_FILE, parts)
    }

    pub fn set_test_query(&mut self, query: impl Into<String>) -> &mut Self {
        self.set_option(options::TEST_QUERY, query)
    }

    /// Name shown in engine logs.
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.set_option(options::NAME, name)
    }

    pub fn add_setup_file<P: AsRef<Path>>(&mut self, parts: &[P]) -> GatewayResult<&mut Self> {
        self.add_path_option(options::SETUP_FILE, parts)
    }

    pub fn add_setup_query(&mut self, query: impl Into<String>) -> &mut Self {
        self.add_option(options::SETUP_QUERIES, query)
    }

    pub fn add_table_file<P: AsRef<Path>>(&mut self, parts: &[P]) -> GatewayResult<&mut Self> {
        self.add_path_option(options::TABLE_FILE, parts)
    }

    pub fn add_table_query(&mut self, query: impl Into<String>) -> &mut Self {
        self.add_option(options::TABLE_QUERIES, query)
    }

    pub fn add_param_file<P: AsRef<Path>>(&mut self, parts: &[P]) -> GatewayResult<&mut Self> {
        self.add_path_option(options::PARAM_FILE, parts)
    }

    pub fn add_param_query(&mut self, query: impl Into<String>) -> &mut Self {
        self.add_option(options::PARAM_QUERY, query)
    }

    fn set_path_option<P: AsRef<Path>>(
        &mut self,
        name: &str,
        parts: &[P],
    ) -> GatewayResult<&mut Self> {
        let path = join_path(parts)?;
        Ok(self.set_option(name, path_value(&path)))
    }

    fn add_path_option<P: AsRef<Path>>(
        &mut self,
        name: &str,
        parts: &[P],
    ) -> GatewayResult<&mut Self> {
        let path = join_path(parts)?;
        Ok(self.add_option(name, path_value(&path)))
    }

    // -------------------------------------------------------------- execution

    /// Full argument list for the next invocation.
    ///
    /// The working root comes first, then `extra` verbatim, then every option.
    pub fn invocation_args<S: AsRef<str>>(&self, extra: &[S]) -> Vec<String> {
        let root = path_value(&self.workdir.work_root());
        let mut args = Vec::with_capacity(1 + extra.len() + self.options.len());
        args.push(render_option(WORKING_ROOT_FLAG, &root));
        args.extend(extra.iter().map(|arg| arg.as_ref().to_string()));
        args.extend(self.options.to_args());
        args
    }

    /// Run the engine, installing `query` as the test query when given.
    pub fn run(&mut self, query: Option<&str>) -> GatewayResult<QueryResult> {
        if let Some(query) = query {
            self.set_test_query(query);
        }
        self.invoke(&[] as &[&str])
    }

    /// Run with `parts` joined into the main query file.
    pub fn run_file<P: AsRef<Path>>(&mut self, parts: &[P]) -> GatewayResult<QueryResult> {
        self.set_query_file(parts)?;
        self.invoke(&[] as &[&str])
    }

    /// Run with extra raw arguments placed right after the working root.
    pub fn run_with_args<S: AsRef<str>>(&mut self, extra: &[S]) -> GatewayResult<QueryResult> {
        self.invoke(extra)
    }

    fn invoke<S: AsRef<str>>(&mut self, extra: &[S]) -> GatewayResult<QueryResult> {
        self.connection()?;
        let args = self.invocation_args(extra);
        debug!(args = args.len(), "running engine entry point");
        let outcome = self.connection()?.run(args)?;
        let result = QueryResult::from(outcome);
        debug!(
            rows = result.output.len(),
            errors = result.errors.len(),
            "engine run finished"
        );
        Ok(result)
    }

    // -------------------------------------------------------------- lifecycle

    /// Release the engine connection and report the working directory.
    pub fn close(mut self) -> GatewayResult<()> {
        self.release()
    }

    fn release(&mut self) -> GatewayResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut connection = self.connection.take();
        let outcome = match self.ownership {
            Ownership::Owned => {
                if let Some(connection) = connection.as_mut() {
                    // Bounded by the kill grace; a silent engine still gets killed below.
                    let requested = connection
                        .set_timeout(Some(SHUTDOWN_GRACE))
                        .and_then(|()| connection.shutdown_engine());
                    if let Err(err) = requested {
                        debug!(error = %err, "engine shutdown request failed");
                    }
                }
                drop(connection);
                match self.engine.take() {
                    Some(mut engine) => engine.shutdown(),
                    None => Ok(()),
                }
            }
            Ownership::Borrowed => {
                if connection.is_some() {
                    debug!("detaching from borrowed engine");
                }
                drop(connection);
                Ok(())
            }
        };

        if !self.workdir.auto_clean() {
            info!(path = %self.workdir.path().display(), "working directory left on disk");
        }
        outcome
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "failed to release engine");
        }
    }
}
