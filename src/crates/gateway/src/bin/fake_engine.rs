//! Stand-in engine speaking the gateway protocol, used by integration tests.
//!
//! It evaluates a tiny `SELECT literal, ...` subset of the test query so
//! tests can observe rows, query errors and engine failures end to end.
//!
//! With `FAKE_ENGINE_STALL` set it reads requests without ever answering and
//! ignores stdin EOF, standing in for a wedged engine.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread;

use huter_gateway::protocol::{
    read_message, write_message, Request, RequestEnvelope, Response, ResponseEnvelope, RunOutcome,
};
use huter_gateway::GatewayError;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const STALL_ENV: &str = "FAKE_ENGINE_STALL";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut argv = std::env::args().skip(1);
    let mut class_path = String::new();
    let mut port = 0u16;
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-cp" => class_path = argv.next().unwrap_or_default(),
            "--port" => port = argv.next().and_then(|p| p.parse().ok()).unwrap_or(0),
            _ => {}
        }
    }

    let stall = std::env::var_os(STALL_ENV).is_some();
    eprintln!("fake engine pid {}", std::process::id());

    let listener = TcpListener::bind(("127.0.0.1", port))?;
    let addr = listener.local_addr()?;
    println!("classpath {class_path}");
    println!("listening on {addr}");
    io::stdout().flush()?;

    if stall {
        info!("stalling: requests will not be answered");
        for stream in listener.incoming() {
            let stream = stream?;
            thread::spawn(move || swallow(stream));
        }
        return Ok(());
    }

    // Exit together with the owner: its end of stdin closes when it goes away.
    thread::spawn(|| {
        let mut sink = Vec::new();
        let _ = io::stdin().read_to_end(&mut sink);
        info!("stdin closed, exiting");
        std::process::exit(0);
    });

    for stream in listener.incoming() {
        let stream = stream?;
        thread::spawn(move || serve(stream));
    }
    Ok(())
}

fn swallow(mut stream: TcpStream) {
    while let Ok(envelope) = read_message::<_, RequestEnvelope>(&mut stream) {
        debug!(id = envelope.id, "ignoring request");
    }
}

fn serve(mut stream: TcpStream) {
    loop {
        let envelope: RequestEnvelope = match read_message(&mut stream) {
            Ok(envelope) => envelope,
            Err(GatewayError::ConnectionClosed) => {
                debug!("client detached");
                return;
            }
            Err(err) => {
                debug!(error = %err, "dropping connection");
                return;
            }
        };

        let (payload, exit) = match envelope.payload {
            Request::Run { args } => (handle_run(&args), false),
            Request::Shutdown => (Response::ShuttingDown, true),
        };
        let response = ResponseEnvelope {
            id: envelope.id,
            payload,
        };
        if write_message(&mut stream, &response).is_err() {
            return;
        }
        if exit {
            info!("shutdown requested");
            std::process::exit(0);
        }
    }
}

fn handle_run(args: &[String]) -> Response {
    info!(args = args.len(), "run requested");
    let options = parse_args(args);

    for key in ["query-file", "test-query-file", "table-definitions-root"] {
        if let Some(path) = options.get(key) {
            if !Path::new(path).exists() {
                return Response::Failed {
                    message: format!("error: {key} does not exist: {path}"),
                };
            }
        }
    }

    let test_query = match options.get("test-query-file") {
        Some(path) => match fs_err::read_to_string(path) {
            Ok(content) => Some(content),
            Err(err) => {
                return Response::Completed(RunOutcome {
                    output: Vec::new(),
                    errors: vec![format!("huter_error: {err}")],
                    engine_output: Value::Null,
                })
            }
        },
        None => options.get("test-query").cloned(),
    };

    let engine_output = json!({
        "args": args,
        "name": options.get("name").cloned().unwrap_or_else(|| "unnamed".to_string()),
    });

    let Some(query) = test_query.map(|query| query.trim().to_string()) else {
        return Response::Completed(RunOutcome {
            output: Vec::new(),
            errors: Vec::new(),
            engine_output,
        });
    };

    if let Some(message) = query.strip_prefix("RAISE ") {
        return Response::Failed {
            message: message.trim().to_string(),
        };
    }

    let output = match evaluate_select(&query) {
        Some(row) => vec![row],
        None => Vec::new(),
    };
    let errors = validate(&output);
    Response::Completed(RunOutcome {
        output,
        errors,
        engine_output,
    })
}

/// Split `--name=value` and `-x value` arguments into a map; repeated names keep the last value.
fn parse_args(args: &[String]) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    for arg in args {
        let parsed = if let Some(long) = arg.strip_prefix("--") {
            long.split_once('=')
        } else if let Some(short) = arg.strip_prefix('-') {
            short.split_once(' ')
        } else {
            None
        };
        if let Some((name, value)) = parsed {
            options.insert(name.to_string(), value.to_string());
        }
    }
    options
}

fn evaluate_select(query: &str) -> Option<Vec<Value>> {
    let lower = query.to_ascii_lowercase();
    if !lower.starts_with("select") {
        return None;
    }
    let list = query["select".len()..].trim().trim_end_matches(';');
    Some(
        split_top_level(list)
            .into_iter()
            .map(|expr| evaluate_expr(strip_alias(expr)))
            .collect(),
    )
}

fn evaluate_expr(expr: &str) -> Value {
    let expr = expr.trim();
    if expr.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if expr.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if expr.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int) = expr.parse::<i64>() {
        return json!(int);
    }
    if let Ok(float) = expr.parse::<f64>() {
        return json!(float);
    }
    if let Some(text) = unquote(expr) {
        return Value::String(text.to_string());
    }
    if let Some(inner) = expr
        .strip_prefix("named_struct(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        // Structs travel as their JSON string encoding.
        let fields = split_top_level(inner);
        let mut object = Map::new();
        for pair in fields.chunks(2) {
            if let [name, value] = pair {
                let name = unquote(name.trim()).unwrap_or(name.trim());
                object.insert(name.to_string(), evaluate_expr(value));
            }
        }
        return Value::String(Value::Object(object).to_string());
    }
    Value::String(expr.to_string())
}

fn unquote(expr: &str) -> Option<&str> {
    ['\'', '"'].iter().find_map(|quote| {
        expr.strip_prefix(*quote)
            .and_then(|rest| rest.strip_suffix(*quote))
    })
}

fn strip_alias(expr: &str) -> &str {
    let lower = expr.to_ascii_lowercase();
    match lower.rfind(" as ") {
        Some(idx) if !expr[idx..].contains(')') && !expr[idx..].contains('\'') => &expr[..idx],
        _ => expr,
    }
}

fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, ch) in list.char_indices() {
        match (quote, ch) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(list[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = list[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Any `false` column fails the test line.
fn validate(rows: &[Vec<Value>]) -> Vec<String> {
    rows.iter()
        .find(|row| row.iter().any(|value| value == &Value::Bool(false)))
        .map(|row| {
            let rendered: Vec<String> = row.iter().map(Value::to_string).collect();
            vec![format!("test line has failure, line=[{}]", rendered.join(", "))]
        })
        .unwrap_or_default()
}
