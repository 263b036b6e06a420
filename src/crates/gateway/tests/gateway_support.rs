use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use huter_gateway::protocol::{
    read_message, write_message, Request, RequestEnvelope, Response, ResponseEnvelope, RunOutcome,
};
use serde_json::Value;

type Responder = dyn Fn(&[String]) -> Response + Send + Sync;

/// In-process engine answering every run with a canned response.
pub struct CannedEngine {
    addr: SocketAddr,
    runs: Arc<Mutex<Vec<Vec<String>>>>,
    shutdowns: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
}

impl CannedEngine {
    pub fn start(responder: impl Fn(&[String]) -> Response + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind canned engine");
        let addr = listener.local_addr().expect("local addr");
        let runs = Arc::new(Mutex::new(Vec::new()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let responder: Arc<Responder> = Arc::new(responder);

        {
            let runs = runs.clone();
            let shutdowns = shutdowns.clone();
            let connections = connections.clone();
            thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let runs = runs.clone();
                    let shutdowns = shutdowns.clone();
                    let responder = responder.clone();
                    thread::spawn(move || serve(stream, &*responder, &runs, &shutdowns));
                }
            });
        }

        Self {
            addr,
            runs,
            shutdowns,
            connections,
        }
    }

    /// Engine answering every run with the given rows and errors.
    pub fn with_outcome(output: Vec<Vec<Value>>, errors: Vec<&str>) -> Self {
        let errors: Vec<String> = errors.into_iter().map(str::to_string).collect();
        Self::start(move |_args| {
            Response::Completed(RunOutcome {
                output: output.clone(),
                errors: errors.clone(),
                engine_output: Value::String("canned".to_string()),
            })
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> i32 {
        i32::from(self.addr.port())
    }

    /// Argument lists of every run received so far.
    pub fn runs(&self) -> Vec<Vec<String>> {
        self.runs.lock().expect("runs lock").clone()
    }

    pub fn shutdown_requests(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve(
    mut stream: TcpStream,
    responder: &Responder,
    runs: &Mutex<Vec<Vec<String>>>,
    shutdowns: &AtomicUsize,
) {
    while let Ok(envelope) = read_message::<_, RequestEnvelope>(&mut stream) {
        let payload = match envelope.payload {
            Request::Run { args } => {
                let response = responder(&args);
                if let Ok(mut runs) = runs.lock() {
                    runs.push(args);
                }
                response
            }
            Request::Shutdown => {
                shutdowns.fetch_add(1, Ordering::SeqCst);
                Response::ShuttingDown
            }
        };
        let response = ResponseEnvelope {
            id: envelope.id,
            payload,
        };
        if write_message(&mut stream, &response).is_err() {
            return;
        }
    }
}
