use std::collections::HashMap;
use std::env;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rill::{Engine, LocalWorker, RillError};
use rill_transport::{start_server, EvalHandler};
use uuid::Uuid;

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Enable with `RUST_LOG=rill=debug` (or `trace` for dispatched programs).
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    if env::var("RUST_LOG").is_ok() {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(EnvFilter::from_default_env())
            .init();
    }
}

fn run() -> Result<(), RillError> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_help();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "-h" | "--help" => {
            print_help();
            Ok(())
        }
        "repl" => cmd_repl(&rest),
        "serve" => cmd_serve(&rest),
        other => {
            eprintln!("unknown command `{other}`");
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    println!("rill — a small expression language with remote delegation");
    println!();
    println!("Usage:");
    println!("  rill repl [--worker ADDR[=TAG,TAG...]]... [--timeout SECS]");
    println!("  rill serve [--listen ADDR]");
    println!();
    println!("With no --worker, the REPL evaluates remote expressions in-process.");
    println!("Wrap any sub-expression as remote(expr) or remote[tag](expr).");
}

fn cmd_repl(args: &[String]) -> Result<(), RillError> {
    let mut builder = Engine::builder();
    let mut has_worker = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--worker" => {
                let Some(spec) = iter.next() else {
                    eprintln!("--worker requires ADDR[=TAG,TAG...]");
                    print_help();
                    return Ok(());
                };
                let (addr, tags) = match spec.split_once('=') {
                    Some((addr, tags)) => (
                        addr.to_string(),
                        tags.split(',')
                            .filter(|tag| !tag.is_empty())
                            .map(str::to_string)
                            .collect(),
                    ),
                    None => (spec.clone(), Vec::new()),
                };
                builder = builder.tcp_worker(addr, tags);
                has_worker = true;
            }
            "--timeout" => {
                let secs = iter.next().and_then(|value| value.parse::<u64>().ok());
                let Some(secs) = secs else {
                    eprintln!("--timeout requires a whole number of seconds");
                    print_help();
                    return Ok(());
                };
                builder = builder.deadline(Duration::from_secs(secs));
            }
            other => {
                eprintln!("unknown flag `{other}`");
                print_help();
                return Ok(());
            }
        }
    }

    if !has_worker {
        builder = builder.worker("local", Vec::new(), Arc::new(LocalWorker::new()));
    }
    let engine = builder.build()?;

    if let Some(resolutions) = engine.take_resolutions() {
        thread::spawn(move || {
            for notice in resolutions {
                println!("[{}] => {}", notice.id, notice.value);
            }
        });
    }

    let stdin = io::stdin();
    loop {
        print!(">> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" {
            println!("Bye!");
            break;
        }

        // Errors discard the line; bindings applied before the failure stay.
        match engine.execute(input) {
            Ok(value) => println!("{value}"),
            Err(err) => eprintln!("error: {err}"),
        }
    }

    Ok(())
}

fn cmd_serve(args: &[String]) -> Result<(), RillError> {
    let mut listen = "127.0.0.1:7170".to_string();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--listen" => {
                let Some(addr) = iter.next() else {
                    eprintln!("--listen requires ADDR");
                    print_help();
                    return Ok(());
                };
                listen = addr.clone();
            }
            other => {
                eprintln!("unknown flag `{other}`");
                print_help();
                return Ok(());
            }
        }
    }

    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid listen address `{listen}`: {err}");
            return Ok(());
        }
    };

    let tasks = Arc::new(TaskLog::default());
    let handler: EvalHandler = {
        let tasks = tasks.clone();
        Arc::new(move |program: String| {
            let id = tasks.begin(&program);
            let result = rill::evaluate_isolated(&program).map_err(|err| err.to_string());
            tasks.finish(id, &result);
            result
        })
    };

    let server = start_server(addr, handler)?;
    println!("rill worker listening on {}", server.local_addr());

    loop {
        thread::park();
    }
}

/// Worker-side bookkeeping of received programs.
#[derive(Default)]
struct TaskLog {
    active: Mutex<HashMap<Uuid, String>>,
}

impl TaskLog {
    fn begin(&self, program: &str) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, program.to_string());
            tracing::info!(%id, in_flight = active.len(), "task received");
        }
        id
    }

    fn finish(&self, id: Uuid, result: &Result<String, String>) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
        match result {
            Ok(value) => tracing::info!(%id, value = %value, "task completed"),
            Err(error) => tracing::warn!(%id, error = %error, "task failed"),
        }
    }
}
