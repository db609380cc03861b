//! cachegrand-ctl — command-line client for cachegrandd.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 6379;

fn print_usage() {
    println!("Usage: cachegrand-ctl [--port <port>] <command>");
    println!();
    println!("  ping                   Check the daemon is responding");
    println!("  get <key>              Fetch a key's value");
    println!("  set <key> <value>      Store a key's value");
    println!("  set <key> <value> --px <ms>   Store with a relative expiry");
    println!("  del <key> [<key> ...]  Delete one or more keys, printing the count removed");
    println!();
    println!(
        "Options:\n  --port <port>          Daemon port (default: {})",
        DEFAULT_PORT
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args.get(i).context("--port requires a value")?.parse().context("--port must be a number")?;
        } else {
            remaining.push(args[i].clone());
        }
        i += 1;
    }

    let remaining_refs: Vec<&str> = remaining.iter().map(String::as_str).collect();

    // `set <key> <value> --px <ms>` needs its own parse since `--px` can
    // trail the fixed positional arguments.
    if remaining_refs.first() == Some(&"set") && remaining_refs.len() >= 3 {
        let key = remaining_refs[1];
        let value = remaining_refs[2];
        let px = if remaining_refs.get(3) == Some(&"--px") {
            Some(*remaining_refs.get(4).context("--px requires a value")?)
        } else {
            None
        };
        return cmd::keys::cmd_set(port, key, value, px).await;
    }

    match remaining_refs.as_slice() {
        ["ping"] | [] => cmd::cmd_ping(port).await,
        ["get", key] => cmd::keys::cmd_get(port, key).await,
        ["del", rest @ ..] if !rest.is_empty() => {
            cmd::keys::cmd_del(port, &rest.iter().map(|s| s.to_string()).collect::<Vec<_>>()).await
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
