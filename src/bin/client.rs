use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};

use raftkv::Clerk;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Comma-separated kv addresses for every node in the cluster
    #[arg(short, long, value_delimiter = ',')]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Put a single key/value pair
    Put { key: String, value: String },
    /// Get a single key
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.servers.is_empty() {
        anyhow::bail!("pass at least one --servers address");
    }
    let clerk = Clerk::new(cli.servers);

    match cli.command {
        Some(Commands::Put { key, value }) => {
            clerk.put(&key, &value).await;
            println!("OK");
        }
        Some(Commands::Get { key }) => match clerk.get(&key).await {
            Some(value) => println!("{value}"),
            None => println!("ErrNoKey"),
        },
        None => repl(&clerk).await?,
    }

    Ok(())
}

async fn repl(clerk: &Clerk) -> Result<()> {
    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        match parts.as_slice() {
            ["put", key, value] => {
                clerk.put(key, value).await;
                println!("Put OK");
            }
            ["get", key] => match clerk.get(key).await {
                Some(value) => println!("Value: {value}"),
                None => println!("Value: <no key>"),
            },
            ["exit"] => break,
            [] => {}
            _ => println!("Usage: put <key> <value> | get <key> | exit"),
        }
        print!("> ");
        io::stdout().flush()?;
    }
    Ok(())
}
