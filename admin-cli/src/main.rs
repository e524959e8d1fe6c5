//! `meshctl`: a thin operator CLI that speaks the node's own wire format
//! directly to issue `NodeAdmin.Retire`/`Resume`/`Describe` calls, since
//! `NodeAdmin` is never published in the cluster view and so can't be
//! reached through a regular `Cluster::call`.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use node_wire::{Frame, JsonProcessor, Processor, RequestFrame};

#[derive(Parser)]
#[command(name = "meshctl", version, about = "Operator CLI for a mesh node")]
struct Cli {
    /// Address of the target node's RPC listener.
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stop accepting new work on every hosted service; in-flight work
    /// finishes normally.
    Retire,
    /// Reverse a previous retire.
    Resume,
    /// Print the node id and the state of every hosted service.
    Describe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let method = match cli.command {
        | Command::Retire => "NodeAdmin.Retire",
        | Command::Resume => "NodeAdmin.Resume",
        | Command::Describe => "NodeAdmin.Describe",
    };

    let reply = call(cli.addr, method).await?;
    match reply.error {
        | Some(message) => {
            eprintln!("{} {message}", "error:".red().bold());
            std::process::exit(1);
        },
        | None => {
            println!("{}", serde_json::to_string_pretty(&reply.payload)?);
        },
    }
    Ok(())
}

async fn call(addr: SocketAddr, service_method: &str) -> anyhow::Result<node_wire::ResponseFrame> {
    let mut stream = TcpStream::connect(addr).await?;
    let processor = JsonProcessor;

    let request = Frame::Request(RequestFrame {
        seq: 1,
        service_method: service_method.to_owned(),
        no_reply: false,
        payload: serde_json::Value::Null,
        addition: None,
    });
    let body = processor.encode(&request)?;
    let mut framed = Vec::with_capacity(3 + body.len());
    framed.extend_from_slice(&(body.len() as u16).to_le_bytes());
    framed.push(processor.id());
    framed.extend_from_slice(&body);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_le_bytes(len_buf) as usize;
    let mut reply_body = vec![0u8; 1 + len];
    stream.read_exact(&mut reply_body).await?;

    let reply_processor = node_wire::ProcessorRegistry::default().get(reply_body[0])?;
    match reply_processor.decode(&reply_body[1..])? {
        | Frame::Response(response) => Ok(response),
        | Frame::Request(_) => anyhow::bail!("node replied with a request frame"),
    }
}
