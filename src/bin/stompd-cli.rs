//! stompd-cli – interactive STOMP client shell.
//
//  $ stompd-cli connect 127.0.0.1:61613 --login alice --passcode secret
//  > sub /topic/chat
//  > send /topic/chat hello
//  [/topic/chat] msg-1 hello
use anyhow::{anyhow, bail};
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use stompd::core::frame::{
    encode_frame, header, try_decode_frame, StompItem, DEFAULT_MAX_FRAME_SIZE,
};
use stompd::{Command, Frame};

#[derive(Debug, Parser)]
#[command(name = "stompd-cli", version, about = "Interactive STOMP client shell")]
struct Cli {
    #[command(subcommand)]
    cmd: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: String,
        #[arg(long)]
        login: Option<String>,
        #[arg(long)]
        passcode: Option<String>,
        /// Virtual host sent in the CONNECT frame
        #[arg(long, default_value = "/")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.cmd {
        CliCommand::Connect {
            addr,
            login,
            passcode,
            host,
        } => repl(&addr, &host, login, passcode).await?,
    }
    Ok(())
}

async fn write_frame(w: &mut OwnedWriteHalf, frame: &Frame) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame(r: &mut OwnedReadHalf, buf: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
    loop {
        while let Some(item) = try_decode_frame(buf, DEFAULT_MAX_FRAME_SIZE)? {
            if let StompItem::Frame(frame) = item {
                return Ok(Some(frame));
            }
        }
        if r.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

fn print_frame(frame: &Frame) {
    let body = String::from_utf8_lossy(&frame.body);
    match frame.command {
        Command::Message => println!(
            "[{}] {} {}",
            frame.header(header::DESTINATION).unwrap_or("?"),
            frame.header(header::MESSAGE_ID).unwrap_or("?"),
            body
        ),
        Command::Receipt => println!(
            "receipt {}",
            frame.header(header::RECEIPT_ID).unwrap_or("?")
        ),
        Command::Error => println!(
            "error: {}",
            frame.header(header::MESSAGE).unwrap_or(body.as_ref())
        ),
        _ => println!("{frame}"),
    }
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
async fn repl(
    addr: &str,
    host: &str,
    login: Option<String>,
    passcode: Option<String>,
) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;

    let stream = TcpStream::connect(addr).await?;
    let (mut r, mut w) = stream.into_split();
    let mut read_buf = BytesMut::new();

    let mut connect = Frame::new(Command::Connect)
        .with_header(header::ACCEPT_VERSION, "1.0,1.1,1.2")
        .with_header(header::HOST, host)
        .with_header(header::HEART_BEAT, "0,0");
    if let Some(login) = login {
        connect.set_header(header::LOGIN, login);
    }
    if let Some(passcode) = passcode {
        connect.set_header(header::PASSCODE, passcode);
    }
    write_frame(&mut w, &connect).await?;

    match read_frame(&mut r, &mut read_buf).await? {
        Some(frame) if frame.command == Command::Connected => println!(
            "Connected to {addr} (STOMP {}, session {}). Type `help` for commands.",
            frame.header(header::VERSION).unwrap_or("1.0"),
            frame.header(header::SESSION).unwrap_or("-"),
        ),
        Some(frame) => {
            print_frame(&frame);
            bail!("broker refused the connection");
        }
        None => return Err(anyhow!("broker closed the connection during CONNECT")),
    }

    // Background task to receive and print frames from the broker
    let printer: JoinHandle<()> = tokio::spawn(async move {
        loop {
            match read_frame(&mut r, &mut read_buf).await {
                Ok(Some(frame)) => print_frame(&frame),
                Ok(None) => {
                    println!("connection closed by broker");
                    break;
                }
                Err(e) => {
                    println!("❌ Failed to decode frame: {e}");
                    break;
                }
            }
        }
    });

    let mut next_sub = 1u64;

    // Main interactive REPL loop
    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        let frame = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["help"] => {
                println!(
                    "send <dest> <msg> | sub <dest> [auto|client|client-individual] | \
                     unsub <id> | ack <message-id> | nack <message-id> | exit"
                );
                continue;
            }
            ["exit" | "quit"] => break,

            ["send", dest, rest @ ..] => Frame::new(Command::Send)
                .with_header(header::DESTINATION, *dest)
                .with_header(header::CONTENT_TYPE, "text/plain")
                .with_body(rest.join(" ")),

            ["sub", dest, mode @ ..] => {
                let id = format!("sub-{next_sub}");
                next_sub += 1;
                println!("subscription id {id}");
                Frame::new(Command::Subscribe)
                    .with_header(header::ID, id)
                    .with_header(header::DESTINATION, *dest)
                    .with_header(header::ACK, mode.first().copied().unwrap_or("auto"))
            }

            ["unsub", id] => Frame::new(Command::Unsubscribe).with_header(header::ID, *id),
            ["ack", id] => Frame::new(Command::Ack).with_header(header::ID, *id),
            ["nack", id] => Frame::new(Command::Nack).with_header(header::ID, *id),

            _ => {
                println!("Unknown cmd. Type `help`.");
                continue;
            }
        };
        write_frame(&mut w, &frame).await?;
    }

    let disconnect = Frame::new(Command::Disconnect)
        .with_header(header::RECEIPT, "disconnect");
    write_frame(&mut w, &disconnect).await?;
    let _ = printer.await;
    Ok(())
}
