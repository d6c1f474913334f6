//! tvim - command line client for the tvim daemon
//!
//! # Usage
//!
//! ```bash
//! # List inputs and their states
//! tvim inputs
//!
//! # Follow input registry events
//! tvim watch
//!
//! # Tune an input to a channel and print session events
//! tvim tune com.example.tuner/.TunerService 42
//!
//! # Dump broker state as JSON
//! tvim dump
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tvim_core::{ChannelUri, InputId, SessionToken, TuneParams, UserId};
use tvim_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};
use tvimd::config::{DEFAULT_SOCKET_PATH, ENV_SOCKET};

/// Command line client for the tvim daemon
#[derive(Parser, Debug)]
#[command(name = "tvim", version, about)]
struct Args {
    /// Daemon socket (default: $TVIM_SOCKET, then /tmp/tvim.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Act on this user instead of the active one
    #[arg(long, global = true)]
    user: Option<i32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List inputs and their states
    Inputs,
    /// Print input registry events until interrupted
    Watch,
    /// Tune an input and print session events until interrupted
    Tune {
        input: String,
        channel: i64,
    },
    /// Dump broker state as JSON
    Dump,
}

/// Line-oriented connection to the daemon.
///
/// Events that arrive while waiting for a reply are queued and handed
/// out by [`Connection::next_event`].
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    user: Option<UserId>,
    events: VecDeque<DaemonMessage>,
}

impl Connection {
    async fn open(socket: &Path, user: Option<UserId>) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("Failed to connect to {}", socket.display()))?;
        let (reader, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(reader),
            writer,
            user,
            events: VecDeque::new(),
        };

        conn.send(ClientMessage::connect(None, Vec::new())).await?;
        match conn.read().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
                user_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    bail!("Daemon speaks protocol {protocol_version}, client {}", ProtocolVersion::CURRENT);
                }
                debug!(client_id = %client_id, user = %user_id, "Connected to daemon");
            }
            DaemonMessage::Rejected { reason, .. } => bail!("Daemon rejected connection: {reason}"),
            other => bail!("Unexpected handshake reply: {other:?}"),
        }
        Ok(conn)
    }

    async fn send(&mut self, mut message: ClientMessage) -> Result<()> {
        if let Some(user) = self.user {
            message = message.for_user(user);
        }
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("Daemon closed the connection");
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Sends a request and returns its reply. Errors become `Err`.
    async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        self.send(message).await?;
        loop {
            let msg = self.read().await?;
            if msg.is_event() {
                self.events.push_back(msg);
                continue;
            }
            if let DaemonMessage::Error { message, code } = msg {
                bail!("{message} ({code:?})");
            }
            return Ok(msg);
        }
    }

    async fn next_event(&mut self) -> Result<DaemonMessage> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        self.read().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("tvim=warn".parse()?))
        .init();

    let args = Args::parse();
    let socket = args
        .socket
        .or_else(|| std::env::var_os(ENV_SOCKET).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    let mut conn = Connection::open(&socket, args.user.map(UserId::new)).await?;

    match args.command {
        Command::Inputs => list_inputs(&mut conn).await,
        Command::Watch => watch(&mut conn).await,
        Command::Tune { input, channel } => tune(&mut conn, InputId::new(input), channel).await,
        Command::Dump => {
            match conn.request(ClientMessage::new(tvim_protocol::MessageType::Dump)).await? {
                DaemonMessage::Dump { snapshot } => {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    Ok(())
                }
                other => bail!("Unexpected reply: {other:?}"),
            }
        }
    }
}

async fn list_inputs(conn: &mut Connection) -> Result<()> {
    let DaemonMessage::InputList { inputs } = conn.request(ClientMessage::get_input_list()).await?
    else {
        bail!("Unexpected reply to input list request");
    };

    if inputs.is_empty() {
        println!("No inputs.");
        return Ok(());
    }

    for input in inputs {
        let state = match conn
            .request(ClientMessage::new(tvim_protocol::MessageType::GetInputState {
                input_id: input.id.clone(),
            }))
            .await?
        {
            DaemonMessage::InputState { state, .. } => state.to_string(),
            _ => "unknown".to_string(),
        };
        let label = input.label.as_deref().unwrap_or("-");
        println!(
            "{:<48} {:<14} {:<12} {}",
            input.id.as_str(),
            format!("{:?}", input.input_type).to_lowercase(),
            state,
            label
        );
    }
    Ok(())
}

async fn watch(conn: &mut Connection) -> Result<()> {
    conn.request(ClientMessage::register_callback()).await?;
    println!("Watching input registry (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = conn.next_event() => match event? {
                DaemonMessage::InputAdded { input_id } => println!("added    {input_id}"),
                DaemonMessage::InputRemoved { input_id } => println!("removed  {input_id}"),
                DaemonMessage::InputUpdated { input_id } => println!("updated  {input_id}"),
                DaemonMessage::InputStateChanged { input_id, state } => {
                    println!("state    {input_id} {state}");
                }
                other => debug!(message = ?other, "Ignoring message"),
            },
        }
    }
}

async fn tune(conn: &mut Connection, input_id: InputId, channel: i64) -> Result<()> {
    const SEQ: u64 = 1;

    conn.request(ClientMessage::create_session(input_id.clone(), SEQ))
        .await?;

    let token = wait_for_session(conn, SEQ).await?;
    let Some(token) = token else {
        bail!("Could not create a session on {input_id}");
    };
    println!("session {token} on {input_id}");

    conn.request(ClientMessage::tune(
        token,
        ChannelUri::channel(channel),
        TuneParams::default(),
    ))
    .await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = conn.next_event() => match event? {
                DaemonMessage::SessionEvent { token: t, event, .. } if t == token => {
                    println!("{:<32} {}", event.name(), serde_json::to_string(&event)?);
                }
                DaemonMessage::SessionReleased { token: t, .. } if t == token => {
                    println!("session {token} released by the daemon");
                    return Ok(());
                }
                other => debug!(message = ?other, "Ignoring message"),
            },
        }
    }

    conn.request(ClientMessage::release_session(token)).await?;
    Ok(())
}

async fn wait_for_session(conn: &mut Connection, seq: u64) -> Result<Option<SessionToken>> {
    loop {
        if let DaemonMessage::SessionCreated {
            token, seq: got, ..
        } = conn.next_event().await?
        {
            if got == seq {
                return Ok(token);
            }
        }
    }
}
