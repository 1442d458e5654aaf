//! Relay Control Client
//!
//! Connects to a relay server, performs the hello handshake and issues one
//! command, printing the response.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::{ArgAction, Parser, Subcommand};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_media_relay::{
    constants::{DEFAULT_CONTROL_PORT, PROTOCOL_VERSION},
    network::TransportProtocol,
    protocol::{Message, MessageCodec, MessageCorrelator, MessageKind, MessageType, ResultCode, Tag, Tlv, TlvAccess, TlvValue},
    server::session::ConnectionWriter,
};

#[derive(Parser, Debug)]
#[command(name = "relay-client", version, about = "Control client for the LAN media relay")]
struct Args {
    /// Server control address
    #[arg(short, long, default_value_t = format!("127.0.0.1:{DEFAULT_CONTROL_PORT}"))]
    server: String,

    /// Name announced in the hello handshake
    #[arg(short, long, default_value = "relay-client")]
    name: String,

    /// Response timeout in milliseconds
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    /// Print messages as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show player status
    Status,
    /// List audio endpoints
    Endpoints,
    /// Stream audio to this host
    CreateEndpoint {
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "udp")]
        protocol: TransportProtocol,
        #[arg(long)]
        name: Option<String>,
    },
    DeleteEndpoint { id: String },
    SetActive {
        id: String,
        #[arg(action = ArgAction::Set)]
        active: bool,
    },
    Rename { id: String, new_id: String },
    Playlists,
    Tracks { playlist: String },
    Album { uri: String },
    Artist { uri: String },
    Search { query: String },
    Play {
        #[arg(long)]
        playlist: Option<String>,
        #[arg(long)]
        track: Option<String>,
    },
    Pause,
    Resume,
    Next,
    Previous,
    Seek { position_ms: u32 },
    Volume { level: u8 },
    Shuffle {
        #[arg(action = ArgAction::Set)]
        on: bool,
    },
    Repeat { mode: String },
    /// Subscribe and print status updates
    Watch {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn request(command: &Command) -> Message {
    match command {
        Command::Status => Message::new(MessageType::GetStatusReq),
        Command::Endpoints => Message::new(MessageType::GetAudioEndpointsReq),
        Command::CreateEndpoint { port, protocol, name } => {
            let mut message = Message::new(MessageType::CreateAudioEndpointReq)
                .with_int(Tag::Port, *port as i64)
                .with_str(Tag::Protocol, protocol.to_string());
            if let Some(name) = name {
                message.push(Tlv::str(Tag::Name, name.clone()));
            }
            message
        }
        Command::DeleteEndpoint { id } => Message::new(MessageType::DeleteAudioEndpointReq).with_str(Tag::Id, id.clone()),
        Command::SetActive { id, active } => Message::new(MessageType::SetAudioEndpointActiveReq)
            .with_str(Tag::Id, id.clone())
            .with_bool(Tag::Active, *active),
        Command::Rename { id, new_id } => Message::new(MessageType::RenameAudioEndpointReq)
            .with_str(Tag::Id, id.clone())
            .with_str(Tag::NewId, new_id.clone()),
        Command::Playlists => Message::new(MessageType::GetPlaylistsReq),
        Command::Tracks { playlist } => Message::new(MessageType::GetTracksReq).with_str(Tag::Playlist, playlist.clone()),
        Command::Album { uri } => Message::new(MessageType::GetAlbumReq).with_str(Tag::Uri, uri.clone()),
        Command::Artist { uri } => Message::new(MessageType::GetArtistReq).with_str(Tag::Uri, uri.clone()),
        Command::Search { query } => Message::new(MessageType::SearchReq).with_str(Tag::Query, query.clone()),
        Command::Play { playlist, track } => {
            let mut message = Message::new(MessageType::PlayReq);
            if let Some(playlist) = playlist {
                message.push(Tlv::str(Tag::Playlist, playlist.clone()));
            }
            if let Some(track) = track {
                message.push(Tlv::str(Tag::Track, track.clone()));
            }
            message
        }
        Command::Pause => Message::new(MessageType::PauseReq),
        Command::Resume => Message::new(MessageType::ResumeReq),
        Command::Next => Message::new(MessageType::NextReq),
        Command::Previous => Message::new(MessageType::PreviousReq),
        Command::Seek { position_ms } => Message::new(MessageType::SeekReq).with_int(Tag::Position, *position_ms as i64),
        Command::Volume { level } => Message::new(MessageType::SetVolumeReq).with_int(Tag::Volume, *level as i64),
        Command::Shuffle { on } => Message::new(MessageType::SetShuffleReq).with_bool(Tag::Shuffle, *on),
        Command::Repeat { mode } => Message::new(MessageType::SetRepeatReq).with_str(Tag::Repeat, mode.clone()),
        Command::Watch { .. } => Message::new(MessageType::SubscribeStatusReq).with_bool(Tag::Active, true),
    }
}

fn print_message(message: &Message, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(message)?);
    } else {
        print_attributes(&message.attributes, 0);
    }
    Ok(())
}

fn print_attributes(attributes: &[Tlv], depth: usize) {
    let indent = "  ".repeat(depth);
    for attribute in attributes {
        match &attribute.value {
            TlvValue::Int(v) => println!("{indent}{:?}: {v}", attribute.tag),
            TlvValue::Bool(v) => println!("{indent}{:?}: {v}", attribute.tag),
            TlvValue::Str(v) => println!("{indent}{:?}: {v}", attribute.tag),
            TlvValue::Bytes(v) => println!("{indent}{:?}: <{} bytes>", attribute.tag, v.len()),
            TlvValue::Group(children) => {
                println!("{indent}{:?}:", attribute.tag);
                print_attributes(children, depth + 1);
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    let stream = TcpStream::connect(&args.server).with_context(|| format!("connecting to {}", args.server))?;
    stream.set_nodelay(true)?;
    let codec = MessageCodec::default();
    let correlator = Arc::new(MessageCorrelator::new(
        "client",
        Arc::new(ConnectionWriter::new(stream.try_clone()?, codec)),
    ));

    // Reader: responses to the correlator, indications to the printer
    let (indications_tx, indications) = unbounded();
    let reader_correlator = correlator.clone();
    let mut reader = stream.try_clone()?;
    thread::Builder::new().name("client-reader".to_string()).spawn(move || {
        let mut buf = BytesMut::new();
        while let Ok(Some(message)) = codec.read_message(&mut reader, &mut buf) {
            match message.kind() {
                MessageKind::Response => {
                    reader_correlator.on_response(message);
                }
                MessageKind::Indication => {
                    let _ = indications_tx.send(message);
                }
                MessageKind::Request => tracing::debug!("Ignoring server request {:?}", message.msg_type),
            }
        }
        reader_correlator.close();
    })?;

    let hello = correlator.request_blocking(
        Message::new(MessageType::HelloReq)
            .with_int(Tag::Version, PROTOCOL_VERSION as i64)
            .with_str(Tag::Name, args.name.clone()),
        timeout,
    )?;
    match hello.result() {
        ResultCode::Ok => {}
        ResultCode::VersionMismatch => bail!(
            "server speaks protocol {:?}, client {}",
            hello.int(Tag::Version),
            PROTOCOL_VERSION
        ),
        other => bail!("hello rejected: {other:?}"),
    }

    let response = correlator.request_blocking(request(&args.command), timeout)?;
    if !response.is_ok() {
        bail!("{:?} failed: {:?}", response.msg_type, response.result());
    }
    print_message(&response, args.json)?;

    if let Command::Watch { seconds } = args.command {
        let deadline = Instant::now() + Duration::from_secs(seconds);
        let mut last_ping = Instant::now();
        while Instant::now() < deadline {
            match indications.recv_timeout(Duration::from_millis(200)) {
                Ok(indication) => {
                    println!("--");
                    print_message(&indication, args.json)?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if last_ping.elapsed() >= Duration::from_secs(1) {
                correlator.request_blocking(Message::new(MessageType::PingReq), timeout)?;
                last_ping = Instant::now();
            }
        }
    }

    let _ = stream.shutdown(std::net::Shutdown::Both);
    Ok(())
}
