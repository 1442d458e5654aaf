//! Request handling for control sessions
//!
//! Maps each request type onto the endpoint registry, the backend or the
//! subscriber set, and translates between wire attributes and backend
//! types. Every request with an id gets exactly one response; query
//! responses arrive later, after the backend answers.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::backend::{
    MediaQuery, PlaybackCommand, PlayerStatus, QueryResult, RepeatMode, StatusEvent, TrackInfo,
};
use crate::constants::PROTOCOL_VERSION;
use crate::endpoint::{AudioEndpoint, Identified};
use crate::error::{BackendError, EndpointError, Error, ProtocolError, Result};
use crate::network::TransportProtocol;
use crate::protocol::{Message, MessageKind, MessageType, ResultCode, Tag, Tlv, TlvAccess};
use crate::server::session::Session;
use crate::server::ServerContext;

/// Route one decoded message from `session`.
pub fn handle(ctx: &Arc<ServerContext>, session: &Arc<Session>, message: Message) {
    match message.kind() {
        MessageKind::Response => {
            session.peer_correlator().on_response(message);
        }
        MessageKind::Indication => {
            tracing::debug!("{}: ignoring indication {:?}", session.id(), message.msg_type);
        }
        MessageKind::Request => {
            if message.id.is_none() {
                tracing::warn!("{}: {:?} without id, dropping", session.id(), message.msg_type);
                return;
            }
            if let Some(response) = handle_request(ctx, session, &message) {
                session.send_response(response);
            }
        }
    }
}

/// Answer a request. `None` when the response will be sent later.
fn handle_request(ctx: &Arc<ServerContext>, session: &Arc<Session>, request: &Message) -> Option<Message> {
    tracing::debug!("{}: {:?} id {:?}", session.id(), request.msg_type, request.id);

    let handshake = matches!(request.msg_type, MessageType::HelloReq | MessageType::PingReq);
    if !handshake && !session.is_greeted() {
        tracing::warn!("{}: {:?} before hello", session.id(), request.msg_type);
        return Some(Message::response_to(request, ResultCode::InvalidRequest));
    }

    let result = match request.msg_type {
        MessageType::HelloReq => hello(ctx, session, request),
        MessageType::PingReq => Ok(Message::response_to(request, ResultCode::Ok)),
        MessageType::CreateAudioEndpointReq => create_endpoint(ctx, session, request),
        MessageType::DeleteAudioEndpointReq => delete_endpoint(ctx, request),
        MessageType::GetAudioEndpointsReq => list_endpoints(ctx, request),
        MessageType::SetAudioEndpointActiveReq => set_endpoint_active(ctx, request),
        MessageType::RenameAudioEndpointReq => rename_endpoint(ctx, request),
        MessageType::SubscribeStatusReq => subscribe(ctx, session, request),
        MessageType::PlayReq
        | MessageType::PauseReq
        | MessageType::ResumeReq
        | MessageType::NextReq
        | MessageType::PreviousReq
        | MessageType::SeekReq
        | MessageType::SetShuffleReq
        | MessageType::SetRepeatReq
        | MessageType::SetVolumeReq => playback(ctx, request),
        MessageType::GetStatusReq
        | MessageType::GetPlaylistsReq
        | MessageType::GetTracksReq
        | MessageType::GetAlbumReq
        | MessageType::GetArtistReq
        | MessageType::SearchReq
        | MessageType::GetImageReq => return forward_query(session, request),
        other => Err(ProtocolError::NotARequest(other).into()),
    };

    Some(result.unwrap_or_else(|e| {
        tracing::info!("{}: {:?} failed: {}", session.id(), request.msg_type, e);
        Message::response_to(request, result_code(&e))
    }))
}

fn hello(ctx: &Arc<ServerContext>, session: &Arc<Session>, request: &Message) -> Result<Message> {
    let version = request.require_int(Tag::Version)?;
    if version != PROTOCOL_VERSION as i64 {
        tracing::warn!(
            "{}: client speaks protocol {}, server {}",
            session.id(),
            version,
            PROTOCOL_VERSION
        );
        return Ok(Message::response_to(request, ResultCode::VersionMismatch)
            .with_int(Tag::Version, PROTOCOL_VERSION as i64));
    }

    if let Some(name) = request.str(Tag::Name).filter(|n| !n.is_empty()) {
        let id = ctx.sessions.rename_resolving(session, name);
        tracing::info!("Session {} from {} is now {}", session.serial(), session.peer(), id);
    }
    session.set_greeted();

    Ok(Message::response_to(request, ResultCode::Ok)
        .with_int(Tag::Version, PROTOCOL_VERSION as i64)
        .with_str(Tag::Id, session.id()))
}

fn create_endpoint(ctx: &Arc<ServerContext>, session: &Arc<Session>, request: &Message) -> Result<Message> {
    let port = request.require_int(Tag::Port)?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| EndpointError::InvalidConfig(format!("port {port}")))?;
    let protocol = match request.str(Tag::Protocol) {
        Some(p) => p
            .parse::<TransportProtocol>()
            .map_err(|_| EndpointError::InvalidConfig(format!("protocol {p}")))?,
        None => TransportProtocol::Udp,
    };
    let name = request
        .str(Tag::Name)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| session.id());

    let peer = SocketAddr::new(session.peer().ip(), port);
    let endpoint = AudioEndpoint::open(&name, Some(session.serial()), peer, protocol, &ctx.config)?;
    let id = ctx.endpoints.register(endpoint);

    Ok(Message::response_to(request, ResultCode::Ok).with_str(Tag::Id, id))
}

fn delete_endpoint(ctx: &Arc<ServerContext>, request: &Message) -> Result<Message> {
    let id = request.require_str(Tag::Id)?;
    let endpoint = ctx
        .endpoints
        .find(id)
        .ok_or_else(|| EndpointError::NotFound(id.to_string()))?;

    ctx.endpoints.unregister(&endpoint);
    endpoint.stop();
    Ok(Message::response_to(request, ResultCode::Ok))
}

fn list_endpoints(ctx: &Arc<ServerContext>, request: &Message) -> Result<Message> {
    let mut response = Message::response_to(request, ResultCode::Ok);
    for endpoint in ctx.endpoints.snapshot() {
        response.push(Tlv::group(
            Tag::Endpoint,
            vec![
                Tlv::str(Tag::Id, endpoint.id()),
                Tlv::bool(Tag::Active, endpoint.is_active()),
                Tlv::str(Tag::Protocol, endpoint.protocol().to_string()),
                Tlv::int(Tag::Port, endpoint.peer().port() as i64),
            ],
        ));
    }
    Ok(response)
}

fn set_endpoint_active(ctx: &Arc<ServerContext>, request: &Message) -> Result<Message> {
    let id = request.require_str(Tag::Id)?;
    let active = request.require_bool(Tag::Active)?;
    let endpoint = ctx
        .endpoints
        .find(id)
        .ok_or_else(|| EndpointError::NotFound(id.to_string()))?;

    endpoint.set_active(active);
    Ok(Message::response_to(request, ResultCode::Ok))
}

fn rename_endpoint(ctx: &Arc<ServerContext>, request: &Message) -> Result<Message> {
    let id = request.require_str(Tag::Id)?;
    let new_id = request.require_str(Tag::NewId)?;
    ctx.endpoints.rename(id, new_id)?;
    tracing::info!("Endpoint {} renamed to {}", id, new_id);
    Ok(Message::response_to(request, ResultCode::Ok).with_str(Tag::Id, new_id))
}

fn subscribe(ctx: &Arc<ServerContext>, session: &Arc<Session>, request: &Message) -> Result<Message> {
    if request.bool(Tag::Active).unwrap_or(true) {
        ctx.subscribers.subscribe(session.serial(), session.clone());
    } else {
        ctx.subscribers.unsubscribe(session.serial());
    }
    Ok(Message::response_to(request, ResultCode::Ok))
}

fn playback(ctx: &Arc<ServerContext>, request: &Message) -> Result<Message> {
    let command = playback_command(request)?;
    ctx.backend.command(command)?;
    Ok(Message::response_to(request, ResultCode::Ok))
}

/// Hand a query to the backend through the session's backend correlator.
/// The completion restores the client's id on the way back.
fn forward_query(session: &Arc<Session>, request: &Message) -> Option<Message> {
    let client_id = request.id;
    let weak = Arc::downgrade(session);
    let mut forwarded = request.clone();
    forwarded.id = None;

    let queued = session
        .backend_correlator()
        .queue_request(forwarded, move |mut response| {
            response.id = client_id;
            if let Some(session) = weak.upgrade() {
                session.send_response(response);
            }
        });

    match queued {
        Ok(token) => {
            tracing::trace!("{}: {:?} forwarded as {}", session.id(), request.msg_type, token);
            None
        }
        Err(e) => {
            tracing::info!("{}: {:?} not forwarded: {}", session.id(), request.msg_type, e);
            Some(Message::response_to(request, result_code(&Error::from(e))))
        }
    }
}

/// Wire result code for a failed request
pub fn result_code(error: &Error) -> ResultCode {
    match error {
        Error::Protocol(ProtocolError::ConnectionClosed) => ResultCode::Failed,
        Error::Protocol(ProtocolError::Rejected(code)) => *code,
        Error::Protocol(_) => ResultCode::InvalidRequest,
        Error::Endpoint(EndpointError::NotFound(_)) => ResultCode::NotFound,
        Error::Endpoint(EndpointError::IdInUse(_)) => ResultCode::Busy,
        Error::Endpoint(EndpointError::InvalidConfig(_)) => ResultCode::InvalidRequest,
        Error::Backend(e) => backend_result_code(e),
        _ => ResultCode::Failed,
    }
}

fn backend_result_code(error: &BackendError) -> ResultCode {
    match error {
        BackendError::NotFound(_) => ResultCode::NotFound,
        BackendError::InvalidArgument(_) => ResultCode::InvalidRequest,
        BackendError::NothingToPlay => ResultCode::Failed,
        BackendError::Unavailable => ResultCode::Busy,
    }
}

fn non_negative<T: TryFrom<i64>>(request: &Message, tag: Tag) -> std::result::Result<T, ProtocolError> {
    let value = request.require_int(tag)?;
    T::try_from(value).map_err(|_| ProtocolError::Malformed(format!("{tag:?} out of range: {value}")))
}

/// Playback command carried by a control request
pub fn playback_command(request: &Message) -> std::result::Result<PlaybackCommand, ProtocolError> {
    let command = match request.msg_type {
        MessageType::PlayReq => PlaybackCommand::Play {
            playlist: request.str(Tag::Playlist).map(str::to_string),
            track: request.str(Tag::Track).map(str::to_string),
        },
        MessageType::PauseReq => PlaybackCommand::Pause,
        MessageType::ResumeReq => PlaybackCommand::Resume,
        MessageType::NextReq => PlaybackCommand::Next,
        MessageType::PreviousReq => PlaybackCommand::Previous,
        MessageType::SeekReq => PlaybackCommand::Seek {
            position_ms: non_negative(request, Tag::Position)?,
        },
        MessageType::SetShuffleReq => PlaybackCommand::SetShuffle(request.require_bool(Tag::Shuffle)?),
        MessageType::SetRepeatReq => {
            let mode = request.require_str(Tag::Repeat)?;
            PlaybackCommand::SetRepeat(
                mode.parse::<RepeatMode>()
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            )
        }
        MessageType::SetVolumeReq => PlaybackCommand::SetVolume(non_negative(request, Tag::Volume)?),
        other => return Err(ProtocolError::Malformed(format!("{other:?} is not a playback command"))),
    };
    Ok(command)
}

/// Backend query carried by a control request
pub fn media_query(request: &Message) -> std::result::Result<MediaQuery, ProtocolError> {
    let text = |tag: Tag| request.require_str(tag).map(str::to_string);
    let query = match request.msg_type {
        MessageType::GetStatusReq => MediaQuery::Status,
        MessageType::GetPlaylistsReq => MediaQuery::Playlists,
        MessageType::GetTracksReq => MediaQuery::Tracks {
            playlist: text(Tag::Playlist)?,
        },
        MessageType::GetAlbumReq => MediaQuery::Album { uri: text(Tag::Uri)? },
        MessageType::GetArtistReq => MediaQuery::Artist { uri: text(Tag::Uri)? },
        MessageType::SearchReq => MediaQuery::Search {
            query: text(Tag::Query)?,
        },
        MessageType::GetImageReq => MediaQuery::Image { uri: text(Tag::Uri)? },
        other => return Err(ProtocolError::Malformed(format!("{other:?} is not a query"))),
    };
    Ok(query)
}

fn track_group(tag: Tag, track: &TrackInfo) -> Tlv {
    Tlv::group(
        tag,
        vec![
            Tlv::str(Tag::Uri, track.uri.clone()),
            Tlv::str(Tag::Title, track.title.clone()),
            Tlv::str(Tag::Artist, track.artist.clone()),
            Tlv::str(Tag::Album, track.album.clone()),
            Tlv::int(Tag::Duration, track.duration_ms as i64),
        ],
    )
}

fn status_attributes(status: &PlayerStatus) -> Vec<Tlv> {
    let mut attributes = vec![
        Tlv::str(Tag::State, status.state.as_str()),
        Tlv::int(Tag::Position, status.position_ms as i64),
        Tlv::int(Tag::Volume, status.volume as i64),
        Tlv::bool(Tag::Shuffle, status.shuffle),
        Tlv::str(Tag::Repeat, status.repeat.to_string()),
    ];
    if let Some(track) = &status.track {
        attributes.push(track_group(Tag::Track, track));
    }
    attributes
}

/// Response message for a backend query result
pub fn query_response(
    response_type: MessageType,
    id: u32,
    result: std::result::Result<QueryResult, BackendError>,
) -> Message {
    let code = match &result {
        Ok(_) => ResultCode::Ok,
        Err(e) => backend_result_code(e),
    };
    let mut response = Message::new(response_type)
        .with_id(id)
        .with_int(Tag::Result, code.as_i64());

    let attributes = match result {
        Ok(QueryResult::Status(status)) => status_attributes(&status),
        Ok(QueryResult::Playlists(playlists)) => playlists
            .iter()
            .map(|p| {
                Tlv::group(
                    Tag::Playlist,
                    vec![
                        Tlv::str(Tag::Uri, p.uri.clone()),
                        Tlv::str(Tag::Name, p.name.clone()),
                        Tlv::int(Tag::Track, p.track_count as i64),
                    ],
                )
            })
            .collect(),
        Ok(QueryResult::Tracks(tracks)) | Ok(QueryResult::Search(tracks)) => {
            tracks.iter().map(|t| track_group(Tag::Track, t)).collect()
        }
        Ok(QueryResult::Album(album)) => {
            let mut children = vec![
                Tlv::str(Tag::Uri, album.uri),
                Tlv::str(Tag::Title, album.title),
                Tlv::str(Tag::Artist, album.artist),
            ];
            children.extend(album.tracks.iter().map(|t| track_group(Tag::Track, t)));
            vec![Tlv::group(Tag::Album, children)]
        }
        Ok(QueryResult::Artist(artist)) => {
            let mut children = vec![Tlv::str(Tag::Uri, artist.uri), Tlv::str(Tag::Name, artist.name)];
            children.extend(artist.albums.into_iter().map(|a| Tlv::str(Tag::Album, a)));
            vec![Tlv::group(Tag::Artist, children)]
        }
        Ok(QueryResult::Image { mime, data }) => {
            vec![Tlv::str(Tag::Name, mime), Tlv::bytes(Tag::Image, data)]
        }
        Err(e) => {
            tracing::debug!("Query {} answered with error: {}", id, e);
            Vec::new()
        }
    };
    response.attributes.extend(attributes);
    response
}

/// Status indication for a backend event
pub fn status_indication(event: &StatusEvent) -> Message {
    let mut message = Message::new(MessageType::StatusInd).with_str(Tag::Event, event.kind.as_str());
    if let Some(state) = event.state {
        message.push(Tlv::str(Tag::State, state.as_str()));
    }
    if let Some(track) = &event.track {
        message.push(track_group(Tag::Track, track));
    }
    if let Some(position) = event.position_ms {
        message.push(Tlv::int(Tag::Position, position as i64));
    }
    if let Some(volume) = event.volume {
        message.push(Tlv::int(Tag::Volume, volume as i64));
    }
    if let Some(shuffle) = event.shuffle {
        message.push(Tlv::bool(Tag::Shuffle, shuffle));
    }
    if let Some(repeat) = event.repeat {
        message.push(Tlv::str(Tag::Repeat, repeat.to_string()));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PlaybackState, PlaylistInfo};

    #[test]
    fn test_playback_command_parsing() {
        let seek = Message::new(MessageType::SeekReq).with_int(Tag::Position, 1500);
        assert_eq!(playback_command(&seek).unwrap(), PlaybackCommand::Seek { position_ms: 1500 });

        let negative = Message::new(MessageType::SeekReq).with_int(Tag::Position, -1);
        assert!(matches!(playback_command(&negative), Err(ProtocolError::Malformed(_))));

        let loud = Message::new(MessageType::SetVolumeReq).with_int(Tag::Volume, 300);
        assert!(playback_command(&loud).is_err());

        let repeat = Message::new(MessageType::SetRepeatReq).with_str(Tag::Repeat, "one");
        assert_eq!(
            playback_command(&repeat).unwrap(),
            PlaybackCommand::SetRepeat(RepeatMode::One)
        );

        let missing = Message::new(MessageType::SetShuffleReq);
        assert!(matches!(
            playback_command(&missing),
            Err(ProtocolError::MissingAttribute(Tag::Shuffle))
        ));
    }

    #[test]
    fn test_media_query_parsing() {
        let tracks = Message::new(MessageType::GetTracksReq).with_str(Tag::Playlist, "tone:playlist:all");
        assert_eq!(
            media_query(&tracks).unwrap(),
            MediaQuery::Tracks { playlist: "tone:playlist:all".into() }
        );
        assert!(media_query(&Message::new(MessageType::SearchReq)).is_err());
        assert!(media_query(&Message::new(MessageType::PlayReq)).is_err());
    }

    #[test]
    fn test_query_response_shapes() {
        let ok = query_response(
            MessageType::GetPlaylistsRsp,
            12,
            Ok(QueryResult::Playlists(vec![PlaylistInfo {
                uri: "p".into(),
                name: "P".into(),
                track_count: 3,
            }])),
        );
        assert_eq!(ok.id, Some(12));
        assert!(ok.is_ok());
        assert_eq!(ok.groups(Tag::Playlist)[0].int(Tag::Track), Some(3));

        let missing = query_response(
            MessageType::GetAlbumRsp,
            13,
            Err(BackendError::NotFound("x".into())),
        );
        assert_eq!(missing.result(), ResultCode::NotFound);
        assert_eq!(missing.attributes.len(), 1);
    }

    #[test]
    fn test_status_indication() {
        let message = status_indication(&StatusEvent::state(PlaybackState::Paused));
        assert_eq!(message.msg_type, MessageType::StatusInd);
        assert_eq!(message.str(Tag::Event), Some("state"));
        assert_eq!(message.str(Tag::State), Some("paused"));
        assert!(message.int(Tag::Volume).is_none());
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(
            result_code(&EndpointError::IdInUse("a".into()).into()),
            ResultCode::Busy
        );
        assert_eq!(
            result_code(&ProtocolError::MissingAttribute(Tag::Port).into()),
            ResultCode::InvalidRequest
        );
        assert_eq!(
            result_code(&BackendError::NotFound("t".into()).into()),
            ResultCode::NotFound
        );
    }
}
