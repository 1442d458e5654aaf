//! Control-protocol message model
//!
//! A message is a type tag, an optional numeric id and a tree of tagged
//! attributes. Requests carry an id assigned by the sender, responses echo
//! the id of the request they answer, indications get a fresh id and expect
//! no answer.

use serde::de::DeserializeSeed;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// How a message participates in request/response correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Indication,
}

macro_rules! message_types {
    (
        requests { $($req:ident => $rsp:ident),* $(,)? }
        indications { $($ind:ident),* $(,)? }
    ) => {
        /// Every message type on the control connection
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum MessageType {
            $($req, $rsp,)*
            $($ind,)*
        }

        impl MessageType {
            pub fn kind(self) -> MessageKind {
                match self {
                    $(Self::$req => MessageKind::Request,
                      Self::$rsp => MessageKind::Response,)*
                    $(Self::$ind => MessageKind::Indication,)*
                }
            }

            /// The type that answers this request
            pub fn response_type(self) -> Option<MessageType> {
                match self {
                    $(Self::$req => Some(Self::$rsp),)*
                    _ => None,
                }
            }
        }
    };
}

message_types! {
    requests {
        HelloReq => HelloRsp,
        PingReq => PingRsp,
        CreateAudioEndpointReq => CreateAudioEndpointRsp,
        DeleteAudioEndpointReq => DeleteAudioEndpointRsp,
        GetAudioEndpointsReq => GetAudioEndpointsRsp,
        SetAudioEndpointActiveReq => SetAudioEndpointActiveRsp,
        RenameAudioEndpointReq => RenameAudioEndpointRsp,
        PlayReq => PlayRsp,
        PauseReq => PauseRsp,
        ResumeReq => ResumeRsp,
        NextReq => NextRsp,
        PreviousReq => PreviousRsp,
        SeekReq => SeekRsp,
        SetShuffleReq => SetShuffleRsp,
        SetRepeatReq => SetRepeatRsp,
        SetVolumeReq => SetVolumeRsp,
        GetStatusReq => GetStatusRsp,
        GetPlaylistsReq => GetPlaylistsRsp,
        GetTracksReq => GetTracksRsp,
        GetAlbumReq => GetAlbumRsp,
        GetArtistReq => GetArtistRsp,
        SearchReq => SearchRsp,
        GetImageReq => GetImageRsp,
        SubscribeStatusReq => SubscribeStatusRsp,
    }
    indications {
        StatusInd,
    }
}

impl MessageType {
    pub fn is_request(self) -> bool {
        self.kind() == MessageKind::Request
    }

    pub fn is_response(self) -> bool {
        self.kind() == MessageKind::Response
    }
}

/// Attribute tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Result,
    Version,
    Name,
    Id,
    NewId,
    Port,
    Protocol,
    Active,
    Endpoint,
    State,
    Position,
    Volume,
    Shuffle,
    Repeat,
    Playlist,
    Track,
    Album,
    Artist,
    Uri,
    Title,
    Duration,
    Query,
    Image,
    Event,
}

/// Deepest group nesting accepted when decoding
pub const MAX_TLV_DEPTH: usize = 32;

/// Attribute value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TlvValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Group(Vec<Tlv>),
}

/// One tagged attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tlv {
    pub tag: Tag,
    pub value: TlvValue,
}

impl<'de> Deserialize<'de> for Tlv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        nesting::TlvSeed { depth: 0 }.deserialize(deserializer)
    }
}

impl<'de> Deserialize<'de> for TlvValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        nesting::ValueSeed { depth: 0 }.deserialize(deserializer)
    }
}

/// Deserialisation that counts group depth on the way down, so a hostile
/// frame is rejected before it can exhaust the reader's stack. Accepts the
/// same layout the derived `Serialize` impls produce.
mod nesting {
    use std::fmt;

    use serde::de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, Unexpected, VariantAccess, Visitor};
    use serde::{Deserialize, Deserializer};

    use super::{Tag, Tlv, TlvValue, MAX_TLV_DEPTH};

    const TLV_FIELDS: &[&str] = &["tag", "value"];
    const VALUE_VARIANTS: &[&str] = &["Int", "Bool", "Str", "Bytes", "Group"];

    #[derive(Clone, Copy)]
    pub(super) struct TlvSeed {
        pub depth: usize,
    }

    impl<'de> DeserializeSeed<'de> for TlvSeed {
        type Value = Tlv;

        fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Tlv, D::Error> {
            deserializer.deserialize_struct("Tlv", TLV_FIELDS, self)
        }
    }

    impl<'de> Visitor<'de> for TlvSeed {
        type Value = Tlv;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("struct Tlv")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Tlv, A::Error> {
            let tag = seq
                .next_element::<Tag>()?
                .ok_or_else(|| <A::Error as de::Error>::invalid_length(0, &self))?;
            let value = seq
                .next_element_seed(ValueSeed { depth: self.depth })?
                .ok_or_else(|| <A::Error as de::Error>::invalid_length(1, &self))?;
            Ok(Tlv { tag, value })
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Tlv, A::Error> {
            let mut tag = None;
            let mut value = None;
            while let Some(key) = map.next_key::<String>()? {
                match key.as_str() {
                    "tag" => tag = Some(map.next_value::<Tag>()?),
                    "value" => value = Some(map.next_value_seed(ValueSeed { depth: self.depth })?),
                    other => return Err(de::Error::unknown_field(other, TLV_FIELDS)),
                }
            }
            Ok(Tlv {
                tag: tag.ok_or_else(|| <A::Error as de::Error>::missing_field("tag"))?,
                value: value.ok_or_else(|| <A::Error as de::Error>::missing_field("value"))?,
            })
        }
    }

    #[derive(Clone, Copy)]
    pub(super) struct ValueSeed {
        pub depth: usize,
    }

    impl<'de> DeserializeSeed<'de> for ValueSeed {
        type Value = TlvValue;

        fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<TlvValue, D::Error> {
            deserializer.deserialize_enum("TlvValue", VALUE_VARIANTS, self)
        }
    }

    impl<'de> Visitor<'de> for ValueSeed {
        type Value = TlvValue;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("enum TlvValue")
        }

        fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<TlvValue, A::Error> {
            let (variant, content) = data.variant::<Variant>()?;
            match variant {
                Variant::Int => content.newtype_variant().map(TlvValue::Int),
                Variant::Bool => content.newtype_variant().map(TlvValue::Bool),
                Variant::Str => content.newtype_variant().map(TlvValue::Str),
                Variant::Bytes => content.newtype_variant().map(TlvValue::Bytes),
                Variant::Group => {
                    if self.depth >= MAX_TLV_DEPTH {
                        return Err(de::Error::custom(format_args!(
                            "attribute groups nested deeper than {}",
                            MAX_TLV_DEPTH
                        )));
                    }
                    content
                        .newtype_variant_seed(GroupSeed { depth: self.depth + 1 })
                        .map(TlvValue::Group)
                }
            }
        }
    }

    struct GroupSeed {
        depth: usize,
    }

    impl<'de> DeserializeSeed<'de> for GroupSeed {
        type Value = Vec<Tlv>;

        fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Tlv>, D::Error> {
            deserializer.deserialize_seq(self)
        }
    }

    impl<'de> Visitor<'de> for GroupSeed {
        type Value = Vec<Tlv>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a group of attributes")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<Tlv>, A::Error> {
            // Length hints come off the wire
            let mut children = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(64));
            while let Some(child) = seq.next_element_seed(TlvSeed { depth: self.depth })? {
                children.push(child);
            }
            Ok(children)
        }
    }

    enum Variant {
        Int,
        Bool,
        Str,
        Bytes,
        Group,
    }

    impl<'de> Deserialize<'de> for Variant {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_identifier(VariantVisitor)
        }
    }

    struct VariantVisitor;

    impl<'de> Visitor<'de> for VariantVisitor {
        type Value = Variant;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a TlvValue variant")
        }

        fn visit_u64<E: de::Error>(self, index: u64) -> Result<Variant, E> {
            match index {
                0 => Ok(Variant::Int),
                1 => Ok(Variant::Bool),
                2 => Ok(Variant::Str),
                3 => Ok(Variant::Bytes),
                4 => Ok(Variant::Group),
                _ => Err(E::invalid_value(Unexpected::Unsigned(index), &self)),
            }
        }

        fn visit_str<E: de::Error>(self, name: &str) -> Result<Variant, E> {
            match name {
                "Int" => Ok(Variant::Int),
                "Bool" => Ok(Variant::Bool),
                "Str" => Ok(Variant::Str),
                "Bytes" => Ok(Variant::Bytes),
                "Group" => Ok(Variant::Group),
                _ => Err(E::unknown_variant(name, VALUE_VARIANTS)),
            }
        }
    }
}

impl Tlv {
    pub fn int(tag: Tag, value: i64) -> Self {
        Self { tag, value: TlvValue::Int(value) }
    }

    pub fn bool(tag: Tag, value: bool) -> Self {
        Self { tag, value: TlvValue::Bool(value) }
    }

    pub fn str(tag: Tag, value: impl Into<String>) -> Self {
        Self { tag, value: TlvValue::Str(value.into()) }
    }

    pub fn bytes(tag: Tag, value: Vec<u8>) -> Self {
        Self { tag, value: TlvValue::Bytes(value) }
    }

    pub fn group(tag: Tag, children: Vec<Tlv>) -> Self {
        Self { tag, value: TlvValue::Group(children) }
    }
}

/// Typed lookups over a list of attributes
pub trait TlvAccess {
    fn attributes(&self) -> &[Tlv];

    fn get(&self, tag: Tag) -> Option<&TlvValue> {
        self.attributes().iter().find(|a| a.tag == tag).map(|a| &a.value)
    }

    fn int(&self, tag: Tag) -> Option<i64> {
        match self.get(tag)? {
            TlvValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn bool(&self, tag: Tag) -> Option<bool> {
        match self.get(tag)? {
            TlvValue::Bool(v) => Some(*v),
            TlvValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    fn str(&self, tag: Tag) -> Option<&str> {
        match self.get(tag)? {
            TlvValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    fn bytes(&self, tag: Tag) -> Option<&[u8]> {
        match self.get(tag)? {
            TlvValue::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Every group attribute carrying `tag`, in order
    fn groups(&self, tag: Tag) -> Vec<&[Tlv]> {
        self.attributes()
            .iter()
            .filter(|a| a.tag == tag)
            .filter_map(|a| match &a.value {
                TlvValue::Group(children) => Some(children.as_slice()),
                _ => None,
            })
            .collect()
    }

    fn require_int(&self, tag: Tag) -> Result<i64, ProtocolError> {
        self.int(tag).ok_or(ProtocolError::MissingAttribute(tag))
    }

    fn require_bool(&self, tag: Tag) -> Result<bool, ProtocolError> {
        self.bool(tag).ok_or(ProtocolError::MissingAttribute(tag))
    }

    fn require_str(&self, tag: Tag) -> Result<&str, ProtocolError> {
        self.str(tag).ok_or(ProtocolError::MissingAttribute(tag))
    }
}

impl TlvAccess for [Tlv] {
    fn attributes(&self) -> &[Tlv] {
        self
    }
}

impl TlvAccess for Vec<Tlv> {
    fn attributes(&self) -> &[Tlv] {
        self
    }
}

/// Outcome code carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    VersionMismatch,
    NotFound,
    InvalidRequest,
    Busy,
    Failed,
}

impl ResultCode {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::VersionMismatch => 1,
            Self::NotFound => 2,
            Self::InvalidRequest => 3,
            Self::Busy => 4,
            Self::Failed => 5,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::VersionMismatch,
            2 => Self::NotFound,
            3 => Self::InvalidRequest,
            4 => Self::Busy,
            _ => Self::Failed,
        }
    }
}

/// One control-protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub id: Option<u32>,
    pub attributes: Vec<Tlv>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            id: None,
            attributes: Vec::new(),
        }
    }

    /// Response to `request`, echoing its id, with a result code.
    pub fn response_to(request: &Message, result: ResultCode) -> Self {
        let msg_type = request
            .msg_type
            .response_type()
            .unwrap_or(request.msg_type);
        Self {
            msg_type,
            id: request.id,
            attributes: vec![Tlv::int(Tag::Result, result.as_i64())],
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.msg_type.kind()
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with(mut self, attribute: Tlv) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_int(self, tag: Tag, value: i64) -> Self {
        self.with(Tlv::int(tag, value))
    }

    pub fn with_bool(self, tag: Tag, value: bool) -> Self {
        self.with(Tlv::bool(tag, value))
    }

    pub fn with_str(self, tag: Tag, value: impl Into<String>) -> Self {
        self.with(Tlv::str(tag, value))
    }

    pub fn push(&mut self, attribute: Tlv) {
        self.attributes.push(attribute);
    }

    /// Result code of a response; responses without one count as `Failed`.
    pub fn result(&self) -> ResultCode {
        self.int(Tag::Result)
            .map(ResultCode::from_i64)
            .unwrap_or(ResultCode::Failed)
    }

    pub fn is_ok(&self) -> bool {
        self.result() == ResultCode::Ok
    }
}

impl TlvAccess for Message {
    fn attributes(&self) -> &[Tlv] {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(MessageType::HelloReq.kind(), MessageKind::Request);
        assert_eq!(MessageType::GetImageRsp.kind(), MessageKind::Response);
        assert_eq!(MessageType::StatusInd.kind(), MessageKind::Indication);
        assert_eq!(
            MessageType::CreateAudioEndpointReq.response_type(),
            Some(MessageType::CreateAudioEndpointRsp)
        );
        assert_eq!(MessageType::StatusInd.response_type(), None);
        assert_eq!(MessageType::PingRsp.response_type(), None);
    }

    #[test]
    fn test_response_echoes_id() {
        let request = Message::new(MessageType::SeekReq)
            .with_id(17)
            .with_int(Tag::Position, 5000);
        let response = Message::response_to(&request, ResultCode::NotFound);

        assert_eq!(response.msg_type, MessageType::SeekRsp);
        assert_eq!(response.id, Some(17));
        assert_eq!(response.result(), ResultCode::NotFound);
        assert!(!response.is_ok());
    }

    #[test]
    fn test_accessors() {
        let message = Message::new(MessageType::GetAudioEndpointsRsp)
            .with_int(Tag::Result, 0)
            .with(Tlv::group(
                Tag::Endpoint,
                vec![Tlv::str(Tag::Id, "kitchen"), Tlv::bool(Tag::Active, true)],
            ))
            .with(Tlv::group(
                Tag::Endpoint,
                vec![Tlv::str(Tag::Id, "den"), Tlv::bool(Tag::Active, false)],
            ));

        assert!(message.is_ok());
        let endpoints = message.groups(Tag::Endpoint);
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].str(Tag::Id), Some("kitchen"));
        assert_eq!(endpoints[1].bool(Tag::Active), Some(false));
        assert!(message.str(Tag::Name).is_none());
        assert!(matches!(
            message.require_str(Tag::Name),
            Err(ProtocolError::MissingAttribute(Tag::Name))
        ));
    }

    #[test]
    fn test_nested_groups_through_self_describing_format() {
        let tlv = Tlv::group(
            Tag::Track,
            vec![
                Tlv::str(Tag::Uri, "tone:track:a4"),
                Tlv::group(Tag::Album, vec![Tlv::bytes(Tag::Image, vec![7, 8])]),
            ],
        );
        let json = serde_json::to_string(&tlv).unwrap();
        assert_eq!(serde_json::from_str::<Tlv>(&json).unwrap(), tlv);

        let mut deep = Tlv::bool(Tag::Active, true);
        for _ in 0..=MAX_TLV_DEPTH {
            deep = Tlv::group(Tag::Endpoint, vec![deep]);
        }
        let json = serde_json::to_string(&deep).unwrap();
        assert!(serde_json::from_str::<Tlv>(&json).is_err());
    }

    #[test]
    fn test_result_codes_roundtrip_through_ints() {
        for code in [
            ResultCode::Ok,
            ResultCode::VersionMismatch,
            ResultCode::NotFound,
            ResultCode::InvalidRequest,
            ResultCode::Busy,
            ResultCode::Failed,
        ] {
            assert_eq!(ResultCode::from_i64(code.as_i64()), code);
        }
        assert_eq!(ResultCode::from_i64(99), ResultCode::Failed);
    }
}
