//! Frame model subsystem.
//!
//! # Data Flow
//! ```text
//! Client bytes
//!     → codec.rs (size-prefixed envelope → RequestFrame)
//!     → dispatch (filter chain)
//!     → codec.rs (RequestFrame → upstream bytes)
//!
//! Upstream bytes
//!     → codec.rs (envelope → RawResponse)
//!     → dispatch (correlate → ResponseFrame → filter chain)
//!     → codec.rs (ResponseFrame → client bytes)
//! ```
//!
//! # Design Decisions
//! - Message bodies stay opaque `Bytes`; typed message codecs live outside the proxy core,
//!   except the broker list of metadata responses (metadata.rs), read for node discovery
//! - Only the envelope (api key, version, correlation id, client id) is decoded
//! - Responses carry no api key on the wire; it is restored from the pending request

pub mod codec;
pub mod metadata;

use bytes::Bytes;
use std::fmt;

/// Protocol API identifiers.
///
/// APIs the built-in filters name get their own variant; every other id is
/// carried as [`ApiKey::Other`] and passes through the proxy untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    OffsetCommit,
    OffsetFetch,
    FindCoordinator,
    JoinGroup,
    Heartbeat,
    LeaveGroup,
    SyncGroup,
    DescribeGroups,
    ListGroups,
    SaslHandshake,
    ApiVersions,
    CreateTopics,
    DeleteTopics,
    InitProducerId,
    DescribeConfigs,
    SaslAuthenticate,
    /// Any API without a named variant, by wire id.
    Other(i16),
}

impl ApiKey {
    /// Wire identifier of this API.
    pub fn id(self) -> i16 {
        match self {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::ListOffsets => 2,
            ApiKey::Metadata => 3,
            ApiKey::OffsetCommit => 8,
            ApiKey::OffsetFetch => 9,
            ApiKey::FindCoordinator => 10,
            ApiKey::JoinGroup => 11,
            ApiKey::Heartbeat => 12,
            ApiKey::LeaveGroup => 13,
            ApiKey::SyncGroup => 14,
            ApiKey::DescribeGroups => 15,
            ApiKey::ListGroups => 16,
            ApiKey::SaslHandshake => 17,
            ApiKey::ApiVersions => 18,
            ApiKey::CreateTopics => 19,
            ApiKey::DeleteTopics => 20,
            ApiKey::InitProducerId => 22,
            ApiKey::DescribeConfigs => 32,
            ApiKey::SaslAuthenticate => 36,
            ApiKey::Other(id) => id,
        }
    }

    /// Stable lower-case name, used as a log and metric label.
    pub fn name(self) -> &'static str {
        match self {
            ApiKey::Produce => "produce",
            ApiKey::Fetch => "fetch",
            ApiKey::ListOffsets => "list_offsets",
            ApiKey::Metadata => "metadata",
            ApiKey::OffsetCommit => "offset_commit",
            ApiKey::OffsetFetch => "offset_fetch",
            ApiKey::FindCoordinator => "find_coordinator",
            ApiKey::JoinGroup => "join_group",
            ApiKey::Heartbeat => "heartbeat",
            ApiKey::LeaveGroup => "leave_group",
            ApiKey::SyncGroup => "sync_group",
            ApiKey::DescribeGroups => "describe_groups",
            ApiKey::ListGroups => "list_groups",
            ApiKey::SaslHandshake => "sasl_handshake",
            ApiKey::ApiVersions => "api_versions",
            ApiKey::CreateTopics => "create_topics",
            ApiKey::DeleteTopics => "delete_topics",
            ApiKey::InitProducerId => "init_producer_id",
            ApiKey::DescribeConfigs => "describe_configs",
            ApiKey::SaslAuthenticate => "sasl_authenticate",
            ApiKey::Other(_) => "other",
        }
    }
}

impl From<i16> for ApiKey {
    fn from(id: i16) -> Self {
        match id {
            0 => ApiKey::Produce,
            1 => ApiKey::Fetch,
            2 => ApiKey::ListOffsets,
            3 => ApiKey::Metadata,
            8 => ApiKey::OffsetCommit,
            9 => ApiKey::OffsetFetch,
            10 => ApiKey::FindCoordinator,
            11 => ApiKey::JoinGroup,
            12 => ApiKey::Heartbeat,
            13 => ApiKey::LeaveGroup,
            14 => ApiKey::SyncGroup,
            15 => ApiKey::DescribeGroups,
            16 => ApiKey::ListGroups,
            17 => ApiKey::SaslHandshake,
            18 => ApiKey::ApiVersions,
            19 => ApiKey::CreateTopics,
            20 => ApiKey::DeleteTopics,
            22 => ApiKey::InitProducerId,
            32 => ApiKey::DescribeConfigs,
            36 => ApiKey::SaslAuthenticate,
            other => ApiKey::Other(other),
        }
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiKey::Other(id) => write!(f, "api_key_{id}"),
            named => f.write_str(named.name()),
        }
    }
}

/// Header of a request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: u32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn new(api_key: ApiKey, api_version: i16, correlation_id: u32) -> Self {
        Self {
            api_key,
            api_version,
            correlation_id,
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Header of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub correlation_id: u32,
}

/// A decoded request travelling from the client towards the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub body: Bytes,
    /// False for requests the upstream never answers (produce with `acks=0`).
    pub has_response: bool,
}

impl RequestFrame {
    pub fn new(header: RequestHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
            has_response: true,
        }
    }

    pub fn correlation_id(&self) -> u32 {
        self.header.correlation_id
    }
}

/// A decoded response travelling from the upstream towards the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub header: ResponseHeader,
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn correlation_id(&self) -> u32 {
        self.header.correlation_id
    }
}

/// A response envelope as read from the upstream, before correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub correlation_id: u32,
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_round_trips_wire_id() {
        for id in [0i16, 3, 17, 18, 36] {
            let key = ApiKey::from(id);
            assert_eq!(key.id(), id);
            assert_ne!(key.name(), "other");
        }
    }

    #[test]
    fn unlisted_api_ids_are_carried_verbatim() {
        for id in [4i16, 23, 24, 26, 28, 60, 1000] {
            let key = ApiKey::from(id);
            assert_eq!(key, ApiKey::Other(id));
            assert_eq!(key.id(), id);
        }
        assert_eq!(ApiKey::from(23).to_string(), "api_key_23");
    }
}
