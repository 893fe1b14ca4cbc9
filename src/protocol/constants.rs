//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// Plaintext RTMP version byte; encrypted variants (6, 8) are refused
pub const RTMP_VERSION: u8 = 3;

pub const RTMP_PORT: u16 = 1935;

/// Size of C1/C2/S1/S2
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size every connection starts with, in both directions
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Smallest chunk size a peer may negotiate
pub const MIN_CHUNK_SIZE: u32 = 128;

/// Largest chunk size a peer may negotiate
pub const MAX_CHUNK_SIZE: u32 = 65535;

/// Outbound chunk size announced after connect unless the vhost overrides it
pub const RECOMMENDED_CHUNK_SIZE: u32 = 60000;

/// Timestamps at or above this value use the 4-byte extended field
pub const EXTENDED_TIMESTAMP: u32 = 0xFFFFFF;

/// Timestamps are 31-bit on the wire in practice
pub const TIMESTAMP_MASK: u32 = 0x7FFF_FFFF;

/// Largest chunk stream id expressible in a 3-byte basic header
pub const MAX_CSID: u32 = 65599;

/// Chunk stream ids below this are kept in a flat array
pub const CHUNK_STREAM_CACHE: usize = 16;

/// Largest basic header (3) + message header (11) + extended timestamp (4)
pub const MAX_CHUNK_HEADER_SIZE: usize = 18;

// Chunk stream ids used for outbound messages

pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_OVER_CONNECTION: u32 = 3;
pub const CSID_OVER_CONNECTION2: u32 = 4;
pub const CSID_OVER_STREAM: u32 = 5;
pub const CSID_VIDEO: u32 = 6;
pub const CSID_AUDIO: u32 = 7;

// Chunk header formats

pub const CHUNK_FMT_0: u8 = 0;
pub const CHUNK_FMT_1: u8 = 1;
pub const CHUNK_FMT_2: u8 = 2;
pub const CHUNK_FMT_3: u8 = 3;

// Message type ids

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_SHARED_OBJECT_AMF3: u8 = 16;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_SHARED_OBJECT_AMF0: u8 = 19;
pub const MSG_COMMAND_AMF0: u8 = 20;
pub const MSG_AGGREGATE: u8 = 22;

// User control event types

pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_STREAM_DRY: u16 = 2;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_STREAM_IS_RECORDED: u16 = 4;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

// Peer bandwidth limit types

pub const BANDWIDTH_LIMIT_HARD: u8 = 0;
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// Command names

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_ON_FC_PUBLISH: &str = "onFCPublish";
pub const CMD_ON_FC_UNPUBLISH: &str = "onFCUnpublish";
pub const CMD_ON_BW_DONE: &str = "onBWDone";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";
pub const CMD_SAMPLE_ACCESS: &str = "|RtmpSampleAccess";

// Status object fields

pub const STATUS_LEVEL: &str = "level";
pub const STATUS_CODE: &str = "code";
pub const STATUS_DESCRIPTION: &str = "description";

pub const STATUS_LEVEL_STATUS: &str = "status";
pub const STATUS_LEVEL_ERROR: &str = "error";

// NetConnection status codes

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";

// NetStream status codes

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
pub const NS_UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PAUSE_NOTIFY: &str = "NetStream.Pause.Notify";
pub const NS_UNPAUSE_NOTIFY: &str = "NetStream.Unpause.Notify";
pub const NS_DATA_START: &str = "NetStream.Data.Start";

// connect _result properties

pub const FMS_VERSION: &str = "FMS/3,5,3,888";
pub const FMS_CAPABILITIES: f64 = 127.0;
pub const FMS_MODE: f64 = 1.0;
pub const SERVER_NAME: &str = "rtmp-hub";

// Default server settings

pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

/// Stream id handed out by createStream; one logical stream per connection
pub const DEFAULT_STREAM_ID: u32 = 1;

/// Clients that chain createStream calls before publish/play are cut off here
pub const MAX_CREATE_STREAM_DEPTH: u32 = 3;
