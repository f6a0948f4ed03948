use std::io;

use thiserror::Error;

/// Error type for every failure the stack can surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceMuxError {
    // Transport
    #[error("socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("PEM parse failed")]
    PemParse(#[from] rustls::pki_types::pem::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request deadline elapsed")]
    Timeout,

    // Framing
    #[error("declared frame length {got} exceeds the limit of {max} bytes")]
    FrameTooLarge { got: usize, max: usize },
    #[error("length field yields a negative frame length")]
    NegativeFrameLength,
    #[error("bytes buffered past the last frame at TLS upgrade")]
    UpgradeBufferDirty,

    // Binary plist codec
    #[error("not a binary plist")]
    InvalidMagic,
    #[error("binary plist truncated")]
    Truncated,
    #[error("invalid binary plist trailer")]
    BadTrailer,
    #[error("object reference out of range")]
    BadRef,
    #[error("object records overlap")]
    OverlappingOffsets,
    #[error("reference cycle in object graph")]
    ReferenceCycle,
    #[error("invalid UTF-16 string payload")]
    Utf16Decode,
    #[error("date out of range")]
    DateOutOfRange,
    #[error("unknown object marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("dictionary key is not a string")]
    NonStringKey,
    #[error("value has no XML plist representation")]
    NotXmlRepresentable,

    // XML plist collaborator
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    // Protocol
    #[error("unexpected response from peer")]
    UnexpectedResponse,
    #[error("required field `{0}` missing from response")]
    MissingField(&'static str),
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have a pairing record for this host")]
    InvalidHostId,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
    #[error("operation invalid while {0}")]
    InvalidState(&'static str),

    // Muxer result codes
    #[error("muxer rejected the command")]
    MuxBadCommand,
    #[error("muxer does not know the device")]
    MuxBadDevice,
    #[error("device refused the connection")]
    MuxConnectionRefused,
    #[error("muxer protocol version mismatch")]
    MuxBadVersion,
    #[error("muxer returned result code {0}")]
    Mux(u32),
    #[error("no usbmuxd socket available")]
    SocketUnavailable,
    #[error("device not found")]
    DeviceNotFound,

    // HTTP/2 + XPC
    #[error("unknown http frame type {0}")]
    UnknownFrame(u8),
    #[error("invalid XPC magic")]
    InvalidXpcMagic,
    #[error("unexpected XPC version")]
    UnexpectedXpcVersion,
    #[error("unknown XPC type {0:#x}")]
    UnknownXpcType(u32),
    #[error("malformed XPC message")]
    MalformedXpc,
    #[error("invalid C string in XPC payload")]
    InvalidCString,
}

impl DeviceMuxError {
    /// Maps a device-reported lockdown error string to a typed error.
    pub(crate) fn from_device_error(e: &str) -> Self {
        match e {
            "GetProhibited" => Self::GetProhibited,
            "SessionInactive" => Self::SessionInactive,
            "InvalidHostID" => Self::InvalidHostId,
            other => Self::UnknownErrorType(other.to_string()),
        }
    }
}
