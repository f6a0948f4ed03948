//! Client-side protocol stack for talking to Apple iOS devices through a
//! host usbmuxd daemon: binary property lists, length-prefixed plist
//! framing, the usbmuxd dialect, lockdown sessions with mid-stream TLS
//! upgrade, and the HTTP/2-framed RemoteXPC channel used by
//! CoreDeviceProxy.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod bplist;
pub mod error;
pub mod http2;
pub mod lockdown;
pub mod pair_record;
pub mod provider;
pub mod splitter;
mod tls;
pub mod transport;
pub mod usbmux;
pub mod xpc;

pub use bplist::{Dictionary, Value};
pub use error::DeviceMuxError;
pub use lockdown::LockdownClient;
pub use pair_record::PairRecord;
pub use provider::{ServiceConnection, ServiceProvider, UsbmuxProvider};
pub use tls::{TlsIdentity, TlsUpgrade};
pub use transport::{PlistTransport, DEFAULT_TIMEOUT};
pub use usbmux::{Device, MuxAddr, MuxClient};
pub use xpc::RemoteXpcClient;

/// A trait combining the characteristics required of a device
/// communication socket.
///
/// Tokio's `TcpStream` and `UnixStream` implement this trait, as does the
/// TLS stream a connection is swapped onto mid-session.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}
