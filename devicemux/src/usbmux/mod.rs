//! usbmuxd client.
//!
//! Speaks the muxer dialect: little-endian framing, a 16-byte envelope
//! of `{len, version, type, tag}`, plist payloads, and responses matched
//! to requests by tag. `connect` hands the raw stream to the caller once
//! the muxer confirms the tunnel.

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::TcpStream;

use crate::bplist::{self, Dictionary, Value};
use crate::pair_record::PairRecord;
use crate::transport::{decode_payload, PlistTransport, DEFAULT_TIMEOUT};
use crate::{DeviceMuxError, ReadWrite};

/// TCP port the lockdown daemon listens on, reached through `connect`.
pub const LOCKDOWN_PORT: u16 = 62078;

const USBMUXD_SOCKET_PATH: &str = "/var/run/usbmuxd";
const USBMUXD_TCP_HOST: &str = "127.0.0.1";
const USBMUXD_TCP_PORT: u16 = 27015;

const PLIST_VERSION: u32 = 1;
const MESSAGE_TYPE_PLIST: u32 = 8;
const ENVELOPE_SIZE: usize = 12;

const RESULT_OK: i64 = 0;
const RESULT_BAD_COMMAND: i64 = 1;
const RESULT_BAD_DEVICE: i64 = 2;
const RESULT_CONNECTION_REFUSED: i64 = 3;
const RESULT_BAD_VERSION: i64 = 6;

/// Address of the host muxer socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxAddr {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl MuxAddr {
    /// Resolves the muxer address: `USBMUXD_SOCKET_ADDRESS` first, then
    /// the well-known Unix socket, then the loopback TCP fallback used
    /// where the Unix socket does not exist (Windows, WSL1).
    pub fn discover() -> Self {
        if let Ok(value) = env::var("USBMUXD_SOCKET_ADDRESS") {
            return Self::parse(&value);
        }
        if cfg!(unix) && Path::new(USBMUXD_SOCKET_PATH).exists() {
            return MuxAddr::Unix(USBMUXD_SOCKET_PATH.into());
        }
        MuxAddr::Tcp(USBMUXD_TCP_HOST.into(), USBMUXD_TCP_PORT)
    }

    /// Parses an address override: `unix:PATH`, `HOST:PORT`, or a bare
    /// socket path.
    pub fn parse(value: &str) -> Self {
        if let Some(path) = value.strip_prefix("unix:") {
            return MuxAddr::Unix(path.into());
        }
        if let Some((host, port)) = value.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return MuxAddr::Tcp(host.to_string(), port);
            }
        }
        MuxAddr::Unix(value.into())
    }

    pub async fn connect(&self) -> Result<Box<dyn ReadWrite>, DeviceMuxError> {
        match self {
            #[cfg(unix)]
            MuxAddr::Unix(path) => match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => Ok(Box::new(stream)),
                Err(e) => {
                    warn!("muxer socket {} unavailable: {e}", path.display());
                    Err(DeviceMuxError::SocketUnavailable)
                }
            },
            #[cfg(not(unix))]
            MuxAddr::Unix(_) => Err(DeviceMuxError::SocketUnavailable),
            MuxAddr::Tcp(host, port) => match TcpStream::connect((host.as_str(), *port)).await {
                Ok(stream) => Ok(Box::new(stream)),
                Err(e) => {
                    warn!("muxer address {host}:{port} unavailable: {e}");
                    Err(DeviceMuxError::SocketUnavailable)
                }
            },
        }
    }
}

impl Default for MuxAddr {
    fn default() -> Self {
        Self::discover()
    }
}

/// A device entry from `ListDevices`.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: u32,
    pub properties: DeviceProperties,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceProperties {
    pub serial_number: Option<String>,
    pub connection_type: Option<String>,
    pub product_id: Option<i64>,
    pub location_id: Option<i64>,
    pub usb_serial_number: Option<String>,
    pub connection_speed: Option<i64>,
}

impl Device {
    fn from_value(value: &Value) -> Result<Self, DeviceMuxError> {
        let dict = value
            .as_dictionary()
            .ok_or(DeviceMuxError::UnexpectedResponse)?;
        let device_id = dict
            .get("DeviceID")
            .and_then(Value::as_signed_integer)
            .ok_or(DeviceMuxError::MissingField("DeviceID"))? as u32;

        let mut properties = DeviceProperties::default();
        if let Some(props) = dict.get("Properties").and_then(Value::as_dictionary) {
            let string = |key: &str| {
                props
                    .get(key)
                    .and_then(Value::as_string)
                    .map(str::to_string)
            };
            let integer = |key: &str| props.get(key).and_then(Value::as_signed_integer);
            properties = DeviceProperties {
                serial_number: string("SerialNumber"),
                connection_type: string("ConnectionType"),
                product_id: integer("ProductID"),
                location_id: integer("LocationID"),
                usb_serial_number: string("USBSerialNumber"),
                connection_speed: integer("ConnectionSpeed"),
            };
        }
        Ok(Device {
            device_id,
            properties,
        })
    }

    /// The device identifier user tooling refers to.
    pub fn udid(&self) -> Option<&str> {
        self.properties
            .serial_number
            .as_deref()
            .or(self.properties.usb_serial_number.as_deref())
    }
}

/// Client connection to the host muxer.
pub struct MuxClient {
    transport: PlistTransport,
    label: String,
    next_tag: u32,
    parked: HashMap<u32, Dictionary>,
    abandoned: HashSet<u32>,
}

impl MuxClient {
    pub fn new(stream: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            transport: PlistTransport::muxer(stream),
            label: label.into(),
            next_tag: 0,
            parked: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    /// Dials the muxer at `addr`.
    pub async fn connect_addr(
        addr: &MuxAddr,
        label: impl Into<String>,
    ) -> Result<Self, DeviceMuxError> {
        let stream = addr.connect().await?;
        Ok(Self::new(stream, label))
    }

    /// Sends one request and returns its tag, without waiting for the
    /// response. Pair with [`MuxClient::response`].
    pub async fn request(&mut self, mut payload: Dictionary) -> Result<u32, DeviceMuxError> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        payload.insert("ProgName", self.label.clone());
        payload.insert(
            "ClientVersionString",
            concat!("devicemux-", env!("CARGO_PKG_VERSION")),
        );
        let plist = bplist::encode(&Value::Dictionary(payload))?;

        let mut body = Vec::with_capacity(ENVELOPE_SIZE + plist.len());
        body.extend_from_slice(&PLIST_VERSION.to_le_bytes());
        body.extend_from_slice(&MESSAGE_TYPE_PLIST.to_le_bytes());
        body.extend_from_slice(&tag.to_le_bytes());
        body.extend_from_slice(&plist);
        self.transport.send_frame(&body).await?;
        Ok(tag)
    }

    /// Awaits the response bearing `tag`. Frames for other outstanding
    /// tags are parked and delivered to their own callers; frames for
    /// abandoned (timed-out) tags are dropped.
    pub async fn response(
        &mut self,
        tag: u32,
        timeout: Duration,
    ) -> Result<Dictionary, DeviceMuxError> {
        if let Some(parked) = self.parked.remove(&tag) {
            return Ok(parked);
        }
        let result = tokio::time::timeout(timeout, self.response_inner(tag)).await;
        match result {
            Ok(response) => response,
            Err(_) => {
                self.abandoned.insert(tag);
                Err(DeviceMuxError::Timeout)
            }
        }
    }

    async fn response_inner(&mut self, tag: u32) -> Result<Dictionary, DeviceMuxError> {
        loop {
            // The inner await carries the overall deadline from `response`.
            let frame = self.transport.receive_frame(Duration::MAX).await?;
            if frame.len() < ENVELOPE_SIZE {
                return Err(DeviceMuxError::UnexpectedResponse);
            }
            let version = u32::from_le_bytes(frame[0..4].try_into().unwrap());
            let msg_type = u32::from_le_bytes(frame[4..8].try_into().unwrap());
            let frame_tag = u32::from_le_bytes(frame[8..12].try_into().unwrap());
            if version != PLIST_VERSION || msg_type != MESSAGE_TYPE_PLIST {
                return Err(DeviceMuxError::UnexpectedResponse);
            }

            // An undecodable payload poisons the connection: tag
            // bookkeeping can no longer be trusted.
            let payload = match decode_payload(&frame[ENVELOPE_SIZE..]) {
                Ok(payload) => payload,
                Err(e) => {
                    self.transport.close();
                    return Err(e);
                }
            };
            let payload = payload
                .into_dictionary()
                .ok_or(DeviceMuxError::UnexpectedResponse)?;

            if frame_tag == tag {
                return Ok(payload);
            }
            if self.abandoned.remove(&frame_tag) {
                debug!("dropping response for abandoned tag {frame_tag}");
                continue;
            }
            self.parked.insert(frame_tag, payload);
        }
    }

    async fn round_trip(&mut self, payload: Dictionary) -> Result<Dictionary, DeviceMuxError> {
        let tag = self.request(payload).await?;
        self.response(tag, DEFAULT_TIMEOUT).await
    }

    /// Reads the muxer's Build Unique ID.
    pub async fn read_buid(&mut self) -> Result<String, DeviceMuxError> {
        let mut payload = Dictionary::new();
        payload.insert("MessageType", "ReadBUID");
        let response = self.round_trip(payload).await?;
        response
            .get("BUID")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or(DeviceMuxError::MissingField("BUID"))
    }

    /// Fetches the pair record stored for `udid`, if any.
    pub async fn read_pair_record(
        &mut self,
        udid: &str,
    ) -> Result<Option<PairRecord>, DeviceMuxError> {
        let mut payload = Dictionary::new();
        payload.insert("MessageType", "ReadPairRecord");
        payload.insert("PairRecordID", udid);
        let response = self.round_trip(payload).await?;
        match response.get("PairRecordData") {
            None => Ok(None),
            Some(data) => {
                let data = data.as_data().ok_or(DeviceMuxError::UnexpectedResponse)?;
                Ok(Some(PairRecord::parse(data)?))
            }
        }
    }

    /// Lists the devices currently attached to the muxer.
    pub async fn list_devices(&mut self) -> Result<Vec<Device>, DeviceMuxError> {
        let mut payload = Dictionary::new();
        payload.insert("MessageType", "ListDevices");
        let response = self.round_trip(payload).await?;
        let list = response
            .get("DeviceList")
            .and_then(Value::as_array)
            .ok_or(DeviceMuxError::UnexpectedResponse)?;
        list.iter().map(Device::from_value).collect()
    }

    /// Finds the attached device with the given udid.
    pub async fn find_device(&mut self, udid: &str) -> Result<Device, DeviceMuxError> {
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.udid() == Some(udid))
            .ok_or(DeviceMuxError::DeviceNotFound)
    }

    /// Opens a stream to `port` on the device and hands over the raw
    /// socket. The muxer expects the port byte-swapped: a little-endian
    /// transport field whose payload is a big-endian port number.
    pub async fn connect(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, DeviceMuxError> {
        let mut payload = Dictionary::new();
        payload.insert("MessageType", "Connect");
        payload.insert("DeviceID", device_id);
        payload.insert("PortNumber", port.swap_bytes());
        let response = self.round_trip(payload).await?;

        if response.get("MessageType").and_then(Value::as_string) != Some("Result") {
            return Err(DeviceMuxError::UnexpectedResponse);
        }
        let number = response
            .get("Number")
            .and_then(Value::as_signed_integer)
            .ok_or(DeviceMuxError::MissingField("Number"))?;
        match number {
            RESULT_OK => {
                debug!("muxer tunnel to device {device_id} port {port} open");
                self.transport.into_stream()
            }
            RESULT_BAD_COMMAND => Err(DeviceMuxError::MuxBadCommand),
            RESULT_BAD_DEVICE => Err(DeviceMuxError::MuxBadDevice),
            RESULT_CONNECTION_REFUSED => Err(DeviceMuxError::MuxConnectionRefused),
            RESULT_BAD_VERSION => Err(DeviceMuxError::MuxBadVersion),
            other => Err(DeviceMuxError::Mux(other as u32)),
        }
    }
}
