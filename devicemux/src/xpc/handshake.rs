//! RemoteXPC channel client.
//!
//! Drives the strict bring-up sequence over a TLS-upgraded
//! CoreDeviceProxy stream, then multiplexes request/reply traffic over
//! the ROOT and REPLY streams with per-(channel, id) dispatch.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::http2::{
    self, data_frame, headers_frame, settings_ack_frame, settings_frame, window_update_frame,
    FrameHeader, FRAME_HEADER_SIZE, PREFACE, SETTINGS_INITIAL_WINDOW_SIZE,
    SETTINGS_MAX_CONCURRENT_STREAMS,
};
use crate::transport::DEFAULT_TIMEOUT;
use crate::xpc::{XpcDictionary, XpcMessage, XpcObject, FLAG_ALWAYS_SET, FLAG_INIT_HANDSHAKE};
use crate::{DeviceMuxError, ReadWrite};

/// Stream carrying requests.
pub const ROOT_CHANNEL: u32 = 1;
/// Stream carrying replies.
pub const REPLY_CHANNEL: u32 = 3;

/// Flags of the second ROOT-channel bootstrap message.
const CHANNEL_OPEN_FLAGS: u32 = 0x0201;
/// Connection window top-up sent right after SETTINGS.
const WINDOW_INCREMENT: u32 = 983_041;

pub struct RemoteXpcClient {
    stream: Box<dyn ReadWrite>,
    next_message_id: HashMap<u32, u64>,
    parked: HashMap<(u32, u64), XpcMessage>,
}

impl RemoteXpcClient {
    pub fn new(stream: Box<dyn ReadWrite>) -> Self {
        Self {
            stream,
            next_message_id: HashMap::from([(ROOT_CHANNEL, 0), (REPLY_CHANNEL, 0)]),
            parked: HashMap::new(),
        }
    }

    pub fn next_message_id(&self, channel: u32) -> u64 {
        self.next_message_id.get(&channel).copied().unwrap_or(0)
    }

    /// Performs the channel bring-up: preface, connection settings and
    /// window, then the ROOT and REPLY stream bootstrap messages, and
    /// finally the settings acknowledgement. After this returns the
    /// channel is open and `request` may be used.
    pub async fn perform_handshake(&mut self) -> Result<(), DeviceMuxError> {
        self.stream.write_all(PREFACE).await?;
        self.stream
            .write_all(&settings_frame(&[
                (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
                (SETTINGS_INITIAL_WINDOW_SIZE, 1_048_576),
            ]))
            .await?;
        self.stream
            .write_all(&window_update_frame(0, WINDOW_INCREMENT))
            .await?;

        self.stream.write_all(&headers_frame(ROOT_CHANNEL)).await?;
        self.send_message(
            ROOT_CHANNEL,
            &XpcMessage {
                flags: FLAG_ALWAYS_SET,
                message_id: 0,
                body: Some(XpcObject::Dictionary(XpcDictionary::new())),
            },
        )
        .await?;
        self.send_message(
            ROOT_CHANNEL,
            &XpcMessage {
                flags: CHANNEL_OPEN_FLAGS,
                message_id: 0,
                body: None,
            },
        )
        .await?;
        *self.next_message_id.entry(ROOT_CHANNEL).or_insert(0) += 1;

        self.stream.write_all(&headers_frame(REPLY_CHANNEL)).await?;
        self.send_message(
            REPLY_CHANNEL,
            &XpcMessage {
                flags: FLAG_ALWAYS_SET | FLAG_INIT_HANDSHAKE,
                message_id: 0,
                body: None,
            },
        )
        .await?;
        *self.next_message_id.entry(REPLY_CHANNEL).or_insert(0) += 1;

        self.stream.write_all(&settings_ack_frame()).await?;
        self.stream.flush().await?;
        debug!("remote XPC channel open");
        Ok(())
    }

    async fn send_message(
        &mut self,
        channel: u32,
        message: &XpcMessage,
    ) -> Result<(), DeviceMuxError> {
        self.stream
            .write_all(&data_frame(channel, &message.encode()))
            .await?;
        Ok(())
    }

    /// Sends a request body on ROOT and returns its message id.
    pub async fn send_request(&mut self, body: XpcObject) -> Result<u64, DeviceMuxError> {
        let id = self.next_message_id(ROOT_CHANNEL);
        *self.next_message_id.entry(ROOT_CHANNEL).or_insert(0) += 1;
        self.send_message(
            ROOT_CHANNEL,
            &XpcMessage {
                flags: FLAG_ALWAYS_SET,
                message_id: id,
                body: Some(body),
            },
        )
        .await?;
        self.stream.flush().await?;
        Ok(id)
    }

    /// Awaits the REPLY-channel message bearing `id`. Messages for other
    /// (channel, id) pairs are parked for their own callers. A frame
    /// kind outside the DATA/HEADERS contract fails the read.
    pub async fn receive_reply(
        &mut self,
        id: u64,
        timeout: Duration,
    ) -> Result<XpcMessage, DeviceMuxError> {
        if let Some(parked) = self.parked.remove(&(REPLY_CHANNEL, id)) {
            return Ok(parked);
        }
        match tokio::time::timeout(timeout, self.receive_reply_inner(id)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceMuxError::Timeout),
        }
    }

    async fn receive_reply_inner(&mut self, id: u64) -> Result<XpcMessage, DeviceMuxError> {
        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            self.stream.read_exact(&mut header).await?;
            let header = FrameHeader::decode(&header);
            let mut payload = vec![0u8; header.length as usize];
            self.stream.read_exact(&mut payload).await?;

            match header.kind {
                http2::FRAME_DATA => {
                    let message = XpcMessage::decode(&payload)?;
                    if header.stream_id == REPLY_CHANNEL && message.message_id == id {
                        return Ok(message);
                    }
                    trace!(
                        "parking message {} on stream {}",
                        message.message_id,
                        header.stream_id
                    );
                    self.parked
                        .insert((header.stream_id, message.message_id), message);
                }
                http2::FRAME_SETTINGS => {
                    if header.is_settings_ack() {
                        trace!("peer acknowledged settings");
                    }
                }
                // HEADERS and WINDOW_UPDATE carry nothing the XPC
                // dialect needs.
                http2::FRAME_HEADERS | http2::FRAME_WINDOW_UPDATE => {
                    trace!("skipping http2 frame type {:#x}", header.kind);
                }
                other => return Err(DeviceMuxError::UnknownFrame(other)),
            }
        }
    }

    /// One request/reply exchange on the open channel.
    pub async fn request(&mut self, body: XpcObject) -> Result<XpcMessage, DeviceMuxError> {
        let id = self.send_request(body).await?;
        self.receive_reply(id, DEFAULT_TIMEOUT).await
    }

    /// Releases the underlying stream.
    pub fn into_stream(self) -> Box<dyn ReadWrite> {
        self.stream
    }
}
