//! Service providers.
//!
//! A provider knows how to get a connected socket for a named device
//! service. `UsbmuxProvider` composes the rest of the stack: fetch the
//! pair record, open lockdown through the muxer, negotiate the session,
//! ask for the service port, and open a fresh muxer stream to it —
//! upgrading to TLS where the device asks for it.

use std::future::Future;
use std::pin::Pin;

use log::debug;

use crate::lockdown::LockdownClient;
use crate::pair_record::PairRecord;
use crate::transport::DEFAULT_TIMEOUT;
use crate::usbmux::{Device, MuxAddr, MuxClient, LOCKDOWN_PORT};
use crate::xpc::RemoteXpcClient;
use crate::{tls, DeviceMuxError, ReadWrite};

/// Service that accepts the HTTP/2 + XPC remote service dispatch
/// carrier.
pub const CORE_DEVICE_PROXY_SERVICE: &str = "com.apple.internal.devicecompute.CoreDeviceProxy";

/// A connected device-service socket.
#[derive(Debug)]
pub struct ServiceConnection {
    pub stream: Box<dyn ReadWrite>,
    pub port: u16,
}

/// Interface for anything that can hand out device-service sockets.
pub trait ServiceProvider: Send + Sync {
    fn label(&self) -> &str;

    /// Establishes a connection to the named service.
    fn start_service<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceConnection, DeviceMuxError>> + Send + 'a>>;
}

/// Provider backed by the host muxer.
#[derive(Debug, Clone)]
pub struct UsbmuxProvider {
    addr: MuxAddr,
    udid: String,
    label: String,
}

impl UsbmuxProvider {
    pub fn new(addr: MuxAddr, udid: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            addr,
            udid: udid.into(),
            label: label.into(),
        }
    }

    /// Fetches the pair record for this provider's device over a
    /// short-lived muxer connection.
    pub async fn pair_record(&self) -> Result<PairRecord, DeviceMuxError> {
        let mut mux = MuxClient::connect_addr(&self.addr, self.label.clone()).await?;
        mux.read_pair_record(&self.udid)
            .await?
            .ok_or(DeviceMuxError::InvalidHostId)
    }

    async fn device(&self) -> Result<Device, DeviceMuxError> {
        let mut mux = MuxClient::connect_addr(&self.addr, self.label.clone()).await?;
        mux.find_device(&self.udid).await
    }

    /// Starts `name` through lockdown and returns the connected service
    /// socket.
    pub async fn open_service(&self, name: &str) -> Result<ServiceConnection, DeviceMuxError> {
        self.open_service_inner(name, false).await
    }

    async fn open_service_inner(
        &self,
        name: &str,
        force_tls: bool,
    ) -> Result<ServiceConnection, DeviceMuxError> {
        let record = self.pair_record().await?;
        let device = self.device().await?;

        let mux = MuxClient::connect_addr(&self.addr, self.label.clone()).await?;
        let stream = mux.connect(device.device_id, LOCKDOWN_PORT).await?;
        let mut lockdown = LockdownClient::new(stream, self.label.clone());

        if !lockdown.try_upgrade_tls(&record).await? && lockdown.session_id().is_none() {
            // Records without a host identity can still open unpaired
            // services through a plain session.
            if let (Some(host_id), Some(system_buid)) = (&record.host_id, &record.system_buid) {
                let host_id = host_id.clone();
                let system_buid = system_buid.clone();
                lockdown
                    .start_session(&host_id, &system_buid, DEFAULT_TIMEOUT)
                    .await?;
            }
        }

        let handle = lockdown.start_service(name, None).await?;
        lockdown.close();
        debug!("lockdown dispatched {name} to port {}", handle.port);

        let mux = MuxClient::connect_addr(&self.addr, self.label.clone()).await?;
        let stream = mux.connect(device.device_id, handle.port).await?;
        let stream = if handle.enable_service_ssl || force_tls {
            let upgrade = record
                .tls_upgrade()
                .ok_or(DeviceMuxError::InvalidState("pair record has no identity"))?;
            tls::connect(stream, &upgrade).await?
        } else {
            stream
        };
        Ok(ServiceConnection {
            stream,
            port: handle.port,
        })
    }

    /// Opens the CoreDeviceProxy carrier and brings the RemoteXPC
    /// channel up on it. The stream is always TLS-upgraded first.
    pub async fn connect_core_device_proxy(&self) -> Result<RemoteXpcClient, DeviceMuxError> {
        let connection = self
            .open_service_inner(CORE_DEVICE_PROXY_SERVICE, true)
            .await?;
        let mut client = RemoteXpcClient::new(connection.stream);
        client.perform_handshake().await?;
        Ok(client)
    }
}

impl ServiceProvider for UsbmuxProvider {
    fn label(&self) -> &str {
        &self.label
    }

    fn start_service<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ServiceConnection, DeviceMuxError>> + Send + 'a>> {
        Box::pin(self.open_service(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const UDID: &str = "PROVIDER-UDID-0001";
    const SERVICE_PORT: u16 = 54_321;

    async fn read_mux_request<S: AsyncRead + Unpin>(
        stream: &mut S,
    ) -> Option<(u32, plist::Dictionary)> {
        let mut header = [0u8; 16];
        stream.read_exact(&mut header).await.ok()?;
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let tag = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut payload = vec![0u8; len - 16];
        stream.read_exact(&mut payload).await.unwrap();
        let value: plist::Value = plist::from_bytes(&payload).unwrap();
        Some((tag, value.into_dictionary().unwrap()))
    }

    async fn write_mux_response<S: AsyncWrite + Unpin>(
        stream: &mut S,
        tag: u32,
        payload: plist::Dictionary,
    ) {
        let mut xml = Vec::new();
        plist::Value::Dictionary(payload)
            .to_writer_xml(&mut xml)
            .unwrap();
        let mut frame = ((xml.len() + 16) as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(&xml);
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_lockdown<S: AsyncRead + Unpin>(stream: &mut S) -> plist::Dictionary {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        plist::from_bytes(&payload).unwrap()
    }

    async fn write_lockdown<S: AsyncWrite + Unpin>(stream: &mut S, dict: plist::Dictionary) {
        let mut xml = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_xml(&mut xml)
            .unwrap();
        stream
            .write_all(&(xml.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&xml).await.unwrap();
    }

    fn pair_record_xml() -> Vec<u8> {
        let mut record = plist::Dictionary::new();
        record.insert("HostID".into(), plist::Value::String("HOST-PROV".into()));
        record.insert("SystemBUID".into(), plist::Value::String("BUID-PROV".into()));
        record.insert(
            "HostCertificate".into(),
            plist::Value::Data(b"unused cert".to_vec()),
        );
        record.insert(
            "HostPrivateKey".into(),
            plist::Value::Data(b"unused key".to_vec()),
        );
        let mut xml = Vec::new();
        plist::Value::Dictionary(record)
            .to_writer_xml(&mut xml)
            .unwrap();
        xml
    }

    fn device_list() -> plist::Dictionary {
        let mut props = plist::Dictionary::new();
        props.insert("SerialNumber".into(), plist::Value::String(UDID.into()));
        props.insert("ConnectionType".into(), plist::Value::String("USB".into()));
        let mut device = plist::Dictionary::new();
        device.insert("DeviceID".into(), plist::Value::Integer(7.into()));
        device.insert("Properties".into(), plist::Value::Dictionary(props));
        let mut reply = plist::Dictionary::new();
        reply.insert(
            "DeviceList".into(),
            plist::Value::Array(vec![plist::Value::Dictionary(device)]),
        );
        reply
    }

    async fn serve_lockdown(stream: &mut TcpStream) {
        loop {
            let request = read_lockdown(stream).await;
            match request.get("Request").and_then(|v| v.as_string()) {
                Some("StartSession") => {
                    let mut reply = plist::Dictionary::new();
                    reply.insert(
                        "Request".into(),
                        plist::Value::String("StartSession".into()),
                    );
                    reply.insert(
                        "SessionID".into(),
                        plist::Value::String("SESSION-PROV".into()),
                    );
                    reply.insert("EnableSessionSSL".into(), plist::Value::Boolean(false));
                    write_lockdown(stream, reply).await;
                }
                Some("StartService") => {
                    let mut reply = plist::Dictionary::new();
                    reply.insert(
                        "Request".into(),
                        plist::Value::String("StartService".into()),
                    );
                    reply.insert(
                        "Port".into(),
                        plist::Value::Integer(i64::from(SERVICE_PORT).into()),
                    );
                    reply.insert("EnableServiceSSL".into(), plist::Value::Boolean(false));
                    write_lockdown(stream, reply).await;
                    return;
                }
                other => panic!("unexpected lockdown request {other:?}"),
            }
        }
    }

    async fn serve_connection(mut stream: TcpStream) {
        loop {
            let Some((tag, request)) = read_mux_request(&mut stream).await else {
                return;
            };
            match request.get("MessageType").and_then(|v| v.as_string()) {
                Some("ReadPairRecord") => {
                    assert_eq!(
                        request.get("PairRecordID").and_then(|v| v.as_string()),
                        Some(UDID)
                    );
                    let mut reply = plist::Dictionary::new();
                    reply.insert(
                        "PairRecordData".into(),
                        plist::Value::Data(pair_record_xml()),
                    );
                    write_mux_response(&mut stream, tag, reply).await;
                }
                Some("ListDevices") => {
                    write_mux_response(&mut stream, tag, device_list()).await;
                }
                Some("Connect") => {
                    let swapped = request
                        .get("PortNumber")
                        .and_then(|v| v.as_signed_integer())
                        .unwrap() as u16;
                    let port = swapped.swap_bytes();
                    let mut reply = plist::Dictionary::new();
                    reply.insert("MessageType".into(), plist::Value::String("Result".into()));
                    reply.insert("Number".into(), plist::Value::Integer(0.into()));
                    write_mux_response(&mut stream, tag, reply).await;

                    match port {
                        LOCKDOWN_PORT => serve_lockdown(&mut stream).await,
                        SERVICE_PORT => {
                            stream.write_all(b"service-hello").await.unwrap();
                            stream.flush().await.unwrap();
                        }
                        other => panic!("unexpected connect port {other}"),
                    }
                    return;
                }
                other => panic!("unexpected mux request {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn provider_walks_the_full_service_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(serve_connection(stream));
            }
        });

        let provider = UsbmuxProvider::new(
            MuxAddr::Tcp("127.0.0.1".into(), port),
            UDID,
            "devicemux-tests",
        );
        let provider: &dyn ServiceProvider = &provider;
        let mut connection = provider
            .start_service("com.apple.crashreportcopymobile")
            .await
            .unwrap();
        assert_eq!(connection.port, SERVICE_PORT);

        let mut hello = [0u8; 13];
        connection.stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello, b"service-hello");
    }
}
