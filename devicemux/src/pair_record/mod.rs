//! Pair record parsing.
//!
//! The muxer hands records back as `PairRecordData` whose embedded plist
//! may be either dialect depending on which tool wrote it, so parsing
//! probes for the `bplist` magic and falls through to XML.

use crate::bplist::{self, Dictionary, Value};
use crate::tls::TlsUpgrade;
use crate::DeviceMuxError;

/// Persistent credential pairing this host with a device.
#[derive(Debug, Clone, Default)]
pub struct PairRecord {
    pub host_id: Option<String>,
    pub system_buid: Option<String>,
    pub host_certificate: Option<Vec<u8>>,
    pub host_private_key: Option<Vec<u8>>,
    pub device_certificate: Option<Vec<u8>>,
    pub root_certificate: Option<Vec<u8>>,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
}

impl PairRecord {
    /// Parses a record from raw plist bytes of either dialect.
    pub fn parse(data: &[u8]) -> Result<Self, DeviceMuxError> {
        let value = if bplist::is_bplist(data) {
            bplist::decode(data)?
        } else {
            Value::try_from(plist::from_bytes::<plist::Value>(data)?)?
        };
        let dict = value
            .into_dictionary()
            .ok_or(DeviceMuxError::UnexpectedResponse)?;
        Ok(Self::from_dictionary(&dict))
    }

    pub fn from_dictionary(dict: &Dictionary) -> Self {
        let string = |key: &str| {
            dict.get(key)
                .and_then(Value::as_string)
                .map(str::to_string)
        };
        let data = |key: &str| dict.get(key).and_then(Value::as_data).map(<[u8]>::to_vec);
        Self {
            host_id: string("HostID"),
            system_buid: string("SystemBUID"),
            host_certificate: data("HostCertificate"),
            host_private_key: data("HostPrivateKey"),
            device_certificate: data("DeviceCertificate"),
            root_certificate: data("RootCertificate"),
            escrow_bag: data("EscrowBag"),
            wifi_mac_address: string("WiFiMACAddress"),
        }
    }

    /// True when the record carries everything a lockdown TLS upgrade
    /// needs: host identity strings plus certificate and key.
    pub fn has_host_identity(&self) -> bool {
        self.host_id.is_some()
            && self.system_buid.is_some()
            && self.host_certificate.is_some()
            && self.host_private_key.is_some()
    }

    /// Host certificate and private key, when both are present.
    pub fn tls_identity(&self) -> Option<(&[u8], &[u8])> {
        match (&self.host_certificate, &self.host_private_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    pub(crate) fn tls_upgrade(&self) -> Option<TlsUpgrade> {
        self.tls_identity()
            .map(|(cert, key)| TlsUpgrade::with_identity(cert, key))
    }

    /// Serializes the record back to an XML plist for persistence.
    pub fn to_xml(&self) -> Result<Vec<u8>, DeviceMuxError> {
        let mut dict = plist::Dictionary::new();
        let mut put_string = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                dict.insert(key.into(), plist::Value::String(v.clone()));
            }
        };
        put_string("HostID", &self.host_id);
        put_string("SystemBUID", &self.system_buid);
        put_string("WiFiMACAddress", &self.wifi_mac_address);
        let mut put_data = |key: &str, value: &Option<Vec<u8>>| {
            if let Some(v) = value {
                dict.insert(key.into(), plist::Value::Data(v.clone()));
            }
        };
        put_data("HostCertificate", &self.host_certificate);
        put_data("HostPrivateKey", &self.host_private_key);
        put_data("DeviceCertificate", &self.device_certificate);
        put_data("RootCertificate", &self.root_certificate);
        put_data("EscrowBag", &self.escrow_bag);

        let mut out = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_plist() -> plist::Value {
        let mut dict = plist::Dictionary::new();
        dict.insert("HostID".into(), plist::Value::String("HOST-1234".into()));
        dict.insert("SystemBUID".into(), plist::Value::String("BUID-9".into()));
        dict.insert(
            "HostCertificate".into(),
            plist::Value::Data(b"host cert pem".to_vec()),
        );
        dict.insert(
            "HostPrivateKey".into(),
            plist::Value::Data(b"host key pem".to_vec()),
        );
        dict.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(b"device cert".to_vec()),
        );
        plist::Value::Dictionary(dict)
    }

    #[test]
    fn parses_xml_records() {
        let mut xml = Vec::new();
        record_plist().to_writer_xml(&mut xml).unwrap();

        let record = PairRecord::parse(&xml).unwrap();
        assert_eq!(record.host_id.as_deref(), Some("HOST-1234"));
        assert_eq!(record.system_buid.as_deref(), Some("BUID-9"));
        assert!(record.has_host_identity());
        let (cert, key) = record.tls_identity().unwrap();
        assert_eq!(cert, b"host cert pem");
        assert_eq!(key, b"host key pem");
    }

    #[test]
    fn parses_binary_records() {
        let mut bin = Vec::new();
        record_plist().to_writer_binary(&mut bin).unwrap();
        assert!(bplist::is_bplist(&bin));

        let record = PairRecord::parse(&bin).unwrap();
        assert_eq!(record.host_id.as_deref(), Some("HOST-1234"));
        assert!(record.has_host_identity());
    }

    #[test]
    fn missing_identity_fields() {
        let mut dict = Dictionary::new();
        dict.insert("HostID", "HOST-1234");
        let record = PairRecord::from_dictionary(&dict);
        assert!(!record.has_host_identity());
        assert!(record.tls_identity().is_none());
    }

    #[test]
    fn xml_round_trip() {
        let mut xml = Vec::new();
        record_plist().to_writer_xml(&mut xml).unwrap();
        let record = PairRecord::parse(&xml).unwrap();

        let rewritten = record.to_xml().unwrap();
        let reparsed = PairRecord::parse(&rewritten).unwrap();
        assert_eq!(reparsed.host_id, record.host_id);
        assert_eq!(reparsed.host_certificate, record.host_certificate);
        assert_eq!(reparsed.device_certificate, record.device_certificate);
    }
}
