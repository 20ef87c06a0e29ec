//! Provisioning profiles (`.mobileprovision`).
//!
//! A profile is a CMS SignedData whose encapsulated content is an XML plist.
//! The engine only reads it: the bytes are copied into the bundle as
//! `embedded.mobileprovision`, and its `Entitlements` dictionary becomes the
//! main executable's entitlements when the request supplies none.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cryptographic_message_syntax::SignedData;
use plist::{Dictionary, Value};

/// File name of the profile inside a signed bundle.
pub const EMBEDDED_PROFILE_NAME: &str = "embedded.mobileprovision";

/// A parsed provisioning profile.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    raw: Vec<u8>,
    plist: Dictionary,
}

impl ProvisioningProfile {
    /// Parse a profile from its file bytes.
    ///
    /// The plist is taken from the CMS content. Profiles whose envelope does
    /// not decode are searched for an inline `<?xml ... </plist>` document.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let plist = match SignedData::parse_ber(&raw) {
            Ok(signed) => match signed.signed_content() {
                Some(content) => plist::from_bytes(content)?,
                None => return Err(Error::Config("provisioning profile carries no content".into())),
            },
            Err(_) => {
                let document = inline_plist(&raw)
                    .ok_or_else(|| Error::Config("provisioning profile holds no plist".into()))?;
                plist::from_bytes(document)?
            }
        };
        Ok(Self { raw, plist })
    }

    /// Read and parse the profile at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| Error::from(e).with_path(path))?;
        Self::parse(raw).map_err(|e| e.with_path(path))
    }

    /// The profile file exactly as given.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn name(&self) -> Option<&str> {
        self.plist.get("Name").and_then(Value::as_string)
    }

    /// First entry of `TeamIdentifier`.
    pub fn team_id(&self) -> Option<&str> {
        self.plist
            .get("TeamIdentifier")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_string)
    }

    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        let date = self.plist.get("ExpirationDate").and_then(Value::as_date)?;
        Some(std::time::SystemTime::from(date).into())
    }

    /// The `Entitlements` dictionary as an XML plist, if present.
    pub fn entitlements(&self) -> Result<Option<Vec<u8>>> {
        let Some(entitlements) = self.plist.get("Entitlements") else {
            return Ok(None);
        };
        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, entitlements)?;
        Ok(Some(xml))
    }
}

fn inline_plist(raw: &[u8]) -> Option<&[u8]> {
    const START: &[u8] = b"<?xml";
    const END: &[u8] = b"</plist>";
    let start = raw.windows(START.len()).position(|w| w == START)?;
    let end = raw.windows(END.len()).rposition(|w| w == END)? + END.len();
    (start < end).then(|| &raw[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>Name</key><string>Example Development</string>
    <key>TeamIdentifier</key><array><string>ABCDE12345</string></array>
    <key>ExpirationDate</key><date>2030-01-01T00:00:00Z</date>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key><string>ABCDE12345.com.example.app</string>
        <key>get-task-allow</key><true/>
    </dict>
</dict>
</plist>"#;

    fn wrapped(plist: &str) -> Vec<u8> {
        let mut raw = vec![0x30, 0x80, 0x06, 0x09];
        raw.extend_from_slice(plist.as_bytes());
        raw.extend_from_slice(&[0xa0, 0x82, 0x00, 0x00]);
        raw
    }

    #[test]
    fn test_parse_inline_plist() {
        let profile = ProvisioningProfile::parse(wrapped(PROFILE_PLIST)).unwrap();
        assert_eq!(profile.name(), Some("Example Development"));
        assert_eq!(profile.team_id(), Some("ABCDE12345"));
        assert_eq!(profile.expiration_date().unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
        assert_eq!(profile.as_bytes(), wrapped(PROFILE_PLIST).as_slice());
    }

    #[test]
    fn test_entitlements_are_xml() {
        let profile = ProvisioningProfile::parse(wrapped(PROFILE_PLIST)).unwrap();
        let xml = profile.entitlements().unwrap().unwrap();

        let dict: Dictionary = plist::from_bytes(&xml).unwrap();
        assert_eq!(
            dict.get("application-identifier").and_then(Value::as_string),
            Some("ABCDE12345.com.example.app")
        );
        assert_eq!(dict.get("get-task-allow").and_then(Value::as_boolean), Some(true));
    }

    #[test]
    fn test_profile_without_entitlements() {
        let plist = r#"<?xml version="1.0"?><plist version="1.0"><dict><key>Name</key><string>x</string></dict></plist>"#;
        let profile = ProvisioningProfile::parse(plist.as_bytes().to_vec()).unwrap();
        assert!(profile.entitlements().unwrap().is_none());
        assert!(profile.team_id().is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            ProvisioningProfile::parse(b"not a profile".to_vec()),
            Err(Error::Config(_))
        ));
        assert!(ProvisioningProfile::parse(b"<?xml </plist>".to_vec()).is_err());
    }
}
