//! CMS signing with Apple CDHash attributes, and verification of the
//! resulting detached signatures.

use crate::codesign::constants::CS_CDHASH_LEN;
use crate::codesign::DigestType;
use crate::crypto::SigningIdentity;
use crate::{Error, Result};
use bcder::{encode::Values, Captured, Mode, OctetString, Oid};
use cryptographic_message_syntax::{SignedData, SignedDataBuilder, SignerBuilder};
use x509_certificate::{rfc5652::AttributeValue, CapturedX509Certificate};

/// Apple CDHash v1 OID: 1.2.840.113635.100.9.1
/// Contains plist with truncated hashes of every code directory
pub const APPLE_CDHASH_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// Apple CDHash v2 OID: 1.2.840.113635.100.9.2
/// Contains SEQUENCE { OID sha256, OCTET STRING hash }
pub const APPLE_CDHASH_V2_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];

/// SHA-256 OID: 2.16.840.1.101.3.4.2.1
const SHA256_OID: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// A code directory hash paired with the digest that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdHash {
    pub digest: DigestType,
    pub hash: Vec<u8>,
}

/// Summary of a certificate found in a verified CMS signature.
#[derive(Debug, Clone)]
pub struct SignerCertificate {
    pub subject: Option<String>,
    pub not_before: chrono::DateTime<chrono::Utc>,
    pub not_after: chrono::DateTime<chrono::Utc>,
}

/// Generate a detached CMS signature over the primary code directory.
///
/// `cdhashes` lists the full hash of every code directory in slot order; the
/// first entry belongs to `primary_cd`.
pub fn sign_code_directory(
    identity: &SigningIdentity,
    primary_cd: &[u8],
    cdhashes: &[CdHash],
) -> Result<Vec<u8>> {
    let cdhash_plist = build_cdhash_plist(cdhashes)?;

    let cdhash_v1_oid = Oid(bytes::Bytes::copy_from_slice(APPLE_CDHASH_OID));
    let cdhash_v1_attr_value = AttributeValue::new(Captured::from_values(
        Mode::Der,
        OctetString::encode_slice(&cdhash_plist),
    ));

    let mut signer = SignerBuilder::new(identity.key(), identity.certificate().clone())
        .signed_attribute(cdhash_v1_oid, vec![cdhash_v1_attr_value]);

    let v2_values = cdhashes
        .iter()
        .filter(|cdhash| cdhash.digest == DigestType::Sha256)
        .map(|cdhash| {
            let value = build_cdhash_v2_attribute(&cdhash.hash);
            AttributeValue::new(Captured::from_values(Mode::Der, RawEncoder(&value)))
        })
        .collect::<Vec<_>>();
    if !v2_values.is_empty() {
        let cdhash_v2_oid = Oid(bytes::Bytes::copy_from_slice(APPLE_CDHASH_V2_OID));
        signer = signer.signed_attribute(cdhash_v2_oid, v2_values);
    }

    let mut builder = SignedDataBuilder::default()
        .content_external(primary_cd.to_vec())
        .signer(signer);

    for cert in identity.chain() {
        builder = builder.certificate(cert.clone());
    }

    builder
        .build_der()
        .map_err(|e| Error::Signing(format!("failed to build CMS signature: {}", e)))
}

/// Verify a detached CMS signature against `content`.
///
/// Every signer's signature and message digest must verify. Returns the
/// certificates carried in the signature.
pub fn verify_detached(cms_der: &[u8], content: &[u8]) -> Result<Vec<SignerCertificate>> {
    let signed_data = SignedData::parse_ber(cms_der)
        .map_err(|e| Error::SignatureMismatch(format!("malformed CMS signature: {}", e)))?;

    let mut signers = 0usize;
    for signer in signed_data.signers() {
        signer
            .verify_signature_with_signed_data(&signed_data)
            .map_err(|e| Error::SignatureMismatch(format!("CMS signature does not verify: {}", e)))?;
        signer
            .verify_message_digest_with_content(content)
            .map_err(|e| Error::SignatureMismatch(format!("CMS digest does not match code directory: {}", e)))?;
        signers += 1;
    }
    if signers == 0 {
        return Err(Error::SignatureMismatch("CMS signature has no signers".into()));
    }

    Ok(signed_data.certificates().map(summarize).collect())
}

fn summarize(cert: &CapturedX509Certificate) -> SignerCertificate {
    SignerCertificate {
        subject: cert.subject_common_name(),
        not_before: cert.validity_not_before(),
        not_after: cert.validity_not_after(),
    }
}

/// Build CDHash plist for Apple attribute
///
/// Creates an XML plist with a "cdhashes" array. Every hash is truncated to
/// 20 bytes.
pub fn build_cdhash_plist(cdhashes: &[CdHash]) -> Result<Vec<u8>> {
    use plist::{Dictionary, Value};

    let hashes = cdhashes
        .iter()
        .map(|cdhash| {
            let len = cdhash.hash.len().min(CS_CDHASH_LEN);
            Value::Data(cdhash.hash[..len].to_vec())
        })
        .collect();

    let mut dict = Dictionary::new();
    dict.insert("cdhashes".to_string(), Value::Array(hashes));

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}

/// DER for SEQUENCE { OBJECT sha256, OCTET STRING hash }.
fn build_cdhash_v2_attribute(cdhash_sha256: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + SHA256_OID.len() + cdhash_sha256.len());
    inner.push(0x06);
    inner.push(SHA256_OID.len() as u8);
    inner.extend_from_slice(SHA256_OID);
    inner.push(0x04);
    inner.push(cdhash_sha256.len() as u8);
    inner.extend_from_slice(cdhash_sha256);

    let mut result = Vec::with_capacity(2 + inner.len());
    result.push(0x30);
    result.push(inner.len() as u8);
    result.extend_from_slice(&inner);
    result
}

/// Pre-encoded DER passed through as-is.
struct RawEncoder<'a>(&'a [u8]);

impl<'a> Values for RawEncoder<'a> {
    fn encoded_len(&self, _mode: Mode) -> usize {
        self.0.len()
    }

    fn write_encoded<W: std::io::Write>(
        &self,
        _mode: Mode,
        target: &mut W,
    ) -> std::result::Result<(), std::io::Error> {
        target.write_all(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1: [u8; 20] = [
        0x2f, 0xd4, 0xe1, 0xc6, 0x7a, 0x2d, 0x28, 0xfc, 0xed, 0x84, 0x9e, 0xe1, 0xbb, 0x76, 0xe7,
        0x39, 0x1b, 0x93, 0xeb, 0x12,
    ];
    const SHA256: [u8; 32] = [
        0xd7, 0xa8, 0xfb, 0xb3, 0x07, 0xd7, 0x80, 0x94, 0x69, 0xca, 0x9a, 0xbc, 0xb0, 0x08, 0x2e,
        0x4f, 0x8d, 0x56, 0x51, 0xe4, 0x6d, 0x3c, 0xdb, 0x76, 0x2d, 0x02, 0xd0, 0xbf, 0x37, 0xc9,
        0xe5, 0x92,
    ];

    fn cdhashes() -> Vec<CdHash> {
        vec![
            CdHash {
                digest: DigestType::Sha1,
                hash: SHA1.to_vec(),
            },
            CdHash {
                digest: DigestType::Sha256,
                hash: SHA256.to_vec(),
            },
        ]
    }

    #[test]
    fn test_build_cdhash_plist_truncates() {
        let plist = build_cdhash_plist(&cdhashes()).unwrap();

        let parsed: plist::Value = plist::from_bytes(&plist).unwrap();
        let dict = parsed.as_dictionary().unwrap();
        let hashes = dict.get("cdhashes").unwrap().as_array().unwrap();

        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].as_data().unwrap(), SHA1);
        assert_eq!(hashes[1].as_data().unwrap(), &SHA256[..20]);
    }

    #[test]
    fn test_build_cdhash_plist_single() {
        let plist = build_cdhash_plist(&cdhashes()[1..]).unwrap();
        let text = String::from_utf8(plist).unwrap();
        assert!(text.contains("<key>cdhashes</key>"));
        assert_eq!(text.matches("<data>").count(), 1);
    }

    #[test]
    fn test_build_cdhash_v2_attribute() {
        let attr = build_cdhash_v2_attribute(&SHA256);

        assert_eq!(attr[0], 0x30);
        assert_eq!(attr[1] as usize, attr.len() - 2);
        assert_eq!(&attr[2..4], &[0x06, SHA256_OID.len() as u8]);
        assert!(attr.windows(SHA256_OID.len()).any(|w| w == SHA256_OID));
        assert!(attr.ends_with(&SHA256));
    }

    #[test]
    fn test_verify_detached_rejects_garbage() {
        let result = verify_detached(b"\x30\x03\x02\x01\x00", b"content");
        assert!(matches!(result, Err(Error::SignatureMismatch(_))));
    }

    #[test]
    fn test_apple_oids() {
        assert_eq!(APPLE_CDHASH_OID.len(), 9);
        assert_eq!(APPLE_CDHASH_OID[8], 0x01);
        assert_eq!(APPLE_CDHASH_V2_OID[8], 0x02);
    }
}
