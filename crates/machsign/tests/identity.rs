//! PKCS#12 credential handling and batch-level identity failures.

mod common;

use common::{minimal_image, write_file, ImageSpec};
use machsign::crypto::team_id_from_p12;
use machsign::{Engine, EngineConfig, Error, IdentityConfig, SignRequest, SigningIdentity};
use std::sync::Arc;

fn container(password: &str) -> Vec<u8> {
    p12::PFX::new(b"not a certificate", b"not a key", None, password, "developer")
        .unwrap()
        .to_der()
}

#[test]
fn test_wrong_password_yields_no_identity() {
    let result = SigningIdentity::from_p12(&container("hunter2"), "hunter3");
    assert!(matches!(result, Err(Error::BadPassword)));
    assert!(matches!(team_id_from_p12(&container("hunter2"), ""), Err(Error::BadPassword)));
}

#[test]
fn test_not_pkcs12() {
    assert!(matches!(
        SigningIdentity::from_p12(b"-----BEGIN CERTIFICATE-----", ""),
        Err(Error::BadCertificateFormat(_))
    ));
}

#[test]
fn test_bad_identity_aborts_batch_before_any_file() {
    let dir = tempfile::tempdir().unwrap();
    let original = minimal_image(&ImageSpec::default());
    let binary = write_file(dir.path(), "App", &original);
    let p12 = write_file(dir.path(), "developer.p12", &container("right"));

    let config = EngineConfig::default().with_identity(IdentityConfig::new(&p12, "wrong"));
    let engine = Engine::new(Arc::new(config)).unwrap();

    let err = engine.sign_bundle(&SignRequest::new(dir.path())).unwrap_err();
    assert!(matches!(err.root(), Error::BadPassword));
    assert_eq!(std::fs::read(&binary).unwrap(), original);
}

#[test]
fn test_missing_p12_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = IdentityConfig::new(dir.path().join("missing.p12"), "");
    let err = config.load().unwrap_err();
    assert!(matches!(err, Error::File { .. }));
    assert!(matches!(err.root(), Error::Io(_)));
}
