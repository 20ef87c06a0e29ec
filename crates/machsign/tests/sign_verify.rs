//! Ad-hoc signing and verification through the public API.

mod common;

use common::{minimal_image, write_file, ImageSpec, ENTITLEMENTS};
use machsign::codesign::{hash_pages, DigestType};
use machsign::macho::read_entitlements;
use machsign::{
    sign_image, verify_image, ArchFilter, Engine, EngineConfig, Error, Image, PatchPlan, SignRequest, SigningMode,
    SigningSettings,
};
use std::sync::Arc;

fn signed_image(settings: &SigningSettings) -> Image {
    let mut image = Image::parse(minimal_image(&ImageSpec::default())).unwrap();
    sign_image(&mut image, settings, SigningMode::AdHoc).unwrap();
    Image::parse(image.into_data()).unwrap()
}

#[test]
fn test_sign_file_on_disk_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "tool", &minimal_image(&ImageSpec::default()));
    let engine = Engine::new(Arc::new(EngineConfig::default())).unwrap();

    let settings = engine.config().signing_settings("com.example.tool");
    let outcome = engine.sign_file(&path, settings, PatchPlan::new(), None);
    assert!(outcome.is_success(), "{:?}", outcome.error());

    let images = Image::open(&path, ArchFilter::All).unwrap();
    assert_eq!(images.len(), 1);
    let report = verify_image(&images[0]).unwrap();
    assert!(report.ad_hoc);
    assert_eq!(report.identifier(), Some("com.example.tool"));
}

#[test]
fn test_page_hashes_cover_signed_bytes() {
    let image = signed_image(&SigningSettings::new("com.example.app"));
    let report = verify_image(&image).unwrap();

    for cd in &report.code_directories {
        let limit = cd.code_limit as usize;
        let page = cd.page_size();
        assert_eq!(cd.code_hashes.len(), (limit + page - 1) / page);
        for (k, hash) in cd.code_hashes.iter().enumerate() {
            let end = ((k + 1) * page).min(limit);
            assert_eq!(hash, &cd.digest.digest(&image.data()[k * page..end]), "page {}", k);
        }
    }
}

#[test]
fn test_64k_of_code_is_16_pages() {
    let code = vec![0xAB; 65536];
    let hashes = hash_pages(&code, 12, DigestType::Sha256, None).unwrap();
    assert_eq!(hashes.len(), 16);
    let expected = DigestType::Sha256.digest(&code[..4096]);
    assert!(hashes.iter().all(|h| *h == expected));
}

#[test]
fn test_last_page_may_be_short() {
    let code = vec![0x11; 4096 + 10];
    let hashes = hash_pages(&code, 12, DigestType::Sha1, None).unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes[1], DigestType::Sha1.digest(&code[4096..]));
}

#[test]
fn test_flipped_bytes_anywhere_in_signed_range() {
    let image = signed_image(&SigningSettings::new("com.example.app"));
    let code_limit = verify_image(&image).unwrap().code_directories[0].code_limit as usize;

    for offset in [0x1000, 0x2345, code_limit - 1] {
        let mut data = image.data().to_vec();
        data[offset] ^= 0x5a;
        let tampered = Image::parse(data).unwrap();
        assert!(
            matches!(verify_image(&tampered), Err(Error::SignatureMismatch(_))),
            "offset {:#x}",
            offset
        );
    }
}

#[test]
fn test_bundle_entitlements_reach_main_executable() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "Info.plist",
        br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>CFBundleExecutable</key><string>App</string></dict></plist>"#,
    );
    let app = write_file(dir.path(), "App", &minimal_image(&ImageSpec::default()));
    let engine = Engine::new(Arc::new(EngineConfig::default())).unwrap();

    let request = SignRequest::new(dir.path())
        .identifier("com.example.app")
        .entitlements(ENTITLEMENTS.as_bytes().to_vec());
    let outcomes = engine.sign_bundle(&request).unwrap();
    assert!(outcomes.iter().all(|o| o.is_success()));

    let images = Image::open(&app, ArchFilter::All).unwrap();
    let report = verify_image(&images[0]).unwrap();
    assert!(report.has_entitlements);
    assert_eq!(report.identifier(), Some("com.example.app"));
    assert_eq!(read_entitlements(&images[0]).unwrap().unwrap(), ENTITLEMENTS.as_bytes());
}

#[test]
fn test_sha256_only_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "tool", &minimal_image(&ImageSpec::default()));
    let config = EngineConfig::default().with_digests(vec![DigestType::Sha256]);
    let engine = Engine::new(Arc::new(config)).unwrap();

    let outcomes = engine.sign_bundle(&SignRequest::new(&path)).unwrap();
    assert!(outcomes[0].is_success());

    let images = Image::open(&path, ArchFilter::All).unwrap();
    let report = verify_image(&images[0]).unwrap();
    assert_eq!(report.code_directories.len(), 1);
    assert_eq!(report.code_directories[0].digest, DigestType::Sha256);
}
