#![allow(dead_code)]

#[path = "../../src/test_fixtures.rs"]
mod fixtures;

pub use fixtures::*;

use std::path::{Path, PathBuf};

/// Write `bytes` to `name` under `dir` and return the path.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, bytes).unwrap();
    path
}

pub const ENTITLEMENTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>application-identifier</key><string>ABCDE12345.com.example.app</string>
    <key>get-task-allow</key><true/>
</dict>
</plist>"#;
