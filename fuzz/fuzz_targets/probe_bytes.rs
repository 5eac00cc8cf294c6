#![no_main]

//! Probing arbitrary bytes must never panic, whatever the hints claim.

use libfuzzer_sys::fuzz_target;
use squeeze_image::engine::{probe, SourceImage};

fuzz_target!(|data: &[u8]| {
    for (name, hint) in [
        ("upload", None),
        ("upload.jpg", Some("image/jpeg")),
        ("upload.tif", Some("image/tiff")),
    ] {
        let source = SourceImage::from_bytes(data.to_vec(), name, hint);
        if let Ok(probed) = probe(&source) {
            assert!(probed.width > 0 && probed.height > 0);
        }
    }
});
