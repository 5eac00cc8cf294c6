#![no_main]

//! ICC profile extraction from JPEG, PNG and WebP containers.

use libfuzzer_sys::fuzz_target;
use squeeze_image::engine::{extract_icc_profile, FirewallConfig};

fuzz_target!(|data: &[u8]| {
    let _ = extract_icc_profile(data);
    let _ = FirewallConfig::strict().scan_metadata(data);

    // Exercise each container path behind its magic bytes
    let prefixes: [&[u8]; 3] = [
        &[0xFF, 0xD8],
        &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
        &[
            0x52, 0x49, 0x46, 0x46, // RIFF
            0x00, 0x00, 0x00, 0x00, // size placeholder
            0x57, 0x45, 0x42, 0x50, // WEBP
        ],
    ];
    for prefix in prefixes {
        let mut prefixed = prefix.to_vec();
        prefixed.extend_from_slice(data);
        let _ = extract_icc_profile(&prefixed);
    }
});
