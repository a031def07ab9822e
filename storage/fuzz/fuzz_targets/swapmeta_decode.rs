#![no_main]

use libfuzzer_sys::fuzz_target;
use shoal_storage::swapmeta::decode;

fuzz_target!(|data: &[u8]| {
    let Ok(decoded) = decode(data) else {
        return;
    };
    assert!(decoded.header_len <= data.len());

    // Whatever was understood must survive a round trip
    let encoded = decoded.header.encode();
    let again = decode(&encoded).expect("re-encoded header must decode");
    assert!(!again.truncated);
    assert_eq!(again.header_len, encoded.len());
    assert_eq!(again.header, decoded.header);
});
