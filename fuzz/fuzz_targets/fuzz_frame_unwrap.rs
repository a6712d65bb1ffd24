#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut state = emberlink::CbcState::new(&[0x11; 16], &[0x22; 16]);
    let mut buf = data.to_vec();
    if emberlink::unwrap(&mut buf, &mut state).is_ok() {
        let len = buf.len();
        let _ = emberlink::classify(&buf);
        let _ = emberlink::decode_event(&mut buf, len);
    }
});
