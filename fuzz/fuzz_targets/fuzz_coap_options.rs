#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut at = 0;
    while let Some((start, len)) = emberlink::coap::option_decode(data, at) {
        let next = start + len;
        if next <= at {
            break;
        }
        at = next;
    }
});
