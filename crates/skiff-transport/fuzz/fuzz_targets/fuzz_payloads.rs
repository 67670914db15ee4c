#![no_main]

use libfuzzer_sys::fuzz_target;
use skiff_transport::message::{JoinAccept, JoinDeny, JoinRequest, Ping, Pong};

/// Fuzz the core message payload decoders. None of them may panic, and
/// whatever decodes must re-encode to the bytes it came from.
fuzz_target!(|data: &[u8]| {
    if let Some(req) = JoinRequest::decode(&mut &data[..]) {
        assert_eq!(&req.encode()[..], &data[..JoinRequest::ENCODED_LEN]);
    }
    if let Some(accept) = JoinAccept::decode(&mut &data[..]) {
        assert_eq!(&accept.encode()[..], &data[..JoinAccept::ENCODED_LEN]);
    }
    let _ = JoinDeny::decode(&mut &data[..]);
    if let Some(ping) = Ping::decode(&mut &data[..]) {
        assert_eq!(&ping.encode()[..], &data[..Ping::ENCODED_LEN]);
    }
    if let Some(pong) = Pong::decode(&mut &data[..]) {
        assert_eq!(&pong.encode()[..], &data[..Pong::ENCODED_LEN]);
    }
});
