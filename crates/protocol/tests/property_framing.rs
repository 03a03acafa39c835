// Property-based tests for framing and the message codec.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use petri_debug_protocol::{AckKind, FramedChannel, Message, StateEntry};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_256() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Arbitrary text: plain, with newlines and quotes, or multi-byte.
fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => any::<String>(),
        1 => r#"[a-z "\\\n\t]{0,20}"#,
        1 => "[\u{00e0}-\u{00ff}\u{4e00}-\u{4e20}\u{1F600}-\u{1F610}]{0,8}",
    ]
}

fn arb_ack() -> impl Strategy<Value = AckKind> {
    prop_oneof![
        Just(AckKind::Start),
        Just(AckKind::Stop),
        Just(AckKind::Pause),
        Just(AckKind::Resume),
        Just(AckKind::Reload),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        arb_text().prop_map(|v| Message::hello(&v)),
        Just(Message::Ehlo),
        arb_text().prop_map(Message::start),
        Just(Message::Stop),
        Just(Message::Pause),
        Just(Message::Resume),
        Just(Message::Reload),
        prop::collection::vec(any::<u64>(), 0..8).prop_map(Message::Breakpoints),
        arb_text().prop_map(Message::evaluate),
        prop::option::of(arb_text()).prop_map(Message::Exit),
        prop::option::of(arb_text()).prop_map(Message::ExitSession),
        arb_ack().prop_map(Message::Ack),
        arb_text().prop_map(Message::Error),
        prop::collection::vec((any::<u64>(), any::<u64>()), 0..8).prop_map(|pairs| {
            Message::States(pairs.into_iter().map(|(id, count)| StateEntry { id, count }).collect())
        }),
        (arb_text(), arb_text()).prop_map(|(lib, eval)| Message::evaluation(lib, eval)),
    ]
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(config_256())]

    /// decode(read(write(encode(M)))) == M for every message shape.
    #[test]
    fn prop_frame_roundtrip(msgs in prop::collection::vec(arb_message(), 1..6)) {
        let out = SharedBuf::default();
        let writer = FramedChannel::new(Cursor::new(Vec::new()), out.clone());
        for msg in &msgs {
            writer.send_message(msg).unwrap();
        }

        let bytes = out.0.lock().unwrap().clone();
        let reader = FramedChannel::new(Cursor::new(bytes), io::sink());
        for msg in &msgs {
            let decoded = reader.receive_message().unwrap();
            prop_assert_eq!(decoded.as_ref(), Some(msg));
        }
        prop_assert!(reader.receive_message().unwrap_err().is_closed());
    }

    /// Any truncation of a frame is reported as a closed channel, never as data.
    #[test]
    fn prop_truncated_frame_is_closed(msg in arb_message(), cut in 0usize..64) {
        let out = SharedBuf::default();
        FramedChannel::new(Cursor::new(Vec::new()), out.clone())
            .send_message(&msg)
            .unwrap();

        let mut bytes = out.0.lock().unwrap().clone();
        let keep = cut % bytes.len();
        bytes.truncate(keep);
        let reader = FramedChannel::new(Cursor::new(bytes), io::sink());
        prop_assert!(reader.receive_message().unwrap_err().is_closed());
    }
}
