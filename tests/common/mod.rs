//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Once;

use bytes::BytesMut;
use sockudo_wire::Frame;
use sockudo_wire::serializer::encode_frame;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once, filtered by `RUST_LOG`
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Encode frames the way a peer would put them on the wire
pub fn wire(frames: &[Frame], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for frame in frames {
        encode_frame(&mut buf, frame, mask);
    }
    buf.to_vec()
}
