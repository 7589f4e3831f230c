use runhub::record::{
    ExitRecord, Record, RecordKind, Request, RunSettings, ServerRequest, ServerRequestKind,
};
use runhub::wire::{decode_message, encode_frame, write_message, FrameReader, WireError};
use std::io::{self, Read};

/// Reader that hands out at most `chunk` bytes per call.
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn sample_requests() -> Vec<ServerRequest> {
    vec![
        ServerRequest::new(ServerRequestKind::InformInit {
            stream_id: "abc".to_string(),
            settings: RunSettings::new("abc"),
        }),
        ServerRequest::new(ServerRequestKind::RecordCommunicate(Record::new(
            "abc",
            RecordKind::Request(Request::Status),
        ))),
        ServerRequest::new(ServerRequestKind::RecordPublish(Record::new(
            "abc",
            RecordKind::Exit(ExitRecord { exit_code: 3 }),
        ))),
        ServerRequest::new(ServerRequestKind::InformTeardown { exit_code: 0 }),
    ]
}

#[test]
fn messages_survive_arbitrary_read_boundaries() {
    let requests = sample_requests();
    let mut bytes = Vec::new();
    for request in &requests {
        write_message(&mut bytes, request).expect("write");
    }

    for chunk in [1, 2, 3, 5, 7, 64, 4096] {
        let mut frames = FrameReader::new(Trickle {
            data: bytes.clone(),
            pos: 0,
            chunk,
        });
        let mut decoded = Vec::new();
        while let Some(payload) = frames.next_frame().expect("frame") {
            decoded.push(decode_message::<ServerRequest>(&payload).expect("decode"));
        }
        assert_eq!(decoded, requests, "chunk size {chunk}");
    }
}

#[test]
fn bad_magic_is_fatal_for_the_stream() {
    let mut bytes = encode_frame(b"{}").expect("encode");
    bytes[0] = b'X';
    let mut frames = FrameReader::new(bytes.as_slice());
    let err = frames.next_frame().expect_err("bad magic");
    assert!(matches!(err, WireError::BadMagic { found: b'X' }));
    assert!(err.desynchronizes_stream());
}

#[test]
fn eof_inside_a_frame_reports_truncation() {
    let bytes = encode_frame(b"hello world").expect("encode");
    let mut frames = FrameReader::new(&bytes[..bytes.len() - 3]);
    let err = frames.next_frame().expect_err("truncated");
    assert!(matches!(err, WireError::Truncated { .. }));
    assert!(err.desynchronizes_stream());
}

#[test]
fn oversized_frames_are_rejected_before_buffering() {
    let bytes = encode_frame(&[b'x'; 128]).expect("encode");
    let mut frames = FrameReader::with_max_payload(bytes.as_slice(), 64);
    let err = frames.next_frame().expect_err("too large");
    assert!(matches!(err, WireError::FrameTooLarge { len: 128, max: 64 }));
}

#[test]
fn undecodable_payload_is_not_a_framing_error() {
    let bytes = encode_frame(b"not json").expect("encode");
    let mut frames = FrameReader::new(bytes.as_slice());
    let payload = frames.next_frame().expect("frame").expect("payload");
    let err = decode_message::<ServerRequest>(&payload).expect_err("decode");
    assert!(!err.desynchronizes_stream());
    assert!(frames.next_frame().expect("clean end").is_none());
}
