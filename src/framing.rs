//! Message framing over fixed-size link packets
//!
//! Two framing styles share one chunking primitive:
//!
//! - **Terminator**: chunks carry raw payload bytes and a zero-length chunk closes
//!   the message. Text and voice travel on separate characteristics.
//! - **Typed prefix**: every chunk starts with a [`FrameTag`]. Text is a single
//!   `Text` chunk; voice is `VoiceStart`, one or more `VoiceData`, `VoiceEnd`.
//!
//! Outgoing frames are produced by [`encode_message`] and written in order by
//! [`send_frames`]. Incoming chunks are fed into a [`Reassembler`], which never
//! fails: malformed input is logged and surfaced as [`Inbound::Malformed`].

use crate::types::{CharacteristicRole, FrameTag, FramingStyle, LinkError, Result};
use log::{debug, warn};
use std::time::Duration;

/// Bytes reserved in every typed-prefix chunk for the tag
pub const TYPED_PREFIX_OVERHEAD: usize = 1;

/// Kind of logical payload carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Text,
    Voice,
}

/// A completed inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Voice(Vec<u8>),
    /// A message was complete but could not be decoded; its buffer was dropped
    Malformed { kind: PayloadKind, reason: String },
}

/// Destination for outgoing link chunks
#[async_trait::async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_chunk(&self, role: CharacteristicRole, chunk: &[u8]) -> Result<()>;
}

/// Split a payload into chunks of at most `max_chunk` bytes.
///
/// An empty payload yields no chunks.
pub fn split_payload(payload: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    payload
        .chunks(max_chunk.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Chunks for the terminator style, closed by an empty chunk
pub fn chunk_terminated(payload: &[u8], max_write: usize) -> Result<Vec<Vec<u8>>> {
    if max_write == 0 {
        return Err(LinkError::Protocol("link write size is zero".to_string()));
    }
    let mut frames = split_payload(payload, max_write);
    frames.push(Vec::new());
    Ok(frames)
}

/// Single typed-prefix text frame. Text is never split across chunks.
pub fn frame_text(text: &str, max_write: usize) -> Result<Vec<u8>> {
    let max = max_write.saturating_sub(TYPED_PREFIX_OVERHEAD);
    if text.len() > max {
        return Err(LinkError::PayloadTooLarge {
            len: text.len(),
            max,
        });
    }
    let mut frame = Vec::with_capacity(text.len() + TYPED_PREFIX_OVERHEAD);
    frame.push(FrameTag::Text.to_u8());
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

/// Typed-prefix voice frames: start marker, data chunks, end marker
pub fn frame_voice(blob: &[u8], max_write: usize) -> Result<Vec<Vec<u8>>> {
    let max_data = max_write.saturating_sub(TYPED_PREFIX_OVERHEAD);
    if max_data == 0 {
        return Err(LinkError::Protocol(format!(
            "link write size {} leaves no room for voice data",
            max_write
        )));
    }

    let mut frames = Vec::with_capacity(blob.len() / max_data + 3);
    frames.push(vec![FrameTag::VoiceStart.to_u8()]);
    for chunk in blob.chunks(max_data) {
        let mut frame = Vec::with_capacity(chunk.len() + TYPED_PREFIX_OVERHEAD);
        frame.push(FrameTag::VoiceData.to_u8());
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    frames.push(vec![FrameTag::VoiceEnd.to_u8()]);
    Ok(frames)
}

/// Encode one logical message into the link chunks for the given style
pub fn encode_message(
    style: FramingStyle,
    kind: PayloadKind,
    payload: &[u8],
    max_write: usize,
) -> Result<Vec<Vec<u8>>> {
    match (style, kind) {
        (FramingStyle::Terminator, _) => chunk_terminated(payload, max_write),
        (FramingStyle::TypedPrefix, PayloadKind::Text) => {
            let text = std::str::from_utf8(payload)
                .map_err(|e| LinkError::Protocol(format!("text is not UTF-8: {}", e)))?;
            Ok(vec![frame_text(text, max_write)?])
        }
        (FramingStyle::TypedPrefix, PayloadKind::Voice) => frame_voice(payload, max_write),
    }
}

/// Write frames in order with a pause between consecutive chunks.
///
/// Stops at the first rejected write; chunks already written are not recalled.
pub async fn send_frames(
    sink: &dyn ChunkSink,
    role: CharacteristicRole,
    frames: &[Vec<u8>],
    pause: Duration,
) -> Result<()> {
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        debug!(
            "Writing chunk {}/{} ({} bytes) to {}",
            i + 1,
            frames.len(),
            frame.len(),
            role
        );
        sink.write_chunk(role, frame).await?;
    }
    Ok(())
}

/// Ordered chunks of one inbound message
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    chunks: Vec<Vec<u8>>,
    awaiting_terminator: bool,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the buffer without data (explicit start marker)
    pub fn start(&mut self) {
        self.chunks.clear();
        self.awaiting_terminator = true;
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.chunks.push(chunk.to_vec());
        self.awaiting_terminator = true;
    }

    pub fn is_awaiting_terminator(&self) -> bool {
        self.awaiting_terminator
    }

    /// Total buffered payload length
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate the buffered chunks and reset
    pub fn take(&mut self) -> Vec<u8> {
        let payload = self.chunks.concat();
        self.clear();
        payload
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.awaiting_terminator = false;
    }
}

/// Inbound side of the framing codec for one link
#[derive(Debug)]
pub struct Reassembler {
    style: FramingStyle,
    text: ReassemblyBuffer,
    voice: ReassemblyBuffer,
}

impl Reassembler {
    pub fn new(style: FramingStyle) -> Self {
        Self {
            style,
            text: ReassemblyBuffer::new(),
            voice: ReassemblyBuffer::new(),
        }
    }

    pub fn style(&self) -> FramingStyle {
        self.style
    }

    /// Feed one received chunk.
    ///
    /// `stream` names the characteristic the chunk arrived on; typed-prefix
    /// chunks dispatch on their tag instead.
    pub fn on_chunk(&mut self, stream: PayloadKind, chunk: &[u8]) -> Option<Inbound> {
        match self.style {
            FramingStyle::Terminator => self.on_terminated_chunk(stream, chunk),
            FramingStyle::TypedPrefix => self.on_typed_chunk(chunk),
        }
    }

    /// Drop any partially received messages
    pub fn reset(&mut self) {
        if self.text.is_awaiting_terminator() || self.voice.is_awaiting_terminator() {
            debug!(
                "Discarding partial messages: text {} bytes, voice {} bytes",
                self.text.len(),
                self.voice.len()
            );
        }
        self.text.clear();
        self.voice.clear();
    }

    fn on_terminated_chunk(&mut self, stream: PayloadKind, chunk: &[u8]) -> Option<Inbound> {
        let buffer = match stream {
            PayloadKind::Text => &mut self.text,
            PayloadKind::Voice => &mut self.voice,
        };

        if !chunk.is_empty() {
            buffer.push(chunk);
            return None;
        }
        if !buffer.is_awaiting_terminator() {
            debug!("Ignoring {:?} terminator with no message in progress", stream);
            return None;
        }

        let payload = buffer.take();
        match stream {
            PayloadKind::Text => match String::from_utf8(payload) {
                Ok(text) => Some(Inbound::Text(text)),
                Err(e) => {
                    warn!("Dropping undecodable text message: {}", e);
                    Some(Inbound::Malformed {
                        kind: PayloadKind::Text,
                        reason: e.to_string(),
                    })
                }
            },
            PayloadKind::Voice => Some(Inbound::Voice(payload)),
        }
    }

    fn on_typed_chunk(&mut self, chunk: &[u8]) -> Option<Inbound> {
        let Some((&tag, body)) = chunk.split_first() else {
            warn!("Ignoring empty typed-prefix chunk");
            return None;
        };

        match FrameTag::from_u8(tag) {
            Ok(FrameTag::Text) => match std::str::from_utf8(body) {
                Ok(text) => Some(Inbound::Text(text.to_string())),
                Err(e) => {
                    warn!("Dropping undecodable text frame: {}", e);
                    Some(Inbound::Malformed {
                        kind: PayloadKind::Text,
                        reason: e.to_string(),
                    })
                }
            },
            Ok(FrameTag::VoiceStart) => {
                if self.voice.is_awaiting_terminator() {
                    warn!(
                        "Voice start while {} bytes were pending; discarding them",
                        self.voice.len()
                    );
                }
                self.voice.start();
                None
            }
            Ok(FrameTag::VoiceData) => {
                self.voice.push(body);
                None
            }
            Ok(FrameTag::VoiceEnd) => {
                if !self.voice.is_awaiting_terminator() {
                    warn!("Voice end without a voice message in progress");
                    return None;
                }
                Some(Inbound::Voice(self.voice.take()))
            }
            Err(e) => {
                warn!("{}; surfacing chunk as text", e);
                Some(Inbound::Text(String::from_utf8_lossy(chunk).into_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn reassemble_terminated(frames: &[Vec<u8>]) -> Vec<Inbound> {
        let mut reassembler = Reassembler::new(FramingStyle::Terminator);
        frames
            .iter()
            .filter_map(|frame| reassembler.on_chunk(PayloadKind::Voice, frame))
            .collect()
    }

    #[test]
    fn test_terminated_roundtrip_boundaries() {
        let max = 20;
        for len in [1, max - 1, max, max + 1, 3 * max] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frames = chunk_terminated(&payload, max).unwrap();

            assert!(frames.iter().all(|f| f.len() <= max));
            assert!(frames.last().unwrap().is_empty());
            assert_eq!(frames.len(), len.div_ceil(max) + 1);

            let messages = reassemble_terminated(&frames);
            assert_eq!(messages, vec![Inbound::Voice(payload)], "length {}", len);
        }
    }

    #[test]
    fn test_terminated_text_and_voice_are_independent() {
        let mut reassembler = Reassembler::new(FramingStyle::Terminator);
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, b"hel"), None);
        assert_eq!(reassembler.on_chunk(PayloadKind::Voice, &[1, 2]), None);
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, b"lo"), None);
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, &[]),
            Some(Inbound::Text("hello".to_string()))
        );
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Voice, &[]),
            Some(Inbound::Voice(vec![1, 2]))
        );
    }

    #[test]
    fn test_terminated_stray_terminator_is_ignored() {
        let mut reassembler = Reassembler::new(FramingStyle::Terminator);
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, &[]), None);
        assert_eq!(reassembler.on_chunk(PayloadKind::Voice, &[]), None);

        reassembler.on_chunk(PayloadKind::Text, b"hi");
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, &[]),
            Some(Inbound::Text("hi".to_string()))
        );
        // A repeated terminator does not produce a second, empty message
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, &[]), None);
    }

    #[test]
    fn test_terminated_invalid_utf8_clears_buffer() {
        let mut reassembler = Reassembler::new(FramingStyle::Terminator);
        reassembler.on_chunk(PayloadKind::Text, &[0xFF, 0xFE]);
        let result = reassembler.on_chunk(PayloadKind::Text, &[]);
        assert!(matches!(
            result,
            Some(Inbound::Malformed {
                kind: PayloadKind::Text,
                ..
            })
        ));

        reassembler.on_chunk(PayloadKind::Text, b"ok");
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, &[]),
            Some(Inbound::Text("ok".to_string()))
        );
    }

    #[test]
    fn test_typed_voice_any_split() {
        let blob: Vec<u8> = (0..97u8).collect();
        for max_write in [2, 7, 33, 97, 98, 200] {
            let frames = frame_voice(&blob, max_write).unwrap();
            assert_eq!(frames.first().unwrap(), &vec![0x01]);
            assert_eq!(frames.last().unwrap(), &vec![0x03]);
            assert!(frames.len() >= 3);

            let mut reassembler = Reassembler::new(FramingStyle::TypedPrefix);
            let out: Vec<_> = frames
                .iter()
                .filter_map(|f| reassembler.on_chunk(PayloadKind::Voice, f))
                .collect();
            assert_eq!(out, vec![Inbound::Voice(blob.clone())], "max_write {}", max_write);
        }
    }

    #[test]
    fn test_typed_voice_concatenates_data_chunks() {
        let mut reassembler = Reassembler::new(FramingStyle::TypedPrefix);
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, &[0x01]), None);
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, &[0x02, b'a']), None);
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, &[0x02, b'b', b'c']), None);
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, &[0x03]),
            Some(Inbound::Voice(b"abc".to_vec()))
        );
    }

    #[test]
    fn test_typed_voice_start_resets_buffer() {
        let mut reassembler = Reassembler::new(FramingStyle::TypedPrefix);
        reassembler.on_chunk(PayloadKind::Voice, &[0x01]);
        reassembler.on_chunk(PayloadKind::Voice, &[0x02, 9, 9]);
        reassembler.on_chunk(PayloadKind::Voice, &[0x01]);
        reassembler.on_chunk(PayloadKind::Voice, &[0x02, 1]);
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Voice, &[0x03]),
            Some(Inbound::Voice(vec![1]))
        );
        // A stray end marker emits nothing
        assert_eq!(reassembler.on_chunk(PayloadKind::Voice, &[0x03]), None);
    }

    #[test]
    fn test_typed_text_and_unknown_tag() {
        let mut reassembler = Reassembler::new(FramingStyle::TypedPrefix);
        let frame = frame_text("turn left", 20).unwrap();
        assert_eq!(frame[0], 0x00);
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, &frame),
            Some(Inbound::Text("turn left".to_string()))
        );

        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, b"Hi"),
            Some(Inbound::Text("Hi".to_string()))
        );
        assert_eq!(reassembler.on_chunk(PayloadKind::Text, &[]), None);
    }

    #[test]
    fn test_typed_text_size_bound() {
        assert!(frame_text("1234", 5).is_ok());
        match frame_text("12345", 5) {
            Err(LinkError::PayloadTooLarge { len, max }) => {
                assert_eq!(len, 5);
                assert_eq!(max, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_encode_message_rejects_invalid_sizes() {
        assert!(chunk_terminated(b"x", 0).is_err());
        assert!(frame_voice(b"x", 1).is_err());
        assert!(encode_message(FramingStyle::TypedPrefix, PayloadKind::Text, &[0xFF], 20).is_err());
    }

    #[test]
    fn test_reset_discards_partial_messages() {
        let mut reassembler = Reassembler::new(FramingStyle::Terminator);
        reassembler.on_chunk(PayloadKind::Text, b"stale");
        reassembler.reset();
        reassembler.on_chunk(PayloadKind::Text, b"fresh");
        assert_eq!(
            reassembler.on_chunk(PayloadKind::Text, &[]),
            Some(Inbound::Text("fresh".to_string()))
        );
    }

    struct RecordingSink {
        writes: Mutex<Vec<(CharacteristicRole, Vec<u8>)>>,
        fail_at: Option<usize>,
    }

    #[async_trait::async_trait]
    impl ChunkSink for RecordingSink {
        async fn write_chunk(&self, role: CharacteristicRole, chunk: &[u8]) -> Result<()> {
            let mut writes = self.writes.lock().unwrap();
            if Some(writes.len()) == self.fail_at {
                return Err(LinkError::Transport("write rejected".to_string()));
            }
            writes.push((role, chunk.to_vec()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_frames_pauses_between_chunks() {
        let sink = RecordingSink {
            writes: Mutex::new(Vec::new()),
            fail_at: None,
        };
        let frames = chunk_terminated(&[7u8; 45], 20).unwrap();

        let start = tokio::time::Instant::now();
        send_frames(
            &sink,
            CharacteristicRole::VoiceWrite,
            &frames,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        // Four frames, three pauses
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_millis(200));
        let writes = sink.writes.lock().unwrap();
        assert_eq!(writes.len(), 4);
        assert!(writes.iter().all(|(r, _)| *r == CharacteristicRole::VoiceWrite));
    }

    #[tokio::test]
    async fn test_send_frames_stops_at_rejected_write() {
        let sink = RecordingSink {
            writes: Mutex::new(Vec::new()),
            fail_at: Some(1),
        };
        let frames = chunk_terminated(&[1u8; 30], 10).unwrap();
        let result = send_frames(&sink, CharacteristicRole::TextWrite, &frames, Duration::ZERO).await;
        assert!(result.is_err());
        assert_eq!(sink.writes.lock().unwrap().len(), 1);
    }
}
