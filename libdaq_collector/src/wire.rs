//! Framing and serialization of the producer → collector byte stream.
//!
//! Every record on the stream is a frame: a little-endian `u32` length (covering the type
//! byte and payload), one frame type byte and the payload. Text frames carry handshake lines;
//! event frames carry one serialized [`Event`], sub-events nested recursively.
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::constants::*;
use super::error::ProtocolError;
use super::event::{Event, EventFlags, EventKind, Interval};

/// Write one frame. Returns the number of bytes put on the stream.
pub fn write_frame<W: Write>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> Result<usize, ProtocolError> {
    let length = payload.len() as u64 + 1;
    if length > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge(length.min(u32::MAX as u64) as u32));
    }
    writer.write_u32::<LittleEndian>(length as u32)?;
    writer.write_u8(frame_type)?;
    writer.write_all(payload)?;
    Ok(FRAME_HEADER_SIZE + payload.len())
}

/// Read one frame, returning its type and payload.
///
/// A stream that ends before a frame header is reported as `ConnectionClosed`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError> {
    let length = match reader.read_u32::<LittleEndian>() {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(ProtocolError::IOError(e)),
    };
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if length == 0 {
        return Err(ProtocolError::EmptyFrame(length));
    }
    let frame_type = reader.read_u8()?;
    if frame_type != FRAME_TYPE_TEXT && frame_type != FRAME_TYPE_EVENT {
        return Err(ProtocolError::UnknownFrameType(frame_type));
    }
    let mut payload = vec![0; length as usize - 1];
    reader.read_exact(&mut payload)?;
    Ok((frame_type, payload))
}

pub fn write_text<W: Write>(writer: &mut W, line: &str) -> Result<usize, ProtocolError> {
    write_frame(writer, FRAME_TYPE_TEXT, line.as_bytes())
}

/// Read a frame that must be a text line
pub fn read_text<R: Read>(reader: &mut R) -> Result<String, ProtocolError> {
    let (frame_type, payload) = read_frame(reader)?;
    if frame_type != FRAME_TYPE_TEXT {
        return Err(ProtocolError::UnexpectedFrame(FRAME_TYPE_TEXT, frame_type));
    }
    Ok(String::from_utf8(payload)?)
}

pub fn write_event<W: Write>(writer: &mut W, event: &Event) -> Result<usize, ProtocolError> {
    write_frame(writer, FRAME_TYPE_EVENT, &encode_event(event))
}

/// Serialize an Event (and its sub-events). Tags are stored in key order, so equal events
/// always produce identical bytes.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_into(&mut buffer, event);
    buffer
}

// Writing into a Vec cannot fail
fn encode_into(buffer: &mut Vec<u8>, event: &Event) {
    put_str(buffer, event.kind().as_str());
    put_u32(buffer, event.flags().bits());
    put_u32(buffer, event.source_id());
    put_u32(buffer, event.run_number());
    put_u32(buffer, event.event_number());
    put_u32(buffer, event.trigger_number().unwrap_or(0));
    let ts = event.timestamp().unwrap_or(Interval { begin: 0, end: 0 });
    put_u64(buffer, ts.begin);
    put_u64(buffer, ts.end);
    put_u32(buffer, event.tags().len() as u32);
    for (key, value) in event.tags() {
        put_str(buffer, key);
        put_str(buffer, value);
    }
    put_u32(buffer, event.blocks().len() as u32);
    for block in event.blocks() {
        put_str(buffer, &block.name);
        put_u32(buffer, block.data.len() as u32);
        buffer.extend_from_slice(&block.data);
    }
    put_u32(buffer, event.sub_events().len() as u32);
    for sub_event in event.sub_events() {
        encode_into(buffer, sub_event);
    }
}

fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_str(buffer: &mut Vec<u8>, value: &str) {
    put_u32(buffer, value.len() as u32);
    buffer.extend_from_slice(value.as_bytes());
}

/// Deserialize one Event. The whole buffer must be consumed.
///
/// Structural problems are protocol errors. Semantic ones (e.g. an empty timestamp interval)
/// are left for the merger to judge.
pub fn decode_event(bytes: &[u8]) -> Result<Event, ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let event = decode_from(&mut cursor, 0)?;
    let remaining = bytes.len() - cursor.position() as usize;
    if remaining != 0 {
        return Err(ProtocolError::TrailingBytes(remaining));
    }
    Ok(event)
}

fn decode_from(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Event, ProtocolError> {
    if depth > MAX_SUB_EVENT_DEPTH {
        return Err(ProtocolError::TooDeep);
    }
    let kind = EventKind::from(get_str(cursor, "kind")?);
    let flags = EventFlags::from_bits_truncate(get_u32(cursor, "flags")?);
    let source_id = get_u32(cursor, "source id")?;
    let run_number = get_u32(cursor, "run number")?;
    let event_number = get_u32(cursor, "event number")?;
    let trigger = get_u32(cursor, "trigger number")?;
    let begin = get_u64(cursor, "timestamp begin")?;
    let end = get_u64(cursor, "timestamp end")?;

    let mut event = Event::new(kind, source_id, run_number)
        .with_event_number(event_number)
        .with_flags(flags);
    if flags.contains(EventFlags::TRIGGER) {
        event = event.with_trigger(trigger);
    }
    if flags.contains(EventFlags::TIMESTAMP) {
        event = event.with_timestamp(Interval { begin, end });
    }

    let n_tags = get_count(cursor, "tag count")?;
    for _ in 0..n_tags {
        let key = get_str(cursor, "tag key")?;
        let value = get_str(cursor, "tag value")?;
        event = event.with_tag(&key, &value);
    }
    let n_blocks = get_count(cursor, "block count")?;
    for _ in 0..n_blocks {
        let name = get_str(cursor, "block name")?;
        let data = get_bytes(cursor, "block data")?;
        event = event.with_block(&name, data);
    }
    let n_sub_events = get_count(cursor, "sub-event count")?;
    for _ in 0..n_sub_events {
        let sub_event = decode_from(cursor, depth + 1)?;
        event = event.with_sub_event(sub_event.into_ref());
    }
    Ok(event)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}

fn get_u32(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u32, ProtocolError> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ProtocolError::Truncated(what))
}

fn get_u64(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<u64, ProtocolError> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| ProtocolError::Truncated(what))
}

/// An element count. Every element takes at least four bytes, which bounds the count by the
/// bytes left and keeps a corrupt count from driving a huge loop.
fn get_count(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<usize, ProtocolError> {
    let count = get_u32(cursor, what)? as usize;
    if count > remaining(cursor) / 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(count)
}

fn get_bytes(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<Vec<u8>, ProtocolError> {
    let length = get_u32(cursor, what)? as usize;
    if length > remaining(cursor) {
        return Err(ProtocolError::Truncated(what));
    }
    let mut data = vec![0; length];
    cursor
        .read_exact(&mut data)
        .map_err(|_| ProtocolError::Truncated(what))?;
    Ok(data)
}

fn get_str(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<String, ProtocolError> {
    Ok(String::from_utf8(get_bytes(cursor, what)?)?)
}

/// Who is on the other end of a data connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerIdentity {
    pub producer_type: String,
    pub name: String,
}

/// The line the collector sends when a producer connects
pub fn greeting(collector_name: &str) -> String {
    format!("{HANDSHAKE_OK} {PROTOCOL_NAME} {DATA_CONNECTION} {collector_name}")
}

/// The line a producer answers with
pub fn identification_line(producer_type: &str, name: &str) -> String {
    format!("{HANDSHAKE_OK} {PROTOCOL_NAME} {DATA_CONNECTION} {producer_type} {name}")
}

/// Parse `OK <PROTOCOL> DATA <producer-type> <producer-name>`
pub fn parse_identification(line: &str) -> Result<ProducerIdentity, ProtocolError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [ok, protocol, data, producer_type, name]
            if *ok == HANDSHAKE_OK && *protocol == PROTOCOL_NAME && *data == DATA_CONNECTION =>
        {
            Ok(ProducerIdentity {
                producer_type: producer_type.to_string(),
                name: name.to_string(),
            })
        }
        _ => Err(ProtocolError::BadHandshake(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let sub = Event::new(EventKind::Raw, 3, 5)
            .with_event_number(11)
            .with_trigger(42)
            .with_block("adc", vec![0xde, 0xad])
            .into_ref();
        Event::new(EventKind::Sync, 0, 5)
            .with_event_number(2)
            .with_timestamp(Interval::new(100, 250).unwrap())
            .with_flags(EventFlags::PACKET)
            .with_tag("zeta", "last")
            .with_tag("alpha", "first")
            .with_sub_event(sub)
    }

    #[test]
    fn test_event_survives_the_wire() {
        let event = sample_event();
        let mut stream = Vec::new();
        write_event(&mut stream, &event).unwrap();
        let mut reader = stream.as_slice();
        let (frame_type, payload) = read_frame(&mut reader).unwrap();
        assert_eq!(frame_type, FRAME_TYPE_EVENT);
        let decoded = decode_event(&payload).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.sub_events()[0].trigger_number(), Some(42));
        assert!(matches!(
            read_frame(&mut reader),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = Event::new(EventKind::Raw, 1, 1)
            .with_tag("b", "2")
            .with_tag("a", "1");
        let b = Event::new(EventKind::Raw, 1, 1)
            .with_tag("a", "1")
            .with_tag("b", "2");
        assert_eq!(encode_event(&a), encode_event(&b));
    }

    #[test]
    fn test_empty_interval_is_left_to_the_merger() {
        let event = Event::new(EventKind::Raw, 1, 1).with_timestamp(Interval { begin: 9, end: 9 });
        let decoded = decode_event(&encode_event(&event)).unwrap();
        assert!(decoded.validate_timestamp().is_err());
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = encode_event(&sample_event());
        let result = decode_event(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(ProtocolError::Truncated(_))));
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            decode_event(&padded),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_frame_limits() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        assert!(matches!(
            read_frame(&mut stream.as_slice()),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        let stream = [2u8, 0, 0, 0, 9, 0];
        assert!(matches!(
            read_frame(&mut stream.as_slice()),
            Err(ProtocolError::UnknownFrameType(9))
        ));
    }

    #[test]
    fn test_handshake_lines() {
        let line = identification_line("TluProducer", "tlu");
        assert_eq!(line, "OK EUDAQ DATA TluProducer tlu");
        assert_eq!(
            parse_identification(&line).unwrap(),
            ProducerIdentity {
                producer_type: "TluProducer".to_string(),
                name: "tlu".to_string()
            }
        );
        assert!(parse_identification("OK EUDAQ LOG TluProducer tlu").is_err());
        assert!(parse_identification("OK EUDAQ DATA tlu").is_err());
        assert_eq!(greeting("dc"), "OK EUDAQ DATA dc");
    }

    #[test]
    fn test_text_frames() {
        let mut stream = Vec::new();
        write_text(&mut stream, "OK").unwrap();
        assert_eq!(read_text(&mut stream.as_slice()).unwrap(), "OK");
        let mut stream = Vec::new();
        write_event(&mut stream, &sample_event()).unwrap();
        assert!(matches!(
            read_text(&mut stream.as_slice()),
            Err(ProtocolError::UnexpectedFrame(FRAME_TYPE_TEXT, FRAME_TYPE_EVENT))
        ));
    }
}
