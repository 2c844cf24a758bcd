// MIT License - Copyright (c) 2026 Peter Wright

use crate::error::{AlarmError, Result};
use crate::event::{Event, EventKind};

/// Field separator within a frame.
pub const FIELD_SEP: char = '*';
/// Frame terminator.
pub const TERMINATOR: char = '#';

/// Frame fields before the optional sensor id and payload.
const MIN_FIELDS: usize = 5;

/// A decoded wire frame: the credentials plus the event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub client_id: String,
    pub pin: String,
    pub event: Event,
}

/// Encode an event into its wire frame:
///
/// ```text
/// client_id*pin*sequence*timestamp*event_type*sensor_id*payload#
/// ```
///
/// PING keeps the sequence and timestamp positions empty; trailing optional
/// fields are emitted as empty positions so the field count is fixed.
pub fn encode(client_id: &str, pin: &str, event: &Event) -> String {
    let sequence = if event.kind.consumes_sequence() {
        event.sequence.to_string()
    } else {
        String::new()
    };
    let sensor = event.sensor.map(|id| id.to_string()).unwrap_or_default();
    let payload = event.payload.as_deref().unwrap_or_default();
    format!(
        "{cid}{s}{pin}{s}{seq}{s}{ts}{s}{ty}{s}{sensor}{s}{payload}{t}",
        cid = client_id,
        pin = pin,
        seq = sequence,
        ts = event.timestamp,
        ty = event.kind.as_u8(),
        sensor = sensor,
        payload = payload,
        s = FIELD_SEP,
        t = TERMINATOR,
    )
}

/// Decode a wire frame into a structured record. The input is never mutated.
///
/// Fails with `MalformedMessage` when the terminator is missing, the frame
/// has fewer than the minimum fields, or the type/sequence/sensor fields do
/// not parse. Callers drop the frame and log a warning; there is no
/// retransmission path for malformed input.
pub fn decode(raw: &str) -> Result<WireMessage> {
    let frame = raw.trim_end_matches(['\r', '\n']);
    let body = frame
        .strip_suffix(TERMINATOR)
        .ok_or_else(|| malformed("missing terminator", frame))?;

    // splitn keeps any embedded separators inside the payload intact
    let fields: Vec<&str> = body.splitn(MIN_FIELDS + 2, FIELD_SEP).collect();
    if fields.len() < MIN_FIELDS {
        return Err(malformed("too few fields", frame));
    }

    let kind_num: u8 = fields[4]
        .parse()
        .map_err(|_| malformed("bad event type", frame))?;
    let kind =
        EventKind::from_u8(kind_num).ok_or_else(|| malformed("unknown event type", frame))?;

    // Empty sequence decodes to 0: PING and the inferred kinds never carry one.
    let sequence: u64 = if fields[2].is_empty() {
        0
    } else {
        fields[2]
            .parse()
            .map_err(|_| malformed("bad sequence", frame))?
    };

    let sensor = match fields.get(5) {
        Some(s) if !s.is_empty() => {
            Some(s.parse::<u32>().map_err(|_| malformed("bad sensor id", frame))?)
        }
        _ => None,
    };
    let payload = match fields.get(6) {
        Some(p) if !p.is_empty() => Some((*p).to_string()),
        _ => None,
    };

    Ok(WireMessage {
        client_id: fields[0].to_string(),
        pin: fields[1].to_string(),
        event: Event {
            kind,
            sequence,
            timestamp: fields[3].to_string(),
            sensor,
            payload,
        },
    })
}

/// Cumulative acknowledgment for an event: `*<next_expected_sequence>#`.
pub fn encode_ack(next_expected: u64) -> String {
    format!("{FIELD_SEP}{next_expected}{TERMINATOR}")
}

/// Acknowledgment for a PING: the bare empty-sequence form `*#`.
pub fn encode_ping_ack() -> String {
    format!("{FIELD_SEP}{TERMINATOR}")
}

/// Decode an acknowledgment frame. Returns `Some(next_expected)` for an
/// event ack and `None` for the empty-sequence PING ack.
pub fn decode_ack(raw: &str) -> Result<Option<u64>> {
    let frame = raw.trim_end_matches(['\r', '\n']);
    let body = frame
        .strip_suffix(TERMINATOR)
        .and_then(|b| b.strip_prefix(FIELD_SEP))
        .ok_or_else(|| malformed("bad ack framing", frame))?;
    if body.is_empty() {
        return Ok(None);
    }
    let seq: u64 = body.parse().map_err(|_| malformed("bad ack sequence", frame))?;
    Ok(Some(seq))
}

/// Encode the final cumulative acknowledgment of a secondary session: a bare
/// numeric sequence terminated by `#`.
pub fn encode_session_ack(next_expected: u64) -> String {
    format!("{next_expected}{TERMINATOR}")
}

/// Decode the secondary session's final cumulative acknowledgment. The frame
/// body arrives with the terminator already stripped.
pub fn decode_session_ack(body: &str) -> Result<u64> {
    body.trim()
        .parse()
        .map_err(|_| malformed("bad session ack", body))
}

fn malformed(reason: &str, frame: &str) -> AlarmError {
    AlarmError::MalformedMessage {
        details: format!("{reason}: {frame:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            kind: EventKind::Triggered,
            sequence: 7,
            timestamp: "41:05".to_string(),
            sensor: Some(3),
            payload: Some("1754560000".to_string()),
        }
    }

    #[test]
    fn test_encode_full_frame() {
        let frame = encode("club", "1234", &sample_event());
        assert_eq!(frame, "club*1234*7*41:05*1*3*1754560000#");
    }

    #[test]
    fn test_encode_ping_leaves_positions_empty() {
        let frame = encode("club", "1234", &Event::ping());
        assert_eq!(frame, "club*1234***8**#");
    }

    #[test]
    fn test_decode_roundtrip() {
        let msg = decode("club*1234*7*41:05*1*3*1754560000#").unwrap();
        assert_eq!(msg.client_id, "club");
        assert_eq!(msg.pin, "1234");
        assert_eq!(msg.event, sample_event());
    }

    #[test]
    fn test_decode_ping() {
        let msg = decode("club*1234***8**#").unwrap();
        assert_eq!(msg.event.kind, EventKind::Ping);
        assert_eq!(msg.event.sequence, 0);
        assert!(msg.event.timestamp.is_empty());
        assert!(msg.event.sensor.is_none());
        assert!(msg.event.payload.is_none());
    }

    #[test]
    fn test_decode_without_optional_fields() {
        let msg = decode("club*1234*2*00:30*3#").unwrap();
        assert_eq!(msg.event.kind, EventKind::Disarmed);
        assert_eq!(msg.event.sequence, 2);
        assert!(msg.event.sensor.is_none());
        assert!(msg.event.payload.is_none());
    }

    #[test]
    fn test_decode_missing_terminator() {
        let err = decode("club*1234*7*41:05*1*3*1754560000").unwrap_err();
        assert!(matches!(err, AlarmError::MalformedMessage { .. }));
    }

    #[test]
    fn test_decode_too_few_fields() {
        let err = decode("club*1234*7#").unwrap_err();
        assert!(matches!(err, AlarmError::MalformedMessage { .. }));
    }

    #[test]
    fn test_decode_bad_event_type() {
        assert!(decode("club*1234*7*41:05*banana#").is_err());
        assert!(decode("club*1234*7*41:05*42#").is_err());
    }

    #[test]
    fn test_decode_does_not_mutate_input() {
        let raw = "club*1234*2*00:30*3#";
        let _ = decode(raw).unwrap();
        assert_eq!(raw, "club*1234*2*00:30*3#");
    }

    #[test]
    fn test_ack_roundtrip() {
        assert_eq!(encode_ack(8), "*8#");
        assert_eq!(decode_ack("*8#").unwrap(), Some(8));
        assert_eq!(encode_ping_ack(), "*#");
        assert_eq!(decode_ack("*#").unwrap(), None);
        assert!(decode_ack("8#").is_err());
        assert!(decode_ack("*8").is_err());
        assert!(decode_ack("*eight#").is_err());
    }

    #[test]
    fn test_session_ack() {
        assert_eq!(encode_session_ack(12), "12#");
        assert_eq!(decode_session_ack("12").unwrap(), 12);
        assert!(decode_session_ack("").is_err());
    }
}
