//! Tokio codec for newline-delimited JSON messages

use std::marker::PhantomData;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LinesCodec};

use crate::error::ProtocolError;

/// Maximum length of a single encoded line (1 MiB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec decoding one `D` per line and encoding any serializable value as a line.
///
/// Empty lines are skipped so that a peer may send keepalive newlines.
#[derive(Debug)]
pub struct JsonLinesCodec<D> {
    lines: LinesCodec,
    _decoded: PhantomData<fn() -> D>,
}

impl<D> JsonLinesCodec<D> {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            _decoded: PhantomData,
        }
    }
}

impl<D> Default for JsonLinesCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned> Decoder for JsonLinesCodec<D> {
    type Item = D;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(&line)?)),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode_eof(src)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(&line)?)),
                None => return Ok(None),
            }
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonLinesCodec<D> {
    type Error = ProtocolError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestEvent, GuestRequest, IpPort};

    #[test]
    fn test_decode_event_line() {
        let mut codec = JsonLinesCodec::<GuestEvent>::new();
        let mut buf = BytesMut::from(
            &br#"{"local_ports_added":[{"ip":"0.0.0.0","port":8080}]}
"#[..],
        );

        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(event.local_ports_added.len(), 1);
        assert_eq!(event.local_ports_added[0].port, 8080);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_line() {
        let mut codec = JsonLinesCodec::<GuestEvent>::new();
        let mut buf = BytesMut::from(&br#"{"errors":["#[..]);

        // Need more data
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"boom\"]}\n");
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(event.errors, vec!["boom".to_string()]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut codec = JsonLinesCodec::<GuestEvent>::new();
        let mut buf = BytesMut::from(&b"\n\n{}\n"[..]);

        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert!(event.local_ports_added.is_empty());
    }

    #[test]
    fn test_malformed_line_is_error() {
        let mut codec = JsonLinesCodec::<GuestEvent>::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_encode_request_appends_newline() {
        let mut codec = JsonLinesCodec::<GuestEvent>::new();
        let mut buf = BytesMut::new();

        codec.encode(GuestRequest::Events, &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"type\":\"events\"}\n");
    }

    #[test]
    fn test_encode_decode_ip_port() {
        let mut codec = JsonLinesCodec::<IpPort>::new();
        let mut buf = BytesMut::new();

        let original = IpPort::tcp("::1".parse().unwrap(), 9000);
        codec.encode(&original, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
