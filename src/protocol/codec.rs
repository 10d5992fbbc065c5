use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

use super::resp::RespValue;

/// Nesting depth guard for aggregate frames. Malicious peers can otherwise
/// blow the stack with `*1*1*1...` prefixes.
pub const DEFAULT_MAX_DEPTH: usize = 7;

/// Incremental RESP3 frame codec.
///
/// Decoding never consumes partial frames: incomplete input yields
/// `Ok(None)` with the buffer untouched, protocol violations are fatal for
/// the owning wire. Encoding of outbound commands uses the flat
/// `*N\r\n$len\r\n...` form via [`encode_command`]; the `Encoder` impl
/// covers full values and exists for the reply side of test servers.
#[derive(Debug, Clone)]
pub struct RespCodec {
    max_depth: usize,
}

impl RespCodec {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }
}

impl Default for RespCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos, self.max_depth)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), Error> {
        write_value(&item, dst);
        Ok(())
    }
}

/// Encode a command as a flat array of bulk strings.
pub fn encode_command(tokens: &[Bytes], dst: &mut BytesMut) {
    dst.extend_from_slice(b"*");
    dst.extend_from_slice(tokens.len().to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
    for token in tokens {
        dst.extend_from_slice(b"$");
        dst.extend_from_slice(token.len().to_string().as_bytes());
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(token);
        dst.extend_from_slice(b"\r\n");
    }
}

fn parse_value(src: &[u8], pos: &mut usize, depth: usize) -> Result<Option<RespValue>, Error> {
    if depth == 0 {
        return Err(Error::protocol("frame nesting exceeds the configured depth"));
    }
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    macro_rules! line_or_rollback {
        () => {
            match read_line(src, pos)? {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            }
        };
    }

    match prefix {
        b'+' => {
            let line = line_or_rollback!();
            Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line))))
        }
        b'-' => {
            let line = line_or_rollback!();
            Ok(Some(RespValue::Error(Bytes::copy_from_slice(line))))
        }
        b':' => {
            let line = line_or_rollback!();
            let text = std::str::from_utf8(line)
                .map_err(|_| Error::protocol("integer frame is not UTF-8"))?;
            let value = text
                .parse::<i64>()
                .map_err(|err| Error::protocol(format!("invalid integer frame: {err}")))?;
            Ok(Some(RespValue::Integer(value)))
        }
        b',' => {
            let line = line_or_rollback!();
            Ok(Some(RespValue::Double(Bytes::copy_from_slice(line))))
        }
        b'(' => {
            let line = line_or_rollback!();
            Ok(Some(RespValue::BigNumber(Bytes::copy_from_slice(line))))
        }
        b'#' => {
            let line = line_or_rollback!();
            match line {
                b"t" => Ok(Some(RespValue::Boolean(true))),
                b"f" => Ok(Some(RespValue::Boolean(false))),
                other => Err(Error::protocol(format!(
                    "invalid boolean literal {:?}",
                    String::from_utf8_lossy(other)
                ))),
            }
        }
        b'_' => {
            let line = line_or_rollback!();
            if !line.is_empty() {
                return Err(Error::protocol("null frame carries a payload"));
            }
            Ok(Some(RespValue::Null))
        }
        b'$' => parse_blob(src, pos, start, BlobKind::Bulk),
        b'!' => parse_blob(src, pos, start, BlobKind::Error),
        b'=' => parse_verbatim(src, pos, start),
        b'*' => parse_sequence(src, pos, start, depth, SequenceKind::Array),
        b'~' => parse_sequence(src, pos, start, depth, SequenceKind::Set),
        b'>' => parse_sequence(src, pos, start, depth, SequenceKind::Push),
        b'%' => parse_pairs(src, pos, start, depth).map(|parsed| parsed.map(RespValue::Map)),
        b'|' => {
            let attrs = match parse_pairs(src, pos, start, depth)? {
                Some(attrs) => attrs,
                None => return Ok(None),
            };
            // attributes annotate the frame that follows them
            match parse_value(src, pos, depth)? {
                Some(value) => Ok(Some(RespValue::Attributed {
                    attrs,
                    value: Box::new(value),
                })),
                None => {
                    *pos = start;
                    Ok(None)
                }
            }
        }
        other => Err(Error::protocol(format!(
            "unsupported RESP type byte 0x{other:02x}"
        ))),
    }
}

#[derive(Clone, Copy)]
enum BlobKind {
    Bulk,
    Error,
}

fn parse_blob(
    src: &[u8],
    pos: &mut usize,
    start: usize,
    kind: BlobKind,
) -> Result<Option<RespValue>, Error> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    if line == b"?" {
        return parse_chunked(src, pos, start, kind);
    }
    let len = parse_length(line, "blob")?;
    if len < 0 {
        if len == -1 {
            return Ok(Some(RespValue::Null));
        }
        return Err(Error::protocol("negative blob length"));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    if &src[*pos + len..*pos + len + 2] != b"\r\n" {
        return Err(Error::protocol("blob payload missing CRLF terminator"));
    }
    let payload = Bytes::copy_from_slice(&src[*pos..*pos + len]);
    *pos += len + 2;
    Ok(Some(match kind {
        BlobKind::Bulk => RespValue::BulkString(payload),
        BlobKind::Error => RespValue::BlobError(payload),
    }))
}

// Streamed strings: `$?` followed by `;<len>` chunks, ended by `;0`.
fn parse_chunked(
    src: &[u8],
    pos: &mut usize,
    start: usize,
    kind: BlobKind,
) -> Result<Option<RespValue>, Error> {
    let mut assembled = BytesMut::new();
    loop {
        if *pos >= src.len() {
            *pos = start;
            return Ok(None);
        }
        if src[*pos] != b';' {
            return Err(Error::protocol("chunked string part missing ';' header"));
        }
        *pos += 1;
        let line = match read_line(src, pos)? {
            Some(line) => line,
            None => {
                *pos = start;
                return Ok(None);
            }
        };
        let len = parse_length(line, "chunk")?;
        if len < 0 {
            return Err(Error::protocol("negative chunk length"));
        }
        if len == 0 {
            let payload = assembled.freeze();
            return Ok(Some(match kind {
                BlobKind::Bulk => RespValue::BulkString(payload),
                BlobKind::Error => RespValue::BlobError(payload),
            }));
        }
        let len = len as usize;
        if *pos + len + 2 > src.len() {
            *pos = start;
            return Ok(None);
        }
        assembled.extend_from_slice(&src[*pos..*pos + len]);
        *pos += len + 2;
    }
}

fn parse_verbatim(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>, Error> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "verbatim string")?;
    if len < 4 {
        return Err(Error::protocol("verbatim string shorter than its header"));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    let data = &src[*pos..*pos + len];
    if data[3] != b':' {
        return Err(Error::protocol("verbatim string missing ':' separator"));
    }
    let mut format = [0u8; 3];
    format.copy_from_slice(&data[..3]);
    let payload = Bytes::copy_from_slice(&data[4..]);
    *pos += len + 2;
    Ok(Some(RespValue::VerbatimString {
        format,
        data: payload,
    }))
}

#[derive(Clone, Copy)]
enum SequenceKind {
    Array,
    Set,
    Push,
}

fn parse_sequence(
    src: &[u8],
    pos: &mut usize,
    start: usize,
    depth: usize,
    kind: SequenceKind,
) -> Result<Option<RespValue>, Error> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "aggregate")?;
    if len < 0 {
        if len == -1 {
            return Ok(Some(RespValue::Null));
        }
        return Err(Error::protocol("negative aggregate length"));
    }
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match parse_value(src, pos, depth - 1)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(match kind {
        SequenceKind::Array => RespValue::Array(values),
        SequenceKind::Set => RespValue::Set(values),
        SequenceKind::Push => RespValue::Push(values),
    }))
}

fn parse_pairs(
    src: &[u8],
    pos: &mut usize,
    start: usize,
    depth: usize,
) -> Result<Option<Vec<(RespValue, RespValue)>>, Error> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "map")?;
    if len < 0 {
        return Err(Error::protocol("negative map length"));
    }
    let mut entries = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let key = match parse_value(src, pos, depth - 1)? {
            Some(value) => value,
            None => {
                *pos = start;
                return Ok(None);
            }
        };
        let value = match parse_value(src, pos, depth - 1)? {
            Some(value) => value,
            None => {
                *pos = start;
                return Ok(None);
            }
        };
        entries.push((key, value));
    }
    Ok(Some(entries))
}

fn parse_length(bytes: &[u8], kind: &str) -> Result<isize, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::protocol(format!("{kind} length is not UTF-8")))?;
    text.parse::<isize>()
        .map_err(|err| Error::protocol(format!("invalid {kind} length: {err}")))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, Error> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Ok(Some(line));
        }
        if src[idx] == b'\n' {
            return Err(Error::protocol("bare LF inside frame header"));
        }
        idx += 1;
    }
    Ok(None)
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => write_line(b'+', data, dst),
        RespValue::Error(data) => write_line(b'-', data, dst),
        RespValue::Integer(value) => write_line(b':', value.to_string().as_bytes(), dst),
        RespValue::Double(data) => write_line(b',', data, dst),
        RespValue::BigNumber(data) => write_line(b'(', data, dst),
        RespValue::Boolean(flag) => write_line(b'#', if *flag { b"t" } else { b"f" }, dst),
        RespValue::Null => dst.extend_from_slice(b"_\r\n"),
        RespValue::BulkString(data) => write_blob(b'$', data, dst),
        RespValue::BlobError(data) => write_blob(b'!', data, dst),
        RespValue::VerbatimString { format, data } => {
            dst.extend_from_slice(b"=");
            dst.extend_from_slice((data.len() + 4).to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            dst.extend_from_slice(format);
            dst.extend_from_slice(b":");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Array(values) => write_aggregate(b'*', values, dst),
        RespValue::Set(values) => write_aggregate(b'~', values, dst),
        RespValue::Push(values) => write_aggregate(b'>', values, dst),
        RespValue::Map(entries) => write_pairs(b'%', entries, dst),
        RespValue::Attributed { attrs, value } => {
            write_pairs(b'|', attrs, dst);
            write_value(value, dst);
        }
    }
}

fn write_line(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

fn write_blob(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data.len().to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

fn write_aggregate(prefix: u8, values: &[RespValue], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(values.len().to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
    for value in values {
        write_value(value, dst);
    }
}

fn write_pairs(prefix: u8, entries: &[(RespValue, RespValue)], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(entries.len().to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
    for (key, value) in entries {
        write_value(key, dst);
        write_value(value, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn decode_all(input: &[u8]) -> Result<Option<RespValue>, Error> {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(input);
        codec.decode(&mut buf)
    }

    fn round_trip(value: RespValue) {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(value.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, value);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_the_client_subset() {
        round_trip(RespValue::simple("OK"));
        round_trip(RespValue::error("ERR nope"));
        round_trip(RespValue::Integer(-42));
        round_trip(RespValue::bulk("payload"));
        round_trip(RespValue::BulkString(Bytes::new()));
        round_trip(RespValue::Null);
        round_trip(RespValue::Boolean(true));
        round_trip(RespValue::Double(Bytes::from_static(b"3.25")));
        round_trip(RespValue::BigNumber(Bytes::from_static(b"12345678901234567890")));
        round_trip(RespValue::VerbatimString {
            format: *b"txt",
            data: Bytes::from_static(b"hello"),
        });
        round_trip(RespValue::Array(vec![
            RespValue::bulk("a"),
            RespValue::Integer(1),
            RespValue::Null,
        ]));
        round_trip(RespValue::Set(vec![RespValue::bulk("member")]));
        round_trip(RespValue::Map(vec![(
            RespValue::simple("mode"),
            RespValue::bulk("standalone"),
        )]));
        round_trip(RespValue::Push(vec![
            RespValue::bulk("message"),
            RespValue::bulk("ch"),
            RespValue::bulk("body"),
        ]));
        round_trip(RespValue::Map(Vec::new()));
    }

    #[test]
    fn incomplete_frames_consume_nothing() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nECHO\r\n$5\r\nhe"[..]);
        let before = buf.len();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);
        buf.extend_from_slice(b"llo\r\n");
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![RespValue::bulk("ECHO"), RespValue::bulk("hello")])
        );
    }

    #[test]
    fn null_bulk_and_empty_bulk_differ() {
        assert_eq!(decode_all(b"$-1\r\n").unwrap().unwrap(), RespValue::Null);
        assert_eq!(
            decode_all(b"$0\r\n\r\n").unwrap().unwrap(),
            RespValue::BulkString(Bytes::new())
        );
    }

    #[test]
    fn empty_map_decodes_as_empty_map() {
        assert_eq!(
            decode_all(b"%0\r\n").unwrap().unwrap(),
            RespValue::Map(Vec::new())
        );
    }

    #[test]
    fn attributes_attach_to_next_value() {
        let decoded = decode_all(b"|1\r\n+key-popularity\r\n,90.0\r\n$5\r\nhello\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(decoded, RespValue::bulk("hello"));
        let attrs = decoded.attributes().unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].0, RespValue::simple("key-popularity"));
    }

    #[test]
    fn chunked_string_assembles_on_zero_chunk() {
        let decoded = decode_all(b"$?\r\n;4\r\nHell\r\n;5\r\no wor\r\n;2\r\nld\r\n;0\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(decoded, RespValue::bulk("Hello world"));
    }

    #[test]
    fn depth_guard_rejects_deep_nesting() {
        let mut input = Vec::new();
        for _ in 0..10 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(
            decode_all(&input),
            Err(Error::Protocol(_))
        ));
    }

    // cases lifted from the upstream protocol test suite
    #[test]
    fn negative_multibulk_length_is_fatal() {
        assert!(matches!(decode_all(b"*-10\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn non_numeric_bulk_length_is_fatal() {
        assert!(matches!(
            decode_all(b"$blabla\r\n"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn encode_command_uses_flat_bulk_form() {
        let mut buf = BytesMut::new();
        encode_command(
            &[Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")],
            &mut buf,
        );
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn pipelined_frames_decode_one_at_a_time() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"+OK\r\n:7\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            RespValue::simple("OK")
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            RespValue::Integer(7)
        );
        assert!(buf.is_empty());
    }
}
