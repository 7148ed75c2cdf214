//! FastCGI wire format: record framing and the params name/value codec.
//!
//! Every record is an 8-byte header (version, type, request id,
//! content length, padding length, reserved) followed by content and
//! padding. Content larger than a record carries is split; payloads are
//! padded to a multiple of 8.

pub(crate) const FCGI_VERSION: u8 = 1;
pub(crate) const HEADER_LEN: usize = 8;

/// Largest content one record can carry.
const MAX_CONTENT: usize = 0xFFFF;
const PAD_UNIT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    StdIn = 5,
    StdOut = 6,
    StdErr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub(crate) fn from_u8(value: u8) -> Option<RecordType> {
        Some(match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::StdIn,
            6 => RecordType::StdOut,
            7 => RecordType::StdErr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            _ => return None,
        })
    }
}

// BeginRequest body.
pub(crate) const ROLE_RESPONDER: u16 = 1;
pub(crate) const FLAG_KEEP_CONN: u8 = 1;

// EndRequest protocol statuses.
pub(crate) const PROTO_REQUEST_COMPLETE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RecordHeader {
    pub(crate) version: u8,
    pub(crate) record_type: u8,
    pub(crate) request_id: u16,
    pub(crate) content_length: u16,
    pub(crate) padding_length: u8,
}

impl RecordHeader {
    pub(crate) fn parse(bytes: &[u8]) -> Option<RecordHeader> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(RecordHeader {
            version: bytes[0],
            record_type: bytes[1],
            request_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            content_length: u16::from_be_bytes([bytes[4], bytes[5]]),
            padding_length: bytes[6],
        })
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }

    /// Header plus content plus padding.
    pub(crate) fn total_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// Appends `payload` as one or more records of `record_type`. An empty
/// payload becomes a single empty record (the end-of-stream marker for
/// the stream record types).
pub(crate) fn encode_record(
    out: &mut Vec<u8>,
    record_type: RecordType,
    request_id: u16,
    payload: &[u8],
) {
    const PADDING: [u8; PAD_UNIT] = [0; PAD_UNIT];

    if payload.is_empty() {
        let header = RecordHeader {
            version: FCGI_VERSION,
            record_type: record_type as u8,
            request_id,
            content_length: 0,
            padding_length: 0,
        };
        out.extend_from_slice(&header.encode());
        return;
    }

    for chunk in payload.chunks(MAX_CONTENT) {
        let padding = match chunk.len() % PAD_UNIT {
            0 => 0,
            rem => PAD_UNIT - rem,
        };
        let header = RecordHeader {
            version: FCGI_VERSION,
            record_type: record_type as u8,
            request_id,
            content_length: chunk.len() as u16,
            padding_length: padding as u8,
        };
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(chunk);
        out.extend_from_slice(&PADDING[..padding]);
    }
}

pub(crate) fn encode_begin_request(out: &mut Vec<u8>, request_id: u16, keep_conn: bool) {
    let role = ROLE_RESPONDER.to_be_bytes();
    let body = [
        role[0],
        role[1],
        if keep_conn { FLAG_KEEP_CONN } else { 0 },
        0,
        0,
        0,
        0,
        0,
    ];
    encode_record(out, RecordType::BeginRequest, request_id, &body);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct EndRequestBody {
    pub(crate) app_status: u32,
    pub(crate) protocol_status: u8,
}

impl EndRequestBody {
    pub(crate) fn parse(content: &[u8]) -> Option<EndRequestBody> {
        if content.len() < 8 {
            return None;
        }
        Some(EndRequestBody {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> [u8; 8] {
        let status = self.app_status.to_be_bytes();
        [
            status[0],
            status[1],
            status[2],
            status[3],
            self.protocol_status,
            0,
            0,
            0,
        ]
    }
}

/// CGI environment writer: length-prefixed name/value pairs. Lengths
/// under 128 take one byte; longer ones take four with the high bit set.
#[derive(Default)]
pub(crate) struct ParamsWriter {
    buf: Vec<u8>,
}

impl ParamsWriter {
    pub(crate) fn new() -> Self {
        ParamsWriter::default()
    }

    pub(crate) fn encode(&mut self, name: &[u8], value: &[u8]) {
        Self::encode_len(&mut self.buf, name.len());
        Self::encode_len(&mut self.buf, value.len());
        self.buf.extend_from_slice(name);
        self.buf.extend_from_slice(value);
    }

    pub(crate) fn output(self) -> Vec<u8> {
        self.buf
    }

    fn encode_len(out: &mut Vec<u8>, len: usize) {
        if len < 128 {
            out.push(len as u8);
        } else {
            out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
        }
    }
}

/// Parses a complete params stream back into pairs.
pub(crate) fn parse_params(mut data: &[u8]) -> Option<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let (name_len, rest) = parse_len(data)?;
        let (value_len, rest) = parse_len(rest)?;
        if rest.len() < name_len + value_len {
            return None;
        }
        let (name, rest) = rest.split_at(name_len);
        let (value, rest) = rest.split_at(value_len);
        pairs.push((name.to_vec(), value.to_vec()));
        data = rest;
    }
    Some(pairs)
}

fn parse_len(data: &[u8]) -> Option<(usize, &[u8])> {
    let first = *data.first()?;
    if first < 128 {
        Some((first as usize, &data[1..]))
    } else {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0] & 0x7F, data[1], data[2], data[3]]);
        Some((len as usize, &data[4..]))
    }
}

#[cfg(test)]
mod header_tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = RecordHeader {
            version: FCGI_VERSION,
            record_type: RecordType::StdOut as u8,
            request_id: 0x0102,
            content_length: 0x1234,
            padding_length: 4,
        };

        let wire = header.encode();
        assert_eq!(wire, [1, 6, 1, 2, 0x12, 0x34, 4, 0]);
        assert_eq!(RecordHeader::parse(&wire), Some(header));
        assert_eq!(header.total_len(), 8 + 0x1234 + 4);

        assert_eq!(RecordHeader::parse(&wire[..7]), None);
    }

    #[test]
    fn record_types() {
        for (value, expected) in [
            (1, RecordType::BeginRequest),
            (2, RecordType::AbortRequest),
            (3, RecordType::EndRequest),
            (4, RecordType::Params),
            (5, RecordType::StdIn),
            (6, RecordType::StdOut),
            (7, RecordType::StdErr),
            (9, RecordType::GetValues),
            (10, RecordType::GetValuesResult),
            (11, RecordType::UnknownType),
        ] {
            assert_eq!(RecordType::from_u8(value), Some(expected));
            assert_eq!(expected as u8, value);
        }
        assert_eq!(RecordType::from_u8(200), None);
    }
}

#[cfg(test)]
mod encode_tests {
    use super::*;

    #[test]
    fn empty_payload_is_end_of_stream_marker() {
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::StdIn, 7, b"");
        assert_eq!(out, [1, 5, 0, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn payload_padded_to_eight() {
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::StdOut, 1, b"hello");

        let header = RecordHeader::parse(&out).unwrap();
        assert_eq!(header.content_length, 5);
        assert_eq!(header.padding_length, 3);
        assert_eq!(out.len(), header.total_len());
        assert_eq!(&out[8..13], b"hello");
        assert_eq!(&out[13..], [0, 0, 0]);
    }

    #[test]
    fn oversized_payload_splits() {
        let payload = vec![b'x'; MAX_CONTENT + 100];
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::StdIn, 3, &payload);

        let first = RecordHeader::parse(&out).unwrap();
        assert_eq!(first.content_length as usize, MAX_CONTENT);
        let second = RecordHeader::parse(&out[first.total_len()..]).unwrap();
        assert_eq!(second.content_length, 100);
        assert_eq!(second.padding_length, 4);
    }

    #[test]
    fn begin_request_body() {
        let mut out = Vec::new();
        encode_begin_request(&mut out, 9, true);
        assert_eq!(out, [1, 1, 0, 9, 0, 8, 0, 0, 0, 1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn end_request_round_trip() {
        let body = EndRequestBody {
            app_status: 77,
            protocol_status: PROTO_REQUEST_COMPLETE,
        };
        assert_eq!(EndRequestBody::parse(&body.encode()), Some(body));
        assert_eq!(EndRequestBody::parse(&[0, 0]), None);
    }
}

#[cfg(test)]
mod params_tests {
    use super::*;

    #[test]
    fn encode_parse_identity() {
        let long_value = "v".repeat(300);
        let long_name = "N".repeat(200);
        #[rustfmt::skip]
        let pairs: Vec<(&[u8], &[u8])> = vec![
            (b"REQUEST_METHOD", b"GET"),
            (b"QUERY_STRING",   b""),
            (b"HTTP_X_LONG",    long_value.as_bytes()),
            (long_name.as_bytes(), b"short"),
            (b"", b""),
        ];

        let mut writer = ParamsWriter::new();
        for (name, value) in &pairs {
            writer.encode(name, value);
        }

        let parsed = parse_params(&writer.output()).unwrap();
        assert_eq!(parsed.len(), pairs.len());
        for ((name, value), (parsed_name, parsed_value)) in pairs.iter().zip(&parsed) {
            assert_eq!(parsed_name, name);
            assert_eq!(parsed_value, value);
        }
    }

    #[test]
    fn long_length_uses_high_bit() {
        let mut writer = ParamsWriter::new();
        writer.encode(b"K", &vec![b'v'; 128]);
        let out = writer.output();

        assert_eq!(out[0], 1);
        assert_eq!(out[1] & 0x80, 0x80);
        assert_eq!(
            u32::from_be_bytes([out[1] & 0x7F, out[2], out[3], out[4]]),
            128
        );
    }

    #[test]
    fn truncated_stream_rejected() {
        let mut writer = ParamsWriter::new();
        writer.encode(b"NAME", b"VALUE");
        let out = writer.output();
        assert!(parse_params(&out[..out.len() - 1]).is_none());
    }
}
