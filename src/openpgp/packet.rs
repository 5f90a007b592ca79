use super::CodecError;

pub const TAG_SIGNATURE: u8 = 2;
pub const TAG_SECRET_KEY: u8 = 5;
pub const TAG_PUBLIC_KEY: u8 = 6;
pub const TAG_SECRET_SUBKEY: u8 = 7;
pub const TAG_USER_ID: u8 = 13;
pub const TAG_PUBLIC_SUBKEY: u8 = 14;

/// One packet: its tag and its body, framing removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tag: u8,
    pub body: Vec<u8>,
}

/// Append a packet with a new format header.
pub fn write_packet(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(0xC0 | tag);
    let len = body.len();
    if len < 192 {
        out.push(len as u8);
    } else if len < 8384 {
        let len = len - 192;
        out.push(((len >> 8) as u8) + 192);
        out.push(len as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(body);
}

/// A cursor over packet data.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let out = self.data.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a multiprecision integer, returning its big endian bytes.
    pub fn mpi(&mut self) -> Result<&'a [u8], CodecError> {
        let bits = self.u16()? as usize;
        self.take((bits + 7) / 8)
    }
}

/// Append a multiprecision integer.
pub fn write_mpi(out: &mut Vec<u8>, bytes: &[u8]) {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let bytes = &bytes[start..];
    let bits = match bytes.first() {
        Some(first) => (bytes.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
        None => 0,
    };
    out.extend_from_slice(&(bits as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Split binary data into packets, accepting both header formats.
pub fn parse_packets(data: &[u8]) -> Result<Vec<Packet>, CodecError> {
    let mut reader = Reader::new(data);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let ctb = reader.u8()?;
        if ctb & 0x80 == 0 {
            return Err(CodecError::Malformed(format!("bad packet header {ctb:#04x}")));
        }
        let (tag, len) = if ctb & 0x40 != 0 {
            let tag = ctb & 0x3F;
            let first = reader.u8()? as usize;
            let len = match first {
                0..=191 => first,
                192..=223 => ((first - 192) << 8) + reader.u8()? as usize + 192,
                255 => reader.u32()? as usize,
                _ => return Err(CodecError::Unsupported("partial body lengths".to_string())),
            };
            (tag, len)
        } else {
            let tag = (ctb >> 2) & 0x0F;
            let len = match ctb & 0x03 {
                0 => reader.u8()? as usize,
                1 => reader.u16()? as usize,
                2 => reader.u32()? as usize,
                _ => reader.rest().len(),
            };
            (tag, len)
        };
        let body = reader.take(len)?.to_vec();
        out.push(Packet { tag, body });
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_lengths() {
        for len in [0usize, 191, 192, 8383, 8384, 70000] {
            let body = vec![0xAB; len];
            let mut out = Vec::new();
            write_packet(&mut out, TAG_USER_ID, &body);
            let packets = parse_packets(&out).unwrap();
            assert_eq!(packets, vec![Packet { tag: TAG_USER_ID, body }]);
        }
    }

    #[test]
    fn test_old_format_header() {
        // Old format, tag 13, one octet length.
        let data = [0x80 | (13 << 2), 3, b'a', b'b', b'c'];
        let packets = parse_packets(&data).unwrap();
        assert_eq!(packets[0].tag, 13);
        assert_eq!(packets[0].body, b"abc");
    }

    #[test]
    fn test_truncated() {
        let data = [0xC0 | TAG_USER_ID, 10, b'a'];
        assert!(matches!(parse_packets(&data), Err(CodecError::Truncated)));
    }

    #[test]
    fn test_mpi() {
        let mut out = Vec::new();
        write_mpi(&mut out, &[0, 0, 0x01, 0xFF]);
        assert_eq!(out, vec![0, 9, 0x01, 0xFF]);
        let mut reader = Reader::new(&out);
        assert_eq!(reader.mpi().unwrap(), &[0x01, 0xFF]);
        assert!(reader.is_empty());
    }
}
