use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Number of bytes left untouched at the front of an outgoing packet
/// buffer so the transport can stamp the SSH framing header
/// (`uint32 packet_length | byte padding_length`) in place. Application
/// payload begins at this offset.
pub const PACKET_HEADER_LEN: usize = 5;

/// How [`Buffer::ensure_capacity`] rounds a required size up to an
/// allocation size. Growing never allocates less than what was asked for;
/// it may overshoot per the selected policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GrowthPolicy {
    /// Allocate the required size plus a fixed slack.
    FixedDelta(usize),
    /// Round the required size up to the next power of two.
    Doubling,
}

impl GrowthPolicy {
    fn grow(self, required: usize) -> usize {
        match self {
            GrowthPolicy::FixedDelta(delta) => required + delta,
            GrowthPolicy::Doubling => required.next_power_of_two(),
        }
    }
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        GrowthPolicy::FixedDelta(8)
    }
}

/// A mutable byte sequence with independent read and write cursors,
/// encoding the SSH wire types of RFC 4251 §5: `byte`, `boolean`,
/// `uint32`, `uint64`, `string`, `mpint` and `name-list`.
///
/// Invariant: `0 <= rpos <= wpos <= storage`. Every `get_*` checks it is
/// not reading past `wpos` and fails with [`Error::Encoding`] otherwise.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
    policy: GrowthPolicy,
}

impl Buffer {
    /// An empty buffer with the default growth policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer backed by at least `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Buffer {
            data: vec![0; cap],
            ..Self::default()
        }
    }

    /// Wrap already-encoded bytes for reading.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let wpos = data.len();
        Buffer {
            data,
            rpos: 0,
            wpos,
            policy: GrowthPolicy::default(),
        }
    }

    /// Start an outgoing packet: the first [`PACKET_HEADER_LEN`] bytes are
    /// reserved for the transport's framing header and `cmd` becomes the
    /// first payload byte.
    pub fn for_packet(cmd: u8) -> Self {
        let mut buf = Self::with_capacity(64);
        buf.wpos = PACKET_HEADER_LEN;
        buf.rpos = PACKET_HEADER_LEN;
        buf.put_u8(cmd);
        buf
    }

    /// Replace the growth policy used by [`ensure_capacity`](Self::ensure_capacity).
    pub fn set_growth_policy(&mut self, policy: GrowthPolicy) {
        self.policy = policy;
    }

    /// The read cursor.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Move the read cursor. Positions past `wpos` are clamped to it.
    pub fn set_rpos(&mut self, rpos: usize) {
        self.rpos = rpos.min(self.wpos);
    }

    /// The write cursor.
    pub fn wpos(&self) -> usize {
        self.wpos
    }

    /// Move the write cursor, growing the backing store if needed.
    pub fn set_wpos(&mut self, wpos: usize) {
        if wpos > self.data.len() {
            let target = self.policy.grow(wpos);
            self.data.resize(target, 0);
        }
        self.wpos = wpos;
        self.rpos = self.rpos.min(self.wpos);
    }

    /// Bytes written but not yet read.
    pub fn available(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Grow the backing store so that at least `n` more bytes can be
    /// written at `wpos`.
    pub fn ensure_capacity(&mut self, n: usize) {
        let required = self.wpos + n;
        if required > self.data.len() {
            let target = self.policy.grow(required);
            debug_assert!(target >= required);
            self.data.resize(target, 0);
        }
    }

    /// Shift unread bytes to offset 0, making room at the tail.
    pub fn compact(&mut self) {
        if self.rpos > 0 {
            self.data.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }
    }

    /// Discard all content and rewind both cursors.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    /// Everything written so far, including any reserved packet header.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.wpos]
    }

    /// The unread portion.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.rpos..self.wpos]
    }

    fn check_read(&self, n: usize) -> Result<()> {
        if self.available() < n {
            return Err(Error::Encoding("read past end of buffer"));
        }
        Ok(())
    }

    // -- writers ---------------------------------------------------------

    /// Append one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.ensure_capacity(1);
        self.data[self.wpos] = v;
        self.wpos += 1;
    }

    /// Append a boolean as one byte (0 or 1).
    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Append a big-endian `uint32`.
    pub fn put_u32(&mut self, v: u32) {
        self.ensure_capacity(4);
        BigEndian::write_u32(&mut self.data[self.wpos..], v);
        self.wpos += 4;
    }

    /// Append a big-endian `uint64`.
    pub fn put_u64(&mut self, v: u64) {
        self.ensure_capacity(8);
        BigEndian::write_u64(&mut self.data[self.wpos..], v);
        self.wpos += 8;
    }

    /// Append raw bytes without a length prefix.
    pub fn put_raw(&mut self, v: &[u8]) {
        self.ensure_capacity(v.len());
        self.data[self.wpos..self.wpos + v.len()].copy_from_slice(v);
        self.wpos += v.len();
    }

    /// Append an SSH `string`: `uint32` length followed by the bytes.
    pub fn put_string(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.put_raw(v);
    }

    /// Append UTF-8 text as an SSH `string`.
    pub fn put_str(&mut self, v: &str) {
        self.put_string(v.as_bytes());
    }

    /// Append a comma-joined `name-list`.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined);
    }

    /// Append a non-negative `mpint` from an unsigned big-endian
    /// magnitude: leading zeros are stripped and a 0x00 lead byte is
    /// inserted when the top bit is set, preserving the sign.
    pub fn put_mpint(&mut self, magnitude: &[u8]) {
        let stripped = match magnitude.iter().position(|&b| b != 0) {
            Some(i) => &magnitude[i..],
            None => &[],
        };
        if stripped.is_empty() {
            self.put_u32(0);
        } else if stripped[0] & 0x80 != 0 {
            self.put_u32(stripped.len() as u32 + 1);
            self.put_u8(0);
            self.put_raw(stripped);
        } else {
            self.put_string(stripped);
        }
    }

    /// Append a signed `mpint` in minimal two's-complement form:
    /// zero encodes as the empty string, positive values with a top bit
    /// set gain a 0x00 lead byte, negative values a 0xFF one.
    pub fn put_mpint_i64(&mut self, v: i64) {
        if v == 0 {
            self.put_u32(0);
            return;
        }
        let bytes = v.to_be_bytes();
        let mut start = 0;
        while start < 7 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.put_string(&bytes[start..]);
    }

    /// Append a public-key blob as an SSH `string`. The blob itself is
    /// opaque to this layer.
    pub fn put_public_key(&mut self, blob: &[u8]) {
        self.put_string(blob);
    }

    // -- readers ---------------------------------------------------------

    /// Read one byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        self.check_read(1)?;
        let v = self.data[self.rpos];
        self.rpos += 1;
        Ok(v)
    }

    /// Read a boolean; any non-zero byte is true.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a big-endian `uint32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.check_read(4)?;
        let v = BigEndian::read_u32(&self.data[self.rpos..]);
        self.rpos += 4;
        Ok(v)
    }

    /// Read a big-endian `uint64`.
    pub fn get_u64(&mut self) -> Result<u64> {
        self.check_read(8)?;
        let v = BigEndian::read_u64(&self.data[self.rpos..]);
        self.rpos += 8;
        Ok(v)
    }

    /// Read `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check_read(n)?;
        let v = self.data[self.rpos..self.rpos + n].to_vec();
        self.rpos += n;
        Ok(v)
    }

    /// Read an SSH `string` as bytes.
    pub fn get_string(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > self.available() {
            return Err(Error::Encoding("string length exceeds available bytes"));
        }
        self.get_raw(len)
    }

    /// Read an SSH `string` as UTF-8 text.
    pub fn get_str(&mut self) -> Result<String> {
        String::from_utf8(self.get_string()?).map_err(|_| Error::Encoding("string is not utf-8"))
    }

    /// Read a comma-joined `name-list`.
    pub fn get_name_list(&mut self) -> Result<Vec<String>> {
        let joined = self.get_str()?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(str::to_owned).collect())
    }

    /// Read an `mpint` as its raw two's-complement bytes (possibly with a
    /// sign-preserving lead byte).
    pub fn get_mpint(&mut self) -> Result<Vec<u8>> {
        self.get_string()
    }

    /// Read a signed `mpint` that fits an `i64`.
    pub fn get_mpint_i64(&mut self) -> Result<i64> {
        let bytes = self.get_string()?;
        if bytes.is_empty() {
            return Ok(0);
        }
        if bytes.len() > 8 {
            return Err(Error::Encoding("mpint too large for i64"));
        }
        let negative = bytes[0] & 0x80 != 0;
        let mut out = [if negative { 0xFF } else { 0x00 }; 8];
        out[8 - bytes.len()..].copy_from_slice(&bytes);
        Ok(i64::from_be_bytes(out))
    }

    /// Read a public-key blob.
    pub fn get_public_key(&mut self) -> Result<Vec<u8>> {
        self.get_string()
    }
}

impl From<&[u8]> for Buffer {
    fn from(v: &[u8]) -> Self {
        Buffer::from_vec(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        let mut buf = Buffer::new();
        buf.put_u8(0x7f);
        buf.put_bool(true);
        buf.put_bool(false);
        buf.put_u32(0xdead_beef);
        buf.put_u64(0x0123_4567_89ab_cdef);
        assert_eq!(buf.get_u8().unwrap(), 0x7f);
        assert!(buf.get_bool().unwrap());
        assert!(!buf.get_bool().unwrap());
        assert_eq!(buf.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(buf.get_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn string_round_trips() {
        let mut buf = Buffer::new();
        buf.put_string(b"");
        buf.put_str("hello");
        buf.put_name_list(&["publickey", "password"]);
        buf.put_name_list::<&str>(&[]);
        assert_eq!(buf.get_string().unwrap(), b"");
        assert_eq!(buf.get_str().unwrap(), "hello");
        assert_eq!(buf.get_name_list().unwrap(), vec!["publickey", "password"]);
        assert_eq!(buf.get_name_list().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn mpint_magnitude() {
        let mut buf = Buffer::new();
        // Top bit set: must gain a 0x00 lead byte.
        buf.put_mpint(&[0xff, 0x01]);
        assert_eq!(buf.unread(), [0, 0, 0, 3, 0x00, 0xff, 0x01]);
        assert_eq!(buf.get_mpint().unwrap(), vec![0x00, 0xff, 0x01]);

        let mut buf = Buffer::new();
        // Leading zeros are stripped.
        buf.put_mpint(&[0x00, 0x00, 0x12]);
        assert_eq!(buf.get_mpint().unwrap(), vec![0x12]);

        let mut buf = Buffer::new();
        buf.put_mpint(&[0x00, 0x00]);
        assert_eq!(buf.get_mpint().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn mpint_signed_round_trips() {
        for v in [0i64, 1, -1, 127, 128, 255, 256, -128, -129, -256, i64::MAX, i64::MIN] {
            let mut buf = Buffer::new();
            buf.put_mpint_i64(v);
            assert_eq!(buf.get_mpint_i64().unwrap(), v, "value {}", v);
        }

        // RFC 4251 examples: 0 is empty, -1 is a single 0xFF byte, and a
        // positive value with the top bit set gains a 0x00 lead byte.
        let mut buf = Buffer::new();
        buf.put_mpint_i64(0);
        assert_eq!(buf.unread(), [0, 0, 0, 0]);

        let mut buf = Buffer::new();
        buf.put_mpint_i64(-1);
        assert_eq!(buf.unread(), [0, 0, 0, 1, 0xff]);

        let mut buf = Buffer::new();
        buf.put_mpint_i64(128);
        assert_eq!(buf.unread(), [0, 0, 0, 2, 0x00, 0x80]);

        let mut buf = Buffer::new();
        buf.put_mpint_i64(-256);
        assert_eq!(buf.unread(), [0, 0, 0, 2, 0xff, 0x00]);
    }

    #[test]
    fn underrun_is_an_error() {
        let mut buf = Buffer::new();
        buf.put_u8(1);
        assert!(matches!(buf.get_u32(), Err(Error::Encoding(_))));

        // A declared string length past wpos must not read garbage.
        let mut buf = Buffer::new();
        buf.put_u32(100);
        buf.put_raw(b"short");
        assert!(matches!(buf.get_string(), Err(Error::Encoding(_))));
    }

    #[test]
    fn compact_shifts_unread_bytes() {
        let mut buf = Buffer::new();
        buf.put_str("first");
        buf.put_str("second");
        let _ = buf.get_str().unwrap();
        let before = buf.available();
        buf.compact();
        assert_eq!(buf.rpos(), 0);
        assert_eq!(buf.available(), before);
        assert_eq!(buf.get_str().unwrap(), "second");
    }

    #[test]
    fn packet_reserves_header() {
        let buf = Buffer::for_packet(94);
        assert_eq!(buf.wpos(), PACKET_HEADER_LEN + 1);
        assert_eq!(buf.written()[PACKET_HEADER_LEN], 94);
    }

    #[test]
    fn growth_never_under_allocates() {
        let mut buf = Buffer::with_capacity(4);
        buf.set_growth_policy(GrowthPolicy::Doubling);
        buf.put_raw(&[0u8; 100]);
        assert_eq!(buf.available(), 100);

        let mut buf = Buffer::new();
        buf.set_growth_policy(GrowthPolicy::FixedDelta(1));
        buf.put_u64(u64::MAX);
        assert_eq!(buf.get_u64().unwrap(), u64::MAX);
    }
}
