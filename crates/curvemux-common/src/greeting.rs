//! Handshake greeting parsing and READY detection.
//!
//! A secured session opens with a fixed 64-byte greeting:
//!
//! ```text
//! offset  0  signature   10 bytes  0xFF, 8 x padding, 0x7F
//! offset 10  version      2 bytes  major, minor
//! offset 12  mechanism   20 bytes  ASCII, NUL padded ("NULL", "CURVE", ...)
//! offset 32  as-server    1 byte
//! offset 33  filler      31 bytes
//! ```
//!
//! Some peers emit it in one frame, others as an 11-byte head (signature and
//! major version) followed by a 53-byte tail. [`GreetingDecoder`] accepts
//! both. Decoding never fails loudly: anything it cannot classify is
//! [`Probe::Undetermined`].

use std::fmt;

/// Signature length.
pub const SIGNATURE_LEN: usize = 10;
/// Version field length (major, minor).
pub const VERSION_LEN: usize = 2;
/// Mechanism name field length.
pub const MECHANISM_LEN: usize = 20;
/// Trailing filler length.
pub const FILLER_LEN: usize = 31;
/// Total greeting length.
pub const GREETING_LEN: usize = SIGNATURE_LEN + VERSION_LEN + MECHANISM_LEN + 1 + FILLER_LEN;
/// Length of the first fragment of a split greeting.
pub const SPLIT_HEAD_LEN: usize = SIGNATURE_LEN + 1;
/// Length of the second fragment of a split greeting.
pub const SPLIT_TAIL_LEN: usize = GREETING_LEN - SPLIT_HEAD_LEN;

const SIGNATURE_FIRST: u8 = 0xFF;
const SIGNATURE_LAST: u8 = 0x7F;
const MECHANISM_OFFSET: usize = SIGNATURE_LEN + VERSION_LEN;
const AS_SERVER_OFFSET: usize = MECHANISM_OFFSET + MECHANISM_LEN;

/// Version advertised by [`Greeting::new`].
pub const DEFAULT_VERSION: (u8, u8) = (3, 0);

/// Command name the server side sends once the secured session is up.
pub const READY_TOKEN: &[u8] = b"READY";

/// Offsets at which [`ReadyProbe::default`] looks for [`READY_TOKEN`].
pub const DEFAULT_READY_OFFSETS: [usize; 2] = [0, 3];

const COMMAND_FLAG: u8 = 0x04;

/// Security mechanism named in a greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    /// No security.
    Null,
    /// Public-key authentication and encryption.
    Curve,
    /// Any other advertised mechanism.
    Other(String),
}

impl Mechanism {
    /// Decodes a NUL-padded mechanism field.
    #[must_use]
    pub fn from_field(field: &[u8]) -> Self {
        let end = field
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |last| last + 1);
        match &field[..end] {
            b"NULL" => Self::Null,
            b"CURVE" => Self::Curve,
            other => Self::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    /// Mechanism name as advertised.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Null => "NULL",
            Self::Curve => "CURVE",
            Self::Other(name) => name,
        }
    }

    /// NUL-padded wire field. Names longer than the field are truncated.
    #[must_use]
    pub fn to_field(&self) -> [u8; MECHANISM_LEN] {
        let mut field = [0u8; MECHANISM_LEN];
        let name = self.as_str().as_bytes();
        let n = name.len().min(MECHANISM_LEN);
        field[..n].copy_from_slice(&name[..n]);
        field
    }

    /// Returns `true` for [`Mechanism::Curve`].
    #[must_use]
    pub fn is_curve(&self) -> bool {
        matches!(self, Self::Curve)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded handshake greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Major protocol version.
    pub major: u8,
    /// Minor protocol version.
    pub minor: u8,
    /// Advertised security mechanism.
    pub mechanism: Mechanism,
    /// Whether the sender acts as the security server.
    pub as_server: bool,
}

fn has_signature(buf: &[u8]) -> bool {
    buf.len() >= SIGNATURE_LEN
        && buf[0] == SIGNATURE_FIRST
        && buf[SIGNATURE_LEN - 1] == SIGNATURE_LAST
}

impl Greeting {
    /// Greeting at [`DEFAULT_VERSION`].
    #[must_use]
    pub fn new(mechanism: Mechanism, as_server: bool) -> Self {
        Self {
            major: DEFAULT_VERSION.0,
            minor: DEFAULT_VERSION.1,
            mechanism,
            as_server,
        }
    }

    /// Decodes a greeting sent as a single frame.
    ///
    /// Returns `None` if `buf` is shorter than [`GREETING_LEN`] or does not
    /// start with a valid signature. Bytes past the greeting are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use curvemux_common::greeting::{Greeting, Mechanism};
    /// let bytes = Greeting::new(Mechanism::Curve, true).encode();
    /// let parsed = Greeting::parse(&bytes).unwrap();
    /// assert!(parsed.mechanism.is_curve());
    /// ```
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < GREETING_LEN || !has_signature(buf) {
            return None;
        }
        Self::from_tail(buf[SIGNATURE_LEN], &buf[SPLIT_HEAD_LEN..])
    }

    /// Decodes the 53-byte tail of a split greeting, given the major version
    /// carried by its head.
    fn from_tail(major: u8, tail: &[u8]) -> Option<Self> {
        if tail.len() < SPLIT_TAIL_LEN {
            return None;
        }
        let mechanism_start = MECHANISM_OFFSET - SPLIT_HEAD_LEN;
        let as_server_at = AS_SERVER_OFFSET - SPLIT_HEAD_LEN;
        Some(Self {
            major,
            minor: tail[0],
            mechanism: Mechanism::from_field(&tail[mechanism_start..as_server_at]),
            as_server: tail[as_server_at] != 0,
        })
    }

    /// Encodes the greeting as one 64-byte frame.
    #[must_use]
    pub fn encode(&self) -> [u8; GREETING_LEN] {
        let mut buf = [0u8; GREETING_LEN];
        buf[0] = SIGNATURE_FIRST;
        buf[SIGNATURE_LEN - 1] = SIGNATURE_LAST;
        buf[SIGNATURE_LEN] = self.major;
        buf[SIGNATURE_LEN + 1] = self.minor;
        buf[MECHANISM_OFFSET..AS_SERVER_OFFSET].copy_from_slice(&self.mechanism.to_field());
        buf[AS_SERVER_OFFSET] = u8::from(self.as_server);
        buf
    }

    /// Encodes the greeting as an 11-byte head and a 53-byte tail.
    #[must_use]
    pub fn encode_split(&self) -> ([u8; SPLIT_HEAD_LEN], [u8; SPLIT_TAIL_LEN]) {
        let full = self.encode();
        let mut head = [0u8; SPLIT_HEAD_LEN];
        let mut tail = [0u8; SPLIT_TAIL_LEN];
        head.copy_from_slice(&full[..SPLIT_HEAD_LEN]);
        tail.copy_from_slice(&full[SPLIT_HEAD_LEN..]);
        (head, tail)
    }
}

/// Outcome of feeding one frame to a [`GreetingDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Not enough recognizable data yet.
    Undetermined,
    /// A full greeting was decoded.
    Decided(Greeting),
}

/// Incremental greeting decoder fed one frame at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GreetingDecoder {
    split_major: Option<u8>,
}

impl GreetingDecoder {
    /// Decoder with no data seen yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next frame.
    ///
    /// A frame holding a whole greeting decides at once. An 11-byte frame
    /// with a valid signature is kept as the head of a split greeting and a
    /// later frame of at least 53 bytes completes it.
    pub fn feed(&mut self, frame: &[u8]) -> Probe {
        if let Some(greeting) = Greeting::parse(frame) {
            self.split_major = None;
            return Probe::Decided(greeting);
        }
        if frame.len() == SPLIT_HEAD_LEN && has_signature(frame) {
            self.split_major = Some(frame[SIGNATURE_LEN]);
            return Probe::Undetermined;
        }
        if let Some(major) = self.split_major {
            if let Some(greeting) = Greeting::from_tail(major, frame) {
                self.split_major = None;
                return Probe::Decided(greeting);
            }
        }
        Probe::Undetermined
    }

    /// Returns `true` after a split head was seen and before its tail.
    #[must_use]
    pub fn awaiting_tail(&self) -> bool {
        self.split_major.is_some()
    }
}

/// Looks for the READY command in a single-frame message.
///
/// Where the token sits depends on how the peer's command framing reaches
/// the relay, so the probe checks every configured offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyProbe {
    offsets: Vec<usize>,
}

impl ReadyProbe {
    /// Probe checking the given offsets.
    #[must_use]
    pub fn new(offsets: impl Into<Vec<usize>>) -> Self {
        Self {
            offsets: offsets.into(),
        }
    }

    /// Offsets checked by this probe.
    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Returns `true` if `frame` is the only frame of its message and holds
    /// [`READY_TOKEN`] at one of the offsets.
    #[must_use]
    pub fn matches(&self, frame: &[u8], more: bool) -> bool {
        !more
            && self.offsets.iter().any(|&offset| {
                frame
                    .get(offset..)
                    .is_some_and(|rest| rest.starts_with(READY_TOKEN))
            })
    }
}

impl Default for ReadyProbe {
    fn default() -> Self {
        Self::new(DEFAULT_READY_OFFSETS.to_vec())
    }
}

/// Encodes a READY command as it appears on a raw secured-session stream:
/// command flag, size, name length, name, then `properties`.
///
/// The token lands at offset 3. Returns `None` when `properties` does not fit
/// a short command (more than 249 bytes).
#[must_use]
pub fn encode_ready_command(properties: &[u8]) -> Option<Vec<u8>> {
    let body_len = 1 + READY_TOKEN.len() + properties.len();
    let size = u8::try_from(body_len).ok()?;
    let mut out = Vec::with_capacity(2 + body_len);
    out.push(COMMAND_FLAG);
    out.push(size);
    out.push(READY_TOKEN.len() as u8);
    out.extend_from_slice(READY_TOKEN);
    out.extend_from_slice(properties);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(GREETING_LEN, 64);
        assert_eq!(SPLIT_HEAD_LEN, 11);
        assert_eq!(SPLIT_TAIL_LEN, 53);
    }

    #[test]
    fn encoded_greeting_layout() {
        let bytes = Greeting::new(Mechanism::Curve, true).encode();
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes[9], 0x7F);
        assert_eq!(&bytes[10..12], &[3, 0]);
        assert_eq!(&bytes[12..17], b"CURVE");
        assert!(bytes[17..32].iter().all(|b| *b == 0));
        assert_eq!(bytes[32], 1);
    }

    #[test]
    fn combined_curve_greeting_decides_immediately() {
        let mut decoder = GreetingDecoder::new();
        let bytes = Greeting::new(Mechanism::Curve, true).encode();
        match decoder.feed(&bytes) {
            Probe::Decided(g) => {
                assert!(g.mechanism.is_curve());
                assert!(g.as_server);
                assert_eq!((g.major, g.minor), (3, 0));
            }
            Probe::Undetermined => panic!("expected a decided greeting"),
        }
    }

    #[test]
    fn combined_greeting_with_trailing_bytes() {
        let mut bytes = Greeting::new(Mechanism::Null, false).encode().to_vec();
        bytes.extend_from_slice(&encode_ready_command(b"").unwrap());
        let parsed = Greeting::parse(&bytes).unwrap();
        assert_eq!(parsed.mechanism, Mechanism::Null);
        assert!(!parsed.as_server);
    }

    #[test]
    fn split_greeting_needs_both_fragments() {
        let mut decoder = GreetingDecoder::new();
        let (head, tail) = Greeting::new(Mechanism::Curve, true).encode_split();

        assert_eq!(decoder.feed(&head), Probe::Undetermined);
        assert!(decoder.awaiting_tail());

        let Probe::Decided(g) = decoder.feed(&tail) else {
            panic!("expected the tail to complete the greeting");
        };
        assert!(g.mechanism.is_curve());
        assert_eq!(g.major, 3);
        assert!(!decoder.awaiting_tail());
    }

    #[test]
    fn tail_without_head_is_undetermined() {
        let mut decoder = GreetingDecoder::new();
        let (_, tail) = Greeting::new(Mechanism::Curve, true).encode_split();
        assert_eq!(decoder.feed(&tail), Probe::Undetermined);
    }

    #[test]
    fn short_tail_keeps_waiting() {
        let mut decoder = GreetingDecoder::new();
        let (head, tail) = Greeting::new(Mechanism::Curve, true).encode_split();
        decoder.feed(&head);
        assert_eq!(decoder.feed(&tail[..20]), Probe::Undetermined);
        assert!(decoder.awaiting_tail());
        assert!(matches!(decoder.feed(&tail), Probe::Decided(_)));
    }

    #[test]
    fn bad_signature_is_undetermined() {
        let mut bytes = Greeting::new(Mechanism::Curve, true).encode();
        bytes[0] = 0x00;
        assert_eq!(GreetingDecoder::new().feed(&bytes), Probe::Undetermined);
        assert!(Greeting::parse(&bytes).is_none());
    }

    #[test]
    fn truncated_and_empty_input_are_undetermined() {
        let bytes = Greeting::new(Mechanism::Curve, true).encode();
        let mut decoder = GreetingDecoder::new();
        assert_eq!(decoder.feed(&bytes[..63]), Probe::Undetermined);
        assert_eq!(decoder.feed(&[]), Probe::Undetermined);
        assert_eq!(decoder.feed(b"request #001"), Probe::Undetermined);
    }

    #[test]
    fn mechanism_field_decoding() {
        assert_eq!(Mechanism::from_field(b"NULL\0\0\0\0"), Mechanism::Null);
        assert_eq!(Mechanism::from_field(b"CURVE\0"), Mechanism::Curve);
        assert_eq!(
            Mechanism::from_field(b"PLAIN\0\0"),
            Mechanism::Other("PLAIN".to_string())
        );
        assert_eq!(Mechanism::from_field(&[0u8; 20]), Mechanism::Other(String::new()));
        assert_eq!(Mechanism::from_field(b"CURVEX"), Mechanism::Other("CURVEX".into()));
    }

    #[test]
    fn overlong_mechanism_name_is_truncated() {
        let name = "A".repeat(40);
        let field = Mechanism::Other(name).to_field();
        assert_eq!(field, [b'A'; MECHANISM_LEN]);
    }

    #[test]
    fn ready_command_token_offset() {
        let cmd = encode_ready_command(b"\x0bSocket-Type").unwrap();
        assert_eq!(cmd[0], COMMAND_FLAG);
        assert_eq!(usize::from(cmd[1]), cmd.len() - 2);
        assert_eq!(&cmd[3..8], READY_TOKEN);
    }

    #[test]
    fn ready_probe_default_offsets() {
        let probe = ReadyProbe::default();
        assert_eq!(probe.offsets(), &[0, 3]);
        assert!(probe.matches(b"READY", false));
        assert!(probe.matches(&encode_ready_command(b"").unwrap(), false));
        assert!(!probe.matches(b"\x00\x05READY", false));
    }

    #[test]
    fn ready_probe_ignores_multipart_messages() {
        let probe = ReadyProbe::default();
        assert!(!probe.matches(&encode_ready_command(b"").unwrap(), true));
    }

    #[test]
    fn ready_probe_custom_offsets() {
        let probe = ReadyProbe::new(vec![2]);
        assert!(probe.matches(b"\x00\x05READY", false));
        assert!(!probe.matches(b"READY", false));
        assert!(!probe.matches(b"\x00\x05REA", false));
    }

    #[test]
    fn ready_probe_offset_past_end() {
        let probe = ReadyProbe::new(vec![usize::MAX]);
        assert!(!probe.matches(b"READY", false));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decoder_never_panics(frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..96), 0..8)) {
            let mut decoder = GreetingDecoder::new();
            for frame in &frames {
                let _ = decoder.feed(frame);
            }
        }

        #[test]
        fn split_and_combined_agree(minor in any::<u8>(), as_server in any::<bool>(), curve in any::<bool>()) {
            let mechanism = if curve { Mechanism::Curve } else { Mechanism::Null };
            let greeting = Greeting { major: 3, minor, mechanism, as_server };

            let mut combined = GreetingDecoder::new();
            let (head, tail) = greeting.encode_split();
            let mut split = GreetingDecoder::new();
            split.feed(&head);

            prop_assert_eq!(combined.feed(&greeting.encode()), Probe::Decided(greeting.clone()));
            prop_assert_eq!(split.feed(&tail), Probe::Decided(greeting));
        }
    }
}
