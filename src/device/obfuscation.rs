//! AmneziaWG-style traffic-shape obfuscation: junk packets sent ahead of a handshake,
//! header junk padding inside every framed message, and magic-header remapping of the
//! message-type discriminant. None of this touches the Noise state machine itself;
//! it wraps the byte buffers `Tunn` already produces and consumes.

use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;

/// Matches the interface MTU boundary the reference implementation guards against;
/// a framed (junk + message) packet must stay below this.
pub const MAX_SEGMENT_SIZE: usize = 1420;

pub const MSG_TYPE_INIT: usize = 0;
pub const MSG_TYPE_RESPONSE: usize = 1;
pub const MSG_TYPE_COOKIE: usize = 2;
pub const MSG_TYPE_TRANSPORT: usize = 3;

const BASE_SIZE: [usize; 4] = [148, 92, 64, 32];
const DEFAULT_DISCRIMINANT: [u32; 4] = [1, 2, 3, 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MagicHeader {
    pub min: u32,
    pub max: u32,
}

impl MagicHeader {
    fn default_for(msg_type: usize) -> Self {
        let v = DEFAULT_DISCRIMINANT[msg_type];
        MagicHeader { min: v, max: v }
    }

    /// `h1..h4` with a minimum of 4 or below fall back to the WireGuard default per the
    /// type, rather than being treated as a custom (if degenerate) configured range.
    fn resolve(self, msg_type: usize) -> MagicHeader {
        if self.min <= 4 {
            Self::default_for(msg_type)
        } else {
            self
        }
    }

    fn sample(&self) -> u32 {
        if self.min >= self.max {
            self.min
        } else {
            self.min + OsRng.next_u32() % (self.max - self.min + 1)
        }
    }

    fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One tagged segment of a special-junk generator expression (`i1..i5`). The grammar
/// is a whitespace-separated sequence of tags:
///   `b:<hex>`   literal bytes
///   `c:<count>` `<count>` bytes of pseudo-random "counter" filler
///   `r:<min>-<max>` a uniformly random number of random bytes in `[min, max]`
#[derive(Clone, Debug)]
enum JunkSegment {
    Bytes(Vec<u8>),
    Counter(usize),
    Random(usize, usize),
}

#[derive(Clone, Debug, Default)]
pub struct SpecialJunkGenerator {
    segments: Vec<JunkSegment>,
}

impl SpecialJunkGenerator {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        for tag in expr.split_whitespace() {
            let (kind, rest) = tag
                .split_once(':')
                .ok_or_else(|| format!("malformed junk generator tag: {tag}"))?;
            let segment = match kind {
                "b" => {
                    let bytes = hex::decode(rest)
                        .map_err(|_| format!("invalid hex in junk generator tag: {tag}"))?;
                    JunkSegment::Bytes(bytes)
                }
                "c" => {
                    let count = rest
                        .parse::<usize>()
                        .map_err(|_| format!("invalid count in junk generator tag: {tag}"))?;
                    JunkSegment::Counter(count)
                }
                "r" => {
                    let (lo, hi) = rest
                        .split_once('-')
                        .ok_or_else(|| format!("invalid range in junk generator tag: {tag}"))?;
                    let lo = lo
                        .parse::<usize>()
                        .map_err(|_| format!("invalid range in junk generator tag: {tag}"))?;
                    let hi = hi
                        .parse::<usize>()
                        .map_err(|_| format!("invalid range in junk generator tag: {tag}"))?;
                    if lo > hi {
                        return Err(format!("invalid range in junk generator tag: {tag}"));
                    }
                    JunkSegment::Random(lo, hi)
                }
                _ => return Err(format!("unknown junk generator tag: {tag}")),
            };
            segments.push(segment);
        }
        Ok(SpecialJunkGenerator { segments })
    }

    pub fn generate(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                JunkSegment::Bytes(bytes) => out.extend_from_slice(bytes),
                JunkSegment::Counter(count) => {
                    for i in 0..*count {
                        out.push((i & 0xff) as u8);
                    }
                }
                JunkSegment::Random(lo, hi) => {
                    let len = if lo == hi {
                        *lo
                    } else {
                        lo + (OsRng.next_u32() as usize) % (hi - lo + 1)
                    };
                    let mut bytes = vec![0u8; len];
                    OsRng.fill_bytes(&mut bytes);
                    out.extend_from_slice(&bytes);
                }
            }
        }
        out
    }
}

/// Validated, immutable obfuscation configuration plus its derived classification
/// tables. Swapped in as a whole (via `ArcSwap`-style pointer replace) so readers on
/// the hot decapsulation path never observe a partially-applied configuration.
pub struct Obfuscation {
    pub jc: u16,
    pub jmin: u16,
    pub jmax: u16,
    /// Header junk length per message type, indexed by `MSG_TYPE_*`.
    pub junk_size: [usize; 4],
    /// Magic-header discriminant range per message type, indexed by `MSG_TYPE_*`.
    pub magic: [MagicHeader; 4],
    pub special_junk: Vec<SpecialJunkGenerator>,
    /// framed size -> message type, for the three fixed-size control messages and the
    /// minimum (zero-payload) transport size.
    size_to_type: HashMap<usize, usize>,
}

impl Default for Obfuscation {
    fn default() -> Self {
        Obfuscation::build(0, 0, 0, [0; 4], [None; 4], Vec::new()).expect("default config is valid")
    }
}

impl Obfuscation {
    pub fn is_enabled(&self) -> bool {
        self.jc != 0
            || self.junk_size.iter().any(|&s| s != 0)
            || self.magic.iter().enumerate().any(|(t, h)| *h != MagicHeader::default_for(t))
            || !self.special_junk.is_empty()
    }

    /// Mirrors the reference implementation's `handlePostConfig`: validate every field
    /// together and only construct (hence only ever expose) a config that passes all
    /// pairwise-distinctness checks. `configured_h` entries of `None` mean "not set by
    /// this UAPI transaction", distinct from an explicit low value that falls back to
    /// the WireGuard default.
    pub fn build(
        jc: u16,
        jmin: u16,
        jmax: u16,
        s: [usize; 4],
        configured_h: [Option<MagicHeader>; 4],
        special_junk: Vec<SpecialJunkGenerator>,
    ) -> Result<Self, String> {
        if jmax < jmin {
            return Err("jmax must not be less than jmin".to_owned());
        }
        if jmax as usize >= MAX_SEGMENT_SIZE {
            return Err("jmax is too large".to_owned());
        }

        let mut magic = [MagicHeader::default_for(0); 4];
        let mut resolved_discriminants = [0u32; 4];
        for t in 0..4 {
            let h = configured_h[t].unwrap_or_else(|| MagicHeader::default_for(t));
            let h = h.resolve(t);
            magic[t] = h;
            // the lower bound stands in for "the" discriminant when validating
            // pairwise distinctness, matching the reference implementation's
            // dedup-by-resolved-value check.
            resolved_discriminants[t] = h.min;
        }
        if !all_distinct(&resolved_discriminants) {
            return Err("magic headers should differ".to_owned());
        }

        let mut junk_size = [0usize; 4];
        let mut framed_size = [0usize; 4];
        for t in 0..4 {
            let new_size = BASE_SIZE[t] + s[t];
            if new_size >= MAX_SEGMENT_SIZE {
                return Err(format!("junk size for message type {t} is too large"));
            }
            junk_size[t] = s[t];
            framed_size[t] = new_size;
        }
        if !all_distinct(&framed_size) {
            return Err("new sizes should differ".to_owned());
        }

        let mut size_to_type = HashMap::new();
        for t in 0..4 {
            size_to_type.insert(framed_size[t], t);
        }

        Ok(Obfuscation {
            jc,
            jmin,
            jmax,
            junk_size,
            magic,
            special_junk,
            size_to_type,
        })
    }

    /// Junk datagrams to emit before a handshake initiation: `jc` packets of uniformly
    /// random length in `[jmin, jmax]`, uniformly random content.
    pub fn junk_packets(&self) -> Vec<Vec<u8>> {
        (0..self.jc)
            .map(|_| {
                let len = if self.jmin == self.jmax {
                    self.jmin as usize
                } else {
                    self.jmin as usize
                        + (OsRng.next_u32() as usize) % (self.jmax as usize - self.jmin as usize + 1)
                };
                let mut buf = vec![0u8; len];
                OsRng.fill_bytes(&mut buf);
                buf
            })
            .collect()
    }

    /// Pre-handshake decoy packets driven by the `i1..i5` generator expressions, in
    /// configuration order, emitted before the genuine initiation.
    pub fn special_junk_packets(&self) -> Vec<Vec<u8>> {
        self.special_junk.iter().map(|g| g.generate()).collect()
    }

    /// Wrap a message `Tunn` produced (discriminant at byte offset 0) with this type's
    /// header junk and magic-header discriminant.
    pub fn frame_outbound(&self, msg_type: usize, msg: &[u8]) -> Vec<u8> {
        let junk_len = self.junk_size[msg_type];
        let mut framed = Vec::with_capacity(junk_len + msg.len());
        let mut junk = vec![0u8; junk_len];
        OsRng.fill_bytes(&mut junk);
        framed.extend_from_slice(&junk);
        let discriminant = self.magic[msg_type].sample();
        framed.extend_from_slice(&discriminant.to_le_bytes());
        framed.extend_from_slice(&msg[4..]);
        framed
    }

    /// Classify and de-obfuscate an inbound datagram, returning the plain WireGuard
    /// framed message (default discriminant restored) ready for `Tunn::decapsulate`.
    /// Returns `None` when the datagram cannot be classified (it is "probably a junk
    /// packet" and should be silently dropped).
    pub fn strip_inbound(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        if let Some(&candidate_type) = self.size_to_type.get(&datagram.len()) {
            if let Some(msg) = self.try_strip_as(datagram, candidate_type) {
                return Some(msg);
            }
            // sizes can collide; a non-matching discriminant is reprocessed as a
            // transport-type candidate rather than dropped outright.
            if candidate_type != MSG_TYPE_TRANSPORT {
                return self.try_strip_as(datagram, MSG_TYPE_TRANSPORT);
            }
            return None;
        }
        // Unknown size: only transport messages vary in length.
        self.try_strip_as(datagram, MSG_TYPE_TRANSPORT)
    }

    fn try_strip_as(&self, datagram: &[u8], msg_type: usize) -> Option<Vec<u8>> {
        let junk_len = self.junk_size[msg_type];
        if datagram.len() < junk_len + 4 {
            return None;
        }
        let discriminant = u32::from_le_bytes(datagram[junk_len..junk_len + 4].try_into().ok()?);
        if !self.magic[msg_type].contains(discriminant) {
            return None;
        }
        let default_discriminant = DEFAULT_DISCRIMINANT[msg_type];
        let mut out = Vec::with_capacity(datagram.len() - junk_len);
        out.extend_from_slice(&default_discriminant.to_le_bytes());
        out.extend_from_slice(&datagram[junk_len + 4..]);
        Some(out)
    }
}

fn all_distinct(values: &[u32; 4]) -> bool {
    for i in 0..4 {
        for j in (i + 1)..4 {
            if values[i] == values[j] {
                return false;
            }
        }
    }
    true
}

pub fn msg_type_of(discriminant_byte0: u8) -> Option<usize> {
    match discriminant_byte0 {
        1 => Some(MSG_TYPE_INIT),
        2 => Some(MSG_TYPE_RESPONSE),
        3 => Some(MSG_TYPE_COOKIE),
        4 => Some(MSG_TYPE_TRANSPORT),
        _ => None,
    }
}

/// Process-wide obfuscation state, replaced wholesale on a successful UAPI `set`
/// transaction. Readers on the hot path clone the `Arc` once and never block a writer.
pub type SharedObfuscation = Arc<Obfuscation>;

#[cfg(test)]
mod tests {
    use super::*;

    fn h(min: u32, max: u32) -> Option<MagicHeader> {
        Some(MagicHeader { min, max })
    }

    #[test]
    fn jmax_below_jmin_is_rejected() {
        // S3: jmax=5, jmin=10 must be rejected without mutating anything the caller
        // can observe (the caller never gets an `Obfuscation` to install).
        let err = Obfuscation::build(0, 10, 5, [0; 4], [None; 4], Vec::new()).unwrap_err();
        assert!(err.contains("jmax"));
    }

    #[test]
    fn equal_magic_headers_are_rejected() {
        // S6: h1=200, h2=200.
        let err = Obfuscation::build(
            0,
            0,
            0,
            [0; 4],
            [h(200, 200), h(200, 200), None, None],
            Vec::new(),
        )
        .unwrap_err();
        assert!(err.contains("differ"));
    }

    #[test]
    fn low_magic_header_falls_back_to_default() {
        let cfg = Obfuscation::build(0, 0, 0, [0; 4], [h(4, 4), None, None, None], Vec::new())
            .expect("min <= 4 falls back instead of erroring");
        assert_eq!(cfg.magic[MSG_TYPE_INIT], MagicHeader::default_for(MSG_TYPE_INIT));
    }

    #[test]
    fn colliding_framed_sizes_are_rejected() {
        // Padding the (smaller) response frame up to the unpadded init frame's size
        // must be rejected even though each size individually fits under
        // MaxSegmentSize.
        let mut s = [0usize; 4];
        s[MSG_TYPE_RESPONSE] = BASE_SIZE[MSG_TYPE_INIT] - BASE_SIZE[MSG_TYPE_RESPONSE];
        let err = Obfuscation::build(0, 0, 0, s, [None; 4], Vec::new()).unwrap_err();
        assert!(err.contains("differ"));
    }

    #[test]
    fn frame_and_strip_round_trip_with_magic_header_and_junk() {
        // S2: jc=3, jmin=10, jmax=40, s1=8, h1=100-200.
        let mut s = [0usize; 4];
        s[MSG_TYPE_INIT] = 8;
        let cfg = Obfuscation::build(3, 10, 40, s, [h(100, 200), None, None, None], Vec::new())
            .expect("valid config");

        let mut plain = vec![0u8; BASE_SIZE[MSG_TYPE_INIT]];
        plain[0..4].copy_from_slice(&1u32.to_le_bytes()); // default init discriminant
        for (i, b) in plain.iter_mut().enumerate().skip(4) {
            *b = i as u8;
        }

        let framed = cfg.frame_outbound(MSG_TYPE_INIT, &plain);
        assert_eq!(framed.len(), BASE_SIZE[MSG_TYPE_INIT] + 8);

        let discriminant = u32::from_le_bytes(framed[8..12].try_into().unwrap());
        assert!((100..=200).contains(&discriminant));

        let stripped = cfg.strip_inbound(&framed).expect("classifies as init");
        assert_eq!(stripped, plain);
    }

    #[test]
    fn junk_packets_respect_length_bounds() {
        let cfg = Obfuscation::build(3, 10, 40, [0; 4], [None; 4], Vec::new()).unwrap();
        let packets = cfg.junk_packets();
        assert_eq!(packets.len(), 3);
        for p in packets {
            assert!(p.len() >= 10 && p.len() <= 40);
        }
    }

    #[test]
    fn unclassifiable_datagram_is_dropped() {
        let cfg = Obfuscation::default();
        assert!(cfg.strip_inbound(&[0u8; 7]).is_none());
    }

    #[test]
    fn special_junk_generator_grammar() {
        let gen = SpecialJunkGenerator::parse("b:deadbeef c:4 r:2-2").unwrap();
        let out = gen.generate();
        assert_eq!(&out[0..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&out[4..8], &[0, 1, 2, 3]);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn special_junk_generator_rejects_malformed_tags() {
        assert!(SpecialJunkGenerator::parse("x:1").is_err());
        assert!(SpecialJunkGenerator::parse("r:5-2").is_err());
        assert!(SpecialJunkGenerator::parse("b:zz").is_err());
    }
}
