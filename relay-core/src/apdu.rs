//! ISO 7816-4 command APDU framing.
//!
//! The framer answers one question about a byte stream: where does the next
//! APDU end? It never buffers, reorders or rewrites anything. Callers keep
//! their own staging buffer and advance it by the encoded length of each
//! APDU handed back by [`parse`]. All four encoding cases are recognized, in
//! short and extended form.
//!
//! Stream framing of APDUs is inherently ambiguous: a fifth byte of 0x00 can
//! be a short Le, the start of an extended length, or the CLA of the next
//! APDU. Where the encoding alone cannot decide, classification is
//! conservative and waits for more bytes, unless the bytes already on hand
//! frame completely under a shorter reading, in which case total length
//! disambiguates and the shorter APDU is emitted first.

use crate::errors::ApduError;

/// Instruction bytes ISO 7816-4 declares invalid in a command.
const INVALID_INS: [u8; 2] = [0x00, 0xFF];

/// Parsed command APDU.
///
/// `lc`/`data` and `le` are present or absent per the four encoding cases.
/// An APDU obtained from [`parse`] remembers its exact wire bytes, so
/// relaying and re-encoding stay byte-faithful even for redundant encodings
/// (such as a small Lc written in extended form). APDUs built through the
/// constructors encode canonically instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub lc: Option<u16>,
    pub data: Option<Vec<u8>>,
    pub le: Option<u32>,
    raw: Option<Vec<u8>>,
}

impl Apdu {
    /// Header-only command (Case 1).
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            lc: None,
            data: None,
            le: None,
            raw: None,
        }
    }

    /// Attach command data (Case 3/4); Lc is derived from the length.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.lc = Some(data.len() as u16);
        self.data = Some(data);
        self.raw = None;
        self
    }

    /// Attach an expected response length (Case 2/4), 1..=65536.
    pub fn with_le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self.raw = None;
        self
    }

    /// Number of bytes this APDU occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        if let Some(raw) = &self.raw {
            return raw.len();
        }
        let mut len = 4;
        if let Some(lc) = self.lc {
            if lc > 0 {
                len += if lc <= 255 { 1 } else { 3 };
                len += lc as usize;
            }
        }
        if let Some(le) = self.le {
            len += if le <= 256 { 1 } else { 3 };
        }
        len
    }

    /// Wire encoding. Parsed APDUs return their original bytes; constructed
    /// ones use the short form whenever the value fits.
    pub fn to_bytes(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        if let Some(lc) = self.lc {
            if lc > 0 {
                if lc <= 255 {
                    out.push(lc as u8);
                } else {
                    out.push(0x00);
                    out.extend_from_slice(&lc.to_be_bytes());
                }
                if let Some(data) = &self.data {
                    out.extend_from_slice(data);
                }
            }
        }
        if let Some(le) = self.le {
            if le <= 256 {
                out.push(if le == 256 { 0x00 } else { le as u8 });
            } else {
                out.push(0x00);
                out.extend_from_slice(&((le & 0xFFFF) as u16).to_be_bytes());
            }
        }
        out
    }

    /// Structural validity: legal INS, unreserved CLA, Lc consistent with
    /// the data length.
    pub fn validate(&self) -> Result<(), ApduError> {
        if INVALID_INS.contains(&self.ins) {
            return Err(ApduError::InvalidIns(self.ins));
        }
        if self.cla & 0x0F == 0x0F {
            return Err(ApduError::ReservedCla(self.cla));
        }
        let data_len = self.data.as_ref().map(Vec::len).unwrap_or(0);
        if self.lc.unwrap_or(0) as usize != data_len {
            return Err(ApduError::LengthMismatch {
                lc: self.lc.unwrap_or(0),
                data_len,
            });
        }
        Ok(())
    }
}

/// Byte layout of one complete APDU at the front of a buffer.
struct FrameLayout {
    total: usize,
    lc: Option<u16>,
    data_off: usize,
    le: Option<u32>,
}

/// True when `buf` begins with at least one complete APDU.
pub fn is_complete(buf: &[u8]) -> bool {
    classify(buf).is_some()
}

/// Parse the first APDU in `buf`.
///
/// On success, [`Apdu::encoded_len`] on the result tells the caller how many
/// bytes of `buf` were consumed. With `validate` set, the structural rules
/// are enforced and a violation is an error; without it, any frameable byte
/// layout parses.
pub fn parse(buf: &[u8], validate: bool) -> Result<Apdu, ApduError> {
    let layout = classify(buf).ok_or(ApduError::Truncated { len: buf.len() })?;
    let data = layout
        .lc
        .map(|lc| buf[layout.data_off..layout.data_off + lc as usize].to_vec());
    let apdu = Apdu {
        cla: buf[0],
        ins: buf[1],
        p1: buf[2],
        p2: buf[3],
        lc: layout.lc,
        data,
        le: layout.le,
        raw: Some(buf[..layout.total].to_vec()),
    };
    if validate {
        apdu.validate()?;
    }
    Ok(apdu)
}

/// Decide whether `buf` starts with one complete APDU and, if so, how it is
/// laid out. `None` means "wait for more bytes".
fn classify(buf: &[u8]) -> Option<FrameLayout> {
    let len = buf.len();
    if len < 4 {
        return None;
    }
    if len == 4 {
        return Some(FrameLayout {
            total: 4,
            lc: None,
            data_off: 0,
            le: None,
        });
    }
    let b = buf[4];
    if len == 5 {
        // A lone fifth byte of zero can only be Le (= 256). Any other value
        // is ambiguous between "Le = b" and "Lc = b, data pending"; wait.
        return (b == 0x00).then_some(FrameLayout {
            total: 5,
            lc: None,
            data_off: 0,
            le: Some(256),
        });
    }
    if b != 0x00 {
        classify_short(buf, b)
    } else {
        classify_extended(buf)
    }
}

/// Short-Lc layouts: Case 3, Case 4 with short Le, Case 4 with extended Le.
fn classify_short(buf: &[u8], lc: u8) -> Option<FrameLayout> {
    let len = buf.len();
    let body = 5 + lc as usize;
    let layout = |total, le| {
        Some(FrameLayout {
            total,
            lc: Some(lc as u16),
            data_off: 5,
            le,
        })
    };
    if len < body {
        return None; // data still streaming in
    }
    if len == body {
        return layout(body, None);
    }
    if len == body + 1 {
        return layout(body + 1, Some(le_short(buf[body])));
    }
    if len == body + 3 && buf[body] == 0x00 {
        return layout(body + 3, Some(le_extended(buf[body + 1], buf[body + 2])));
    }
    // Trailing bytes that are no Le block; wait for the boundary to realign.
    None
}

/// Extended layouts behind a 0x00 fifth byte: Case 2 extended, Case 3/4
/// extended, or a Case 1 APDU followed by the start of the next one.
fn classify_extended(buf: &[u8]) -> Option<FrameLayout> {
    let len = buf.len();
    if len >= 7 {
        let lc = u16::from_be_bytes([buf[5], buf[6]]) as usize;
        if lc == 0 {
            // An extended Lc of zero does not exist; exactly seven bytes is
            // a header plus an extended Le.
            if len == 7 {
                return Some(FrameLayout {
                    total: 7,
                    lc: None,
                    data_off: 0,
                    le: Some(le_extended(buf[5], buf[6])),
                });
            }
        } else {
            let body = 7 + lc;
            if len == body {
                return Some(FrameLayout {
                    total: body,
                    lc: Some(lc as u16),
                    data_off: 7,
                    le: None,
                });
            }
            if len == body + 3 && buf[body] == 0x00 {
                return Some(FrameLayout {
                    total: body + 3,
                    lc: Some(lc as u16),
                    data_off: 7,
                    le: Some(le_extended(buf[body + 1], buf[body + 2])),
                });
            }
        }
    }
    // The extended reading needs bytes that are not there (or explains too
    // few of the ones that are). If everything after the header frames on
    // its own, total length has disambiguated: the header is a complete
    // Case 1 APDU and the rest belongs to the next one(s).
    if classify(&buf[4..]).is_some() {
        return Some(FrameLayout {
            total: 4,
            lc: None,
            data_off: 0,
            le: None,
        });
    }
    None
}

fn le_short(b: u8) -> u32 {
    if b == 0 { 256 } else { b as u32 }
}

fn le_extended(hi: u8, lo: u8) -> u32 {
    match u16::from_be_bytes([hi, lo]) {
        0 => 65536,
        le => le as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECT_AID: [u8; 12] = [
        0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x04, 0x10, 0x10, 0x10,
    ];

    #[test]
    fn case1_header_only() {
        let buf = [0x00, 0xA4, 0x04, 0x00];
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!((apdu.cla, apdu.ins, apdu.p1, apdu.p2), (0x00, 0xA4, 0x04, 0x00));
        assert_eq!(apdu.lc, None);
        assert_eq!(apdu.le, None);
        assert_eq!(apdu.encoded_len(), 4);
    }

    #[test]
    fn case2_short_le_zero_means_256() {
        let buf = [0x00, 0xC0, 0x00, 0x00, 0x00];
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.le, Some(256));
        assert_eq!(apdu.encoded_len(), 5);
    }

    #[test]
    fn five_bytes_with_nonzero_fifth_byte_waits_for_data() {
        // Could be "Le = 5" or "Lc = 5, data pending"; the framer waits.
        let buf = [0x00, 0xA4, 0x04, 0x00, 0x05];
        assert!(!is_complete(&buf));
        assert_eq!(
            parse(&buf, true).unwrap_err(),
            ApduError::Truncated { len: 5 }
        );
    }

    #[test]
    fn case3_short_with_data() {
        assert!(is_complete(&SELECT_AID));
        let apdu = parse(&SELECT_AID, true).unwrap();
        assert_eq!(apdu.lc, Some(7));
        assert_eq!(apdu.data.as_deref(), Some(&SELECT_AID[5..12]));
        assert_eq!(apdu.le, None);
        assert_eq!(apdu.encoded_len(), 12);
    }

    #[test]
    fn case3_missing_data_is_incomplete() {
        assert!(!is_complete(&SELECT_AID[..6]));
        assert!(!is_complete(&SELECT_AID[..11]));
    }

    #[test]
    fn case4_short_le_after_data() {
        let buf = [0x00, 0xD6, 0x00, 0x00, 0x02, 0xAA, 0xBB, 0x10];
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.lc, Some(2));
        assert_eq!(apdu.le, Some(0x10));
        assert_eq!(apdu.encoded_len(), 8);
    }

    #[test]
    fn case4_short_lc_with_extended_le() {
        let buf = [0x00, 0xD6, 0x00, 0x00, 0x01, 0xAA, 0x00, 0x01, 0x00];
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.lc, Some(1));
        assert_eq!(apdu.le, Some(256));
        assert_eq!(apdu.encoded_len(), 9);
    }

    #[test]
    fn case2_extended_le() {
        // Header plus 00 00 00: extended Le of zero means 65536.
        let buf = [0x00, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.lc, None);
        assert_eq!(apdu.le, Some(65536));
        assert_eq!(apdu.encoded_len(), 7);
    }

    #[test]
    fn case3_extended_lc() {
        let mut buf = vec![0x00, 0xD6, 0x00, 0x00, 0x00, 0x01, 0x2C];
        buf.extend(std::iter::repeat_n(0x5A, 300));
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.lc, Some(300));
        assert_eq!(apdu.data.as_ref().map(Vec::len), Some(300));
        assert_eq!(apdu.encoded_len(), 307);

        // With the tail missing the frame stays open.
        assert!(!is_complete(&buf[..306]));
    }

    #[test]
    fn case4_extended_lc_and_le() {
        let mut buf = vec![0x00, 0xD6, 0x00, 0x00, 0x00, 0x01, 0x00];
        buf.extend(std::iter::repeat_n(0x5A, 256));
        buf.extend([0x00, 0x02, 0x00]);
        assert!(is_complete(&buf));
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.lc, Some(256));
        assert_eq!(apdu.le, Some(0x200));
        assert_eq!(apdu.encoded_len(), buf.len());
    }

    #[test]
    fn short_buffers_are_incomplete() {
        assert!(!is_complete(&[]));
        assert!(!is_complete(&[0x00]));
        assert!(!is_complete(&[0x00, 0xA4, 0x04]));
    }

    #[test]
    fn trailing_garbage_after_body_keeps_the_frame_open() {
        // Case 3 body followed by two bytes that are no valid Le block.
        let buf = [0x00, 0xD6, 0x00, 0x00, 0x01, 0xAA, 0x01, 0x02];
        assert!(!is_complete(&buf));
    }

    #[test]
    fn back_to_back_apdus_split_at_the_header() {
        // Case 1 directly followed by a complete Case 2: total length
        // disambiguates the 0x00 fifth byte.
        let buf = [0x00, 0xA4, 0x04, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00];
        assert!(is_complete(&buf));
        let first = parse(&buf, true).unwrap();
        assert_eq!(first.encoded_len(), 4);
        assert_eq!(first.ins, 0xA4);
        let second = parse(&buf[4..], true).unwrap();
        assert_eq!(second.encoded_len(), 5);
        assert_eq!(second.ins, 0xC0);
        assert_eq!(second.le, Some(256));
    }

    #[test]
    fn invalid_ins_rejected_when_validating() {
        let buf = [0x00, 0x00, 0x04, 0x00];
        assert_eq!(parse(&buf, true).unwrap_err(), ApduError::InvalidIns(0x00));
        let buf = [0x00, 0xFF, 0x04, 0x00];
        assert_eq!(parse(&buf, true).unwrap_err(), ApduError::InvalidIns(0xFF));
        // Without validation the same bytes parse fine.
        assert!(parse(&buf, false).is_ok());
    }

    #[test]
    fn reserved_cla_rejected_when_validating() {
        let buf = [0xFF, 0xA4, 0x00, 0x00];
        assert_eq!(parse(&buf, true).unwrap_err(), ApduError::ReservedCla(0xFF));
        let buf = [0x0F, 0xA4, 0x00, 0x00];
        assert_eq!(parse(&buf, true).unwrap_err(), ApduError::ReservedCla(0x0F));
    }

    #[test]
    fn parse_length_never_exceeds_input() {
        let cases: &[&[u8]] = &[
            &[0x00, 0xA4, 0x04, 0x00],
            &[0x00, 0xC0, 0x00, 0x00, 0x00],
            &SELECT_AID,
            &[0x00, 0xA4, 0x04, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00],
        ];
        for buf in cases {
            assert!(is_complete(buf));
            let apdu = parse(buf, false).unwrap();
            assert!(apdu.encoded_len() <= buf.len());
        }
    }

    #[test]
    fn reencoding_a_parsed_apdu_is_byte_faithful() {
        let constructed = [
            Apdu::new(0x00, 0xA4, 0x04, 0x00),
            Apdu::new(0x00, 0xC0, 0x00, 0x00).with_le(256),
            Apdu::new(0x00, 0xB0, 0x00, 0x00).with_le(65536),
            Apdu::new(0x00, 0xA4, 0x04, 0x00).with_data(vec![0xA0, 0x00, 0x00, 0x04]),
            Apdu::new(0x00, 0xD6, 0x00, 0x00).with_data(vec![0xAA, 0xBB]).with_le(1000),
            Apdu::new(0x80, 0xD6, 0x00, 0x00)
                .with_data(vec![0x5A; 300])
                .with_le(65536),
        ];
        for apdu in constructed {
            let wire = apdu.to_bytes();
            assert_eq!(wire.len(), apdu.encoded_len());
            let reparsed = parse(&wire, true).unwrap();
            assert_eq!(reparsed.to_bytes(), wire);
        }
    }

    #[test]
    fn redundant_extended_encoding_survives_a_round_trip() {
        // Lc = 2 written in extended form; canonical re-encoding would
        // shrink it, the remembered wire bytes must not.
        let buf = [0x00, 0xD6, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB];
        let apdu = parse(&buf, true).unwrap();
        assert_eq!(apdu.lc, Some(2));
        assert_eq!(apdu.to_bytes(), buf);
        assert_eq!(apdu.encoded_len(), 9);
    }

    #[test]
    fn length_mismatch_caught_by_validate() {
        let mut apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00).with_data(vec![1, 2, 3]);
        apdu.lc = Some(5);
        assert_eq!(
            apdu.validate().unwrap_err(),
            ApduError::LengthMismatch { lc: 5, data_len: 3 }
        );
    }
}
