//! SMS PDU (3GPP TS 23.040) encode/decode - the "PDU codec boundary" named in spec §6.
//!
//! This is the external collaborator the spec describes only at its interface: `encode` (a
//! generalization of `encodeSmsSubmitPdu`/`encodeGsm7`) and `decode`
//! (`decodeSmsPdu`), plus the wire types (`PduAddress`, `Pdu`) the teacher's `pdu.rs` already
//! modeled for SMS-SUBMIT encoding.
use crate::error::{ModemError, ModemResult};
use crate::sms::gsm7;
use crate::sms::udh::UserDataHeader;
use encoding_rs::UTF_16BE;
use std::convert::TryFrom;
use std::fmt;

/// Hex-encodes/decodes the raw octets making up a PDU, as sent/received over the AT link.
pub struct HexData<'a>(pub &'a [u8]);
impl<'a> fmt::Display for HexData<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
impl<'a> HexData<'a> {
    /// Decode a hex string (as received from the modem) back into raw bytes.
    pub fn decode(s: &str) -> ModemResult<Vec<u8>> {
        if s.len() % 2 != 0 {
            return Err(ModemError::InvalidPdu("hex PDU has odd length"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ModemError::InvalidPdu("invalid hex digit")))
            .collect()
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOfNumber {
    Unknown = 0b0_000_0000,
    International = 0b0_001_0000,
    National = 0b0_010_0000,
    Special = 0b0_011_0000,
    Gsm = 0b0_101_0000,
    Short = 0b0_110_0000,
    Reserved = 0b0_111_0000,
}
impl TypeOfNumber {
    fn from_u8(b: u8) -> TypeOfNumber {
        match b & 0b0_111_0000 {
            0b0_001_0000 => TypeOfNumber::International,
            0b0_010_0000 => TypeOfNumber::National,
            0b0_011_0000 => TypeOfNumber::Special,
            0b0_101_0000 => TypeOfNumber::Gsm,
            0b0_110_0000 => TypeOfNumber::Short,
            0b0_111_0000 => TypeOfNumber::Reserved,
            _ => TypeOfNumber::Unknown,
        }
    }
}
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NumberingPlanIdentification {
    NetworkDetermined = 0b0_000_0000,
    IsdnTelephone = 0b0_000_0001,
    Data = 0b0_000_0011,
    Telex = 0b0_000_0100,
    National = 0b0_000_1000,
    Private = 0b0_000_1001,
    Ermes = 0b0_000_1010,
}
impl NumberingPlanIdentification {
    fn from_u8(b: u8) -> NumberingPlanIdentification {
        match b & 0b0_000_1111 {
            0b0_000_0001 => NumberingPlanIdentification::IsdnTelephone,
            0b0_000_0011 => NumberingPlanIdentification::Data,
            0b0_000_0100 => NumberingPlanIdentification::Telex,
            0b0_000_1000 => NumberingPlanIdentification::National,
            0b0_000_1001 => NumberingPlanIdentification::Private,
            0b0_000_1010 => NumberingPlanIdentification::Ermes,
            _ => NumberingPlanIdentification::NetworkDetermined,
        }
    }
}
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressType {
    pub type_of_number: TypeOfNumber,
    pub numbering_plan_identification: NumberingPlanIdentification,
}
impl Default for AddressType {
    fn default() -> Self {
        AddressType {
            type_of_number: TypeOfNumber::International,
            numbering_plan_identification: NumberingPlanIdentification::NetworkDetermined,
        }
    }
}
impl AddressType {
    pub fn as_u8(self) -> u8 {
        0b1_000_0000 | self.type_of_number as u8 | self.numbering_plan_identification as u8
    }
    fn from_u8(b: u8) -> AddressType {
        AddressType {
            type_of_number: TypeOfNumber::from_u8(b),
            numbering_plan_identification: NumberingPlanIdentification::from_u8(b),
        }
    }
}
/// A phone number as semi-octets (one BCD digit per nibble, `*`/`#`/`a`-`c` mapped per spec).
#[derive(Debug, Clone)]
pub struct PhoneNumber(pub Vec<u8>);
impl PhoneNumber {
    fn digit_to_semi(c: char) -> ModemResult<u8> {
        Ok(match c {
            '0'..='9' => c as u8 - b'0',
            '*' => 0xA,
            '#' => 0xB,
            'a' | 'A' => 0xC,
            'b' | 'B' => 0xD,
            'c' | 'C' => 0xE,
            _ => return Err(ModemError::InvalidPdu("invalid character in phone number")),
        })
    }
    fn semi_to_digit(b: u8) -> char {
        match b {
            0..=9 => (b'0' + b) as char,
            0xA => '*',
            0xB => '#',
            0xC => 'a',
            0xD => 'b',
            0xE => 'c',
            _ => '?',
        }
    }
    pub fn parse(digits: &str) -> ModemResult<PhoneNumber> {
        let digits = digits.trim_start_matches('+');
        let semis = digits.chars().map(Self::digit_to_semi).collect::<ModemResult<Vec<u8>>>()?;
        Ok(PhoneNumber(semis))
    }
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut ret = vec![];
        let mut cur = 0u8;
        for (i, b) in self.0.iter().enumerate() {
            if i % 2 == 0 {
                cur |= *b;
            } else {
                cur |= *b << 4;
                ret.push(cur);
                cur = 0;
            }
        }
        if self.0.len() % 2 != 0 {
            cur |= 0b1111_0000;
            ret.push(cur);
        }
        ret
    }
    pub fn decode(bytes: &[u8], num_digits: usize) -> PhoneNumber {
        let mut semis = vec![];
        for b in bytes {
            semis.push(b & 0x0F);
            semis.push(b >> 4);
        }
        semis.truncate(num_digits);
        PhoneNumber(semis)
    }
    pub fn to_string_with(&self, addr: AddressType) -> String {
        let prefix = if addr.type_of_number == TypeOfNumber::International {
            "+"
        } else {
            ""
        };
        let digits: String = self.0.iter().map(|b| Self::semi_to_digit(*b)).collect();
        format!("{}{}", prefix, digits)
    }
}
#[derive(Debug, Clone)]
pub struct PduAddress {
    pub type_addr: AddressType,
    pub number: PhoneNumber,
}
impl PduAddress {
    pub fn from_number(number: &str) -> ModemResult<PduAddress> {
        let international = number.starts_with('+');
        Ok(PduAddress {
            type_addr: AddressType {
                type_of_number: if international {
                    TypeOfNumber::International
                } else {
                    TypeOfNumber::Unknown
                },
                numbering_plan_identification: NumberingPlanIdentification::IsdnTelephone,
            },
            number: PhoneNumber::parse(number)?,
        })
    }
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut ret = vec![self.type_addr.as_u8()];
        ret.extend(self.number.as_bytes());
        let len = self.number.0.len();
        ret.insert(0, len as u8);
        ret
    }
    /// Parse an address field, returning the address and the number of bytes consumed
    /// (including the leading length octet).
    pub fn parse(b: &[u8]) -> ModemResult<(PduAddress, usize)> {
        let num_digits = *b.first().ok_or(ModemError::InvalidPdu("address field truncated"))? as usize;
        let type_addr = AddressType::from_u8(*b.get(1).ok_or(ModemError::InvalidPdu("address field truncated"))?);
        let num_octets = (num_digits + 1) / 2;
        let data = b
            .get(2..2 + num_octets)
            .ok_or(ModemError::InvalidPdu("address field truncated"))?;
        let number = PhoneNumber::decode(data, num_digits);
        Ok((PduAddress { type_addr, number }, 2 + num_octets))
    }
    pub fn to_string(&self) -> String {
        self.number.to_string_with(self.type_addr)
    }
}
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageType {
    SmsDeliver = 0b0000_0000,
    SmsCommand = 0b0000_0010,
    SmsSubmit = 0b0000_0001,
    SmsStatusReport = 0b0000_0010, // same bit pattern as SmsCommand; MO/MT direction disambiguates.
}
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VpFieldValidity {
    Invalid = 0b0000_00_00,
    Relative = 0b0000_10_00,
    Enhanced = 0b0000_01_00,
    Absolute = 0b0000_11_00,
}
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduFirstOctet {
    pub mti: MessageType,
    pub rd: bool,
    pub vpf: VpFieldValidity,
    pub srr: bool,
    pub udhi: bool,
    pub rp: bool,
}
impl PduFirstOctet {
    pub fn as_u8(self) -> u8 {
        let mut ret = self.mti as u8 | self.vpf as u8;
        if self.rd {
            ret |= 0b0000_0100;
        }
        if self.srr {
            ret |= 0b0010_0000;
        }
        if self.udhi {
            ret |= 0b0100_0000;
        }
        if self.rp {
            ret |= 0b1000_0000;
        }
        ret
    }
}
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageClass {
    Silent = 0b0000_0000,
    StoreToNv = 0b0000_0001,
    StoreToSim = 0b0000_0010,
    StoreToTe = 0b0000_0011,
}
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageEncoding {
    Gsm7Bit = 0b0000_00_00,
    EightBit = 0b0000_01_00,
    Ucs2 = 0b0000_10_00,
    Reserved = 0b0000_11_00,
}
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SimplisticDataCodingScheme {
    pub class: MessageClass,
    pub encoding: MessageEncoding,
}
impl SimplisticDataCodingScheme {
    pub fn as_u8(self) -> u8 {
        0b0001_0000 | self.class as u8 | self.encoding as u8
    }
    fn from_u8(b: u8) -> SimplisticDataCodingScheme {
        let encoding = match b & 0b0000_1100 {
            0b0000_0100 => MessageEncoding::EightBit,
            0b0000_1000 => MessageEncoding::Ucs2,
            0b0000_1100 => MessageEncoding::Reserved,
            _ => MessageEncoding::Gsm7Bit,
        };
        let class = match b & 0b0000_0011 {
            1 => MessageClass::StoreToNv,
            2 => MessageClass::StoreToSim,
            3 => MessageClass::StoreToTe,
            _ => MessageClass::Silent,
        };
        SimplisticDataCodingScheme { class, encoding }
    }
}
/// An SMS-SUBMIT PDU, ready to be hex-encoded and sent via `AT+CMGS`.
pub struct Pdu {
    pub sca: Option<PduAddress>,
    pub first_octet: PduFirstOctet,
    pub message_id: u8,
    pub destination: PduAddress,
    pub dcs: SimplisticDataCodingScheme,
    pub validity_period: u8,
    pub user_data: Vec<u8>,
}
impl Pdu {
    /// Returns `(bytes, tpdu_length)` - `tpdu_length` is what `AT+CMGS=<n>` expects, which
    /// excludes the SMSC prefix.
    pub fn as_bytes(&self) -> (Vec<u8>, usize) {
        let mut ret = vec![];
        let sca_bytes = match &self.sca {
            Some(sca) => sca.as_bytes(),
            None => vec![0],
        };
        let scalen = sca_bytes.len();
        ret.extend(sca_bytes);
        ret.push(self.first_octet.as_u8());
        ret.push(self.message_id);
        ret.extend(self.destination.as_bytes());
        ret.push(0); // PID
        ret.push(self.dcs.as_u8());
        if self.first_octet.vpf != VpFieldValidity::Invalid {
            ret.push(self.validity_period);
        }
        ret.push(self.user_data.len() as u8);
        ret.extend(self.user_data.clone());
        let tpdu_len = ret.len() - scalen;
        (ret, tpdu_len)
    }
}

/// One encoded SMS-SUBMIT TPDU, as returned by [`encode`].
pub struct EncodedSubmit {
    /// Length argument for `AT+CMGS=<len>`.
    pub tpdu_length: usize,
    /// Hex-encoded PDU bytes to write, followed by Ctrl-Z.
    pub bytes_hex: String,
}

/// Encode `text` to one or more SMS-SUBMIT PDUs addressed to `destination`, starting at
/// message reference `reference` (each part after the first gets `reference.wrapping_add(i)`
/// is NOT used - concatenated parts share one CSMS reference instead, generated internally).
///
/// Chooses GSM 7-bit when every character fits, UCS-2 otherwise, splitting into concatenated
/// parts (153 septets / 134 UCS-2 code units per part) when the message is too long for one
/// SMS, exactly as spec §4.E step 1/3 describes.
pub fn encode(destination: &str, text: &str, reference: u8, send_flash: bool) -> ModemResult<Vec<EncodedSubmit>> {
    let destination = PduAddress::from_number(destination)?;
    let class = if send_flash {
        MessageClass::Silent
    } else {
        MessageClass::StoreToSim
    };
    let segments = if let Some(septets) = gsm7::try_encode_string(text) {
        encode_gsm7_segments(&septets, class)
    } else {
        encode_ucs2_segments(text, class)
    };
    let mut out = vec![];
    for seg in segments {
        let pdu = Pdu {
            sca: None,
            first_octet: PduFirstOctet {
                mti: MessageType::SmsSubmit,
                rd: false,
                vpf: VpFieldValidity::Relative,
                srr: true,
                udhi: seg.udh,
                rp: false,
            },
            message_id: reference,
            destination: destination.clone(),
            dcs: SimplisticDataCodingScheme {
                class,
                encoding: seg.encoding,
            },
            validity_period: 0xA8, // ~1 day, matching common modem defaults.
            user_data: seg.bytes,
        };
        let (bytes, tpdu_length) = pdu.as_bytes();
        // as_bytes() includes the (empty, default-SMSC) prefix octet; CMGS expects the TPDU
        // length, and the transport sends the whole buffer including that leading zero byte
        // so the modem substitutes its stored SMSC.
        out.push(EncodedSubmit {
            tpdu_length,
            bytes_hex: HexData(&bytes).to_string(),
        });
    }
    Ok(out)
}

struct Segment {
    bytes: Vec<u8>,
    udh: bool,
    encoding: MessageEncoding,
}

fn split_buffers<T: Clone>(buf: Vec<T>, max_len: usize) -> Vec<Vec<T>> {
    let mut ret = vec![];
    let mut cbuf = buf;
    while max_len < cbuf.len() {
        let split = cbuf.split_off(max_len);
        let old = std::mem::replace(&mut cbuf, split);
        ret.push(old);
    }
    ret.push(cbuf);
    ret
}

fn encode_gsm7_segments(septets: &[u8], _class: MessageClass) -> Vec<Segment> {
    if septets.len() <= 160 {
        return vec![Segment {
            bytes: gsm7::pack_septets(septets, 0),
            udh: false,
            encoding: MessageEncoding::Gsm7Bit,
        }];
    }
    let bufs = split_buffers(septets.to_vec(), 153);
    let csms_ref = rand::random::<u8>();
    let num_parts = bufs.len() as u8;
    bufs.into_iter()
        .enumerate()
        .map(|(i, buf)| {
            let udh = UserDataHeader {
                components: vec![crate::sms::udh::UdhComponent {
                    id: 0,
                    data: vec![csms_ref, num_parts, i as u8 + 1],
                }],
            };
            let mut ret = udh.as_bytes();
            let padding = (7 - ((ret.len() * 8) % 7)) % 7;
            let enc = gsm7::pack_septets(&buf, padding);
            ret.extend(enc);
            Segment {
                bytes: ret,
                udh: true,
                encoding: MessageEncoding::Gsm7Bit,
            }
        })
        .collect()
}

fn encode_ucs2_segments(text: &str, _class: MessageClass) -> Vec<Segment> {
    let (buf, _, _) = UTF_16BE.encode(text);
    let buf = buf.into_owned();
    if buf.len() <= 140 {
        return vec![Segment {
            bytes: buf,
            udh: false,
            encoding: MessageEncoding::Ucs2,
        }];
    }
    let bufs = split_buffers(buf, 134);
    let csms_ref = rand::random::<u8>();
    let num_parts = bufs.len() as u8;
    bufs.into_iter()
        .enumerate()
        .map(|(i, buf)| {
            let udh = UserDataHeader {
                components: vec![crate::sms::udh::UdhComponent {
                    id: 0,
                    data: vec![csms_ref, num_parts, i as u8 + 1],
                }],
            };
            let mut ret = udh.as_bytes();
            ret.extend(buf);
            Segment {
                bytes: ret,
                udh: true,
                encoding: MessageEncoding::Ucs2,
            }
        })
        .collect()
}

/// Decoded user data: text plus, if present, the concatenation header.
#[derive(Debug, Clone, Default)]
pub struct DecodedUserData {
    pub text: String,
    pub udh: Option<UserDataHeader>,
}

fn decode_user_data(
    bytes: &[u8],
    udhi: bool,
    encoding: MessageEncoding,
    user_data_septets: u8,
) -> ModemResult<DecodedUserData> {
    let mut padding = 0;
    let mut start = 0;
    let mut udh = None;
    if udhi {
        let udhl = *bytes.first().ok_or(ModemError::InvalidPdu("UDHI set but no data"))? as usize;
        padding = (7 - (((udhl + 1) * 8) % 7)) % 7;
        start = udhl + 1;
        if bytes.len() < start {
            return Err(ModemError::InvalidPdu("UDHL goes past end of data"));
        }
        udh = Some(UserDataHeader::try_from(&bytes[1..start])?);
    }
    if bytes.get(start).is_none() {
        return Ok(DecodedUserData {
            text: String::new(),
            udh,
        });
    }
    match encoding {
        MessageEncoding::Gsm7Bit => {
            let septets = gsm7::unpack_septets(&bytes[start..], padding, user_data_septets as usize);
            Ok(DecodedUserData {
                text: gsm7::decode_string(&septets),
                udh,
            })
        }
        MessageEncoding::Ucs2 => {
            let (text, _, _) = UTF_16BE.decode(&bytes[start..]);
            Ok(DecodedUserData {
                text: text.into_owned(),
                udh,
            })
        }
        other => Err(ModemError::UnsupportedEncoding(other, bytes.to_vec())),
    }
}

/// A decoded `SMS-DELIVER` PDU (an incoming text message).
#[derive(Debug, Clone)]
pub struct DeliverPdu {
    pub originating_address: PduAddress,
    pub smsc: Option<PduAddress>,
    pub dcs: SimplisticDataCodingScheme,
    pub timestamp_raw: [u8; 7],
    pub user_data: DecodedUserData,
}
impl DeliverPdu {
    pub fn text(&self) -> &str {
        &self.user_data.text
    }
    pub fn number(&self) -> String {
        self.originating_address.to_string()
    }
}

/// A decoded `SMS-STATUS-REPORT` PDU.
#[derive(Debug, Clone)]
pub struct StatusReportPdu {
    pub reference: u8,
    pub recipient_address: PduAddress,
    pub sent_time_raw: [u8; 7],
    pub discharge_time_raw: [u8; 7],
    /// 0 = delivered, 68 = failed, per 3GPP TS 23.040 §9.2.3.15 (spec §3).
    pub status: u8,
}
impl StatusReportPdu {
    pub fn delivered(&self) -> bool {
        self.status == 0
    }
}

/// One of the PDU variants this driver can receive.
#[derive(Debug, Clone)]
pub enum DecodedPdu {
    Deliver(DeliverPdu),
    StatusReport(StatusReportPdu),
}

/// Decode a hex-encoded PDU as read back from `AT+CMGR`/`AT+CMGL`/a `+CDS` URC.
pub fn decode(hex: &str) -> ModemResult<DecodedPdu> {
    let bytes = HexData::decode(hex)?;
    let (smsc, consumed) = if bytes.first() == Some(&0) {
        (None, 1)
    } else {
        let (addr, len) = PduAddress::parse(&bytes)?;
        (Some(addr), len)
    };
    let first_octet = *bytes
        .get(consumed)
        .ok_or(ModemError::InvalidPdu("PDU truncated before first octet"))?;
    let mti = first_octet & 0b0000_0011;
    let udhi = first_octet & 0b0100_0000 != 0;
    let mut offset = consumed + 1;
    match mti {
        0b00 => {
            let (originating_address, len) = PduAddress::parse(&bytes[offset..])?;
            offset += len;
            offset += 1; // PID
            let dcs = SimplisticDataCodingScheme::from_u8(
                *bytes.get(offset).ok_or(ModemError::InvalidPdu("PDU truncated at DCS"))?,
            );
            offset += 1;
            let mut timestamp_raw = [0u8; 7];
            let ts = bytes
                .get(offset..offset + 7)
                .ok_or(ModemError::InvalidPdu("PDU truncated at timestamp"))?;
            timestamp_raw.copy_from_slice(ts);
            offset += 7;
            let udl = *bytes.get(offset).ok_or(ModemError::InvalidPdu("PDU truncated at UDL"))?;
            offset += 1;
            let ud = bytes.get(offset..).unwrap_or(&[]);
            let user_data = decode_user_data(ud, udhi, dcs.encoding, udl)?;
            Ok(DecodedPdu::Deliver(DeliverPdu {
                originating_address,
                smsc,
                dcs,
                timestamp_raw,
                user_data,
            }))
        }
        0b10 => {
            let reference = *bytes.get(offset).ok_or(ModemError::InvalidPdu("PDU truncated at reference"))?;
            offset += 1;
            let (recipient_address, len) = PduAddress::parse(&bytes[offset..])?;
            offset += len;
            let mut sent_time_raw = [0u8; 7];
            sent_time_raw.copy_from_slice(
                bytes
                    .get(offset..offset + 7)
                    .ok_or(ModemError::InvalidPdu("PDU truncated at sent time"))?,
            );
            offset += 7;
            let mut discharge_time_raw = [0u8; 7];
            discharge_time_raw.copy_from_slice(
                bytes
                    .get(offset..offset + 7)
                    .ok_or(ModemError::InvalidPdu("PDU truncated at discharge time"))?,
            );
            offset += 7;
            let status = *bytes.get(offset).ok_or(ModemError::InvalidPdu("PDU truncated at status"))?;
            Ok(DecodedPdu::StatusReport(StatusReportPdu {
                reference,
                recipient_address,
                sent_time_raw,
                discharge_time_raw,
                status,
            }))
        }
        _ => Err(ModemError::InvalidPdu("unsupported PDU message type")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_short_gsm7_single_segment() {
        let segs = encode("+15551234", "hello", 42, false).unwrap();
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn encode_long_message_splits() {
        let long: String = std::iter::repeat('a').take(200).collect();
        let segs = encode("+15551234", &long, 1, false).unwrap();
        assert!(segs.len() > 1);
    }

    #[test]
    fn hex_round_trip() {
        let data = vec![0x01, 0xAB, 0xFF];
        let hex = HexData(&data).to_string();
        assert_eq!(hex, "01ABFF");
        assert_eq!(HexData::decode(&hex).unwrap(), data);
    }

    #[test]
    fn phone_number_round_trip() {
        let addr = PduAddress::from_number("+15551234").unwrap();
        let bytes = addr.as_bytes();
        let (parsed, _) = PduAddress::parse(&bytes).unwrap();
        assert_eq!(parsed.to_string(), "+15551234");
    }
}
