//! User Data Headers (used for concatenated SMS, among other things) embedded in message
//! user data.
use crate::error::{ModemError, ModemResult};
use std::convert::TryFrom;

/// One element of a User Data Header.
#[derive(Debug, Clone)]
pub struct UdhComponent {
    /// Component identifier (e.g. `0` for an 8-bit concatenation reference).
    pub id: u8,
    /// Component payload.
    pub data: Vec<u8>,
}
/// A User Data Header: an ordered sequence of [`UdhComponent`]s.
#[derive(Debug, Clone)]
pub struct UserDataHeader {
    pub components: Vec<UdhComponent>,
}
/// Concatenated-SMS linkage data carried in a UDH.
#[derive(Debug, Clone)]
pub struct ConcatenatedSmsData {
    /// Identifies which logical message this part belongs to.
    pub reference: u16,
    /// Total number of parts in the message.
    pub parts: u8,
    /// This part's 1-based sequence number.
    pub sequence: u8,
}
impl UserDataHeader {
    /// If this header carries concatenation data (component id `0` or `8`), return it.
    pub fn get_concatenated_sms_data(&self) -> Option<ConcatenatedSmsData> {
        for comp in self.components.iter() {
            if comp.id == 0 && comp.data.len() == 3 {
                return Some(ConcatenatedSmsData {
                    reference: comp.data[0] as u16,
                    parts: comp.data[1],
                    sequence: comp.data[2],
                });
            }
            if comp.id == 8 && comp.data.len() == 4 {
                let reference = ((comp.data[0] as u16) << 8) | (comp.data[1] as u16);
                return Some(ConcatenatedSmsData {
                    reference,
                    parts: comp.data[2],
                    sequence: comp.data[3],
                });
            }
        }
        None
    }
    /// Serialize this UDH to wire format, including the leading UDH-Length octet.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut ret = vec![];
        for comp in self.components.iter() {
            ret.push(comp.id);
            ret.push(comp.data.len() as u8);
            ret.extend(comp.data.clone());
        }
        ret.insert(0, ret.len() as u8);
        ret
    }
}
impl<'a> TryFrom<&'a [u8]> for UserDataHeader {
    type Error = ModemError;
    /// Parses a UDH *without* the leading UDH-Length octet (callers slice that off first,
    /// since it's also needed to compute septet padding).
    fn try_from(b: &[u8]) -> ModemResult<Self> {
        let mut offset = 0;
        let mut ret = vec![];
        loop {
            if b.get(offset).is_none() {
                break;
            }
            let id = b[offset];
            offset += 1;
            let len = *b
                .get(offset)
                .ok_or(ModemError::InvalidPdu("UDH component length runs past end of data"))?;
            let end = offset + len as usize + 1;
            offset += 1;
            let last = end - 1;
            if b.get(last).is_none() {
                return Err(ModemError::InvalidPdu("UDH component data runs past end of data"));
            }
            let data = b[offset..end].to_owned();
            offset = end;
            ret.push(UdhComponent { id, data });
        }
        Ok(UserDataHeader { components: ret })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn concat_udh_round_trip() {
        let udh = UserDataHeader {
            components: vec![UdhComponent {
                id: 0,
                data: vec![42, 2, 1],
            }],
        };
        let bytes = udh.as_bytes();
        // strip the UDHL byte before re-parsing, as `TryFrom` expects.
        let reparsed = UserDataHeader::try_from(&bytes[1..]).unwrap();
        let concat = reparsed.get_concatenated_sms_data().unwrap();
        assert_eq!(concat.reference, 42);
        assert_eq!(concat.parts, 2);
        assert_eq!(concat.sequence, 1);
    }
}
