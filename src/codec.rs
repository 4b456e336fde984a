//! The `tokio_util` codec used to frame the AT transport: CR/LF delimited lines in, CR/LF
//! wrapped command text out.
use crate::at::{AtCommand, AtResponse};
use crate::error::ModemError;
use crate::parse;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Encodes AT commands into text sent to the modem, and decodes its responses into
/// `AtResponse`s.
///
/// One `decode` call may produce several response lines at once (e.g. an information
/// response followed by its terminating result code) - the caller is responsible for
/// figuring out which lines belong to the command in flight and which are URCs.
pub struct AtCodec;

impl Decoder for AtCodec {
    type Item = Vec<AtResponse>;
    type Error = ModemError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(bytes = ?src, "decoding data");
        // The SMS-body prompt ("> ") never ends with CR/LF, so it would otherwise sit in
        // the buffer forever waiting for a terminator that never comes.
        if src.ends_with(b"> ") {
            let len = src.len();
            let _ = src.split_to(len);
            return Ok(Some(vec![AtResponse::Prompt]));
        }
        let (consumed, data) = match parse::responses(src) {
            Ok((rest, data)) => {
                if data.is_empty() {
                    return Ok(None);
                }
                (src.len() - rest.len(), data)
            }
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(ModemError::Parse),
        };
        let _ = src.split_to(consumed);
        Ok(Some(data))
    }
}
impl Encoder<AtCommand> for AtCodec {
    type Error = ModemError;

    fn encode(&mut self, item: AtCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use bytes::BufMut;

        trace!(command = %item, "sending data");
        let data = format!("\r\n{}\r\n", item);
        let data_len = data.as_bytes().len();
        if data_len > dst.remaining_mut() {
            dst.reserve(data_len * 2);
        }
        dst.put_slice(data.as_bytes());
        Ok(())
    }
}
