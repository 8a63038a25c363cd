//! Streaming adapters between byte-oriented message payloads
//! and P-Data PDU traffic.
use std::collections::VecDeque;
use std::io::{Read, Write};

use tracing::warn;

use crate::pdu::{read_pdu, PDataValue, PDataValueType, Pdu, MINIMUM_PDU_SIZE};

/// The PDU type byte, the reserved byte
/// and the PDU length of a P-Data PDU with a single data PDV,
/// plus the PDV item length, context identifier
/// and message control header.
const PREAMBLE_LENGTH: usize = 12;

/// The greatest number of payload bytes
/// which fit in one P-Data PDU of the given PDU length
/// when it carries a single presentation data value.
///
/// A bound below the standard's minimum PDU size
/// is raised to that minimum first;
/// no conforming peer may demand less.
pub fn calculate_max_data_len_single(pdu_len: u32) -> u32 {
    // minus the PDV item length field,
    // minus the context identifier and message control header
    pdu_len.max(MINIMUM_PDU_SIZE) - 4 - 2
}

/// Split a full message payload into presentation data value fragments,
/// each fitting in a P-Data PDU of at most `max_pdu_length` bytes.
///
/// The last fragment has its last bit set.
/// An empty payload still yields one empty terminal fragment,
/// so the peer always sees the end of the message.
pub fn fragment_pdvs(
    presentation_context_id: u8,
    value_type: PDataValueType,
    payload: &[u8],
    max_pdu_length: u32,
) -> Vec<PDataValue> {
    let max_data_len = calculate_max_data_len_single(max_pdu_length) as usize;
    if payload.len() <= max_data_len {
        return vec![PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: payload.to_vec(),
        }];
    }

    let mut chunks = payload.chunks(max_data_len).peekable();
    let mut out = Vec::with_capacity(payload.len() / max_data_len + 1);
    while let Some(chunk) = chunks.next() {
        out.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: chunks.peek().is_none(),
            data: chunk.to_vec(),
        });
    }
    out
}

/// A sink of bytes which writes P-Data PDUs to the underlying stream,
/// fragmenting the payload so that no PDU exceeds the negotiated size.
///
/// Each emitted PDU carries a single presentation data value.
/// The message is terminated when the writer is finished or dropped.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    max_data_len: u32,
    value_type: PDataValueType,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Create a writer for one message's worth of payload bytes
    /// in the given presentation context.
    ///
    /// `max_pdu_length` is the effective maximum PDU length
    /// already negotiated with the peer.
    pub fn new(
        stream: W,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> Self {
        let max_data_len = calculate_max_data_len_single(max_pdu_length);
        let mut buffer = Vec::with_capacity(max_data_len as usize + PREAMBLE_LENGTH);
        // PDU and PDV lengths and the control header
        // are patched in just before each dispatch
        buffer.extend([
            0x04, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            presentation_context_id,
            0x00,
        ]);

        PDataWriter {
            stream,
            max_data_len,
            value_type,
            buffer,
        }
    }

    /// Declare the end of the message,
    /// flushing the remaining payload in a terminal PDV.
    ///
    /// This also happens automatically once the writer is dropped,
    /// but only here can a write failure be observed.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn control_header(&self, is_last: bool) -> u8 {
        let mut header = match self.value_type {
            PDataValueType::Command => 0b01,
            PDataValueType::Data => 0b00,
        };
        if is_last {
            header |= 0b10;
        }
        header
    }

    fn setup_pdata_header(&mut self, is_last: bool) {
        let data_len = (self.buffer.len() - PREAMBLE_LENGTH) as u32;

        // full PDU length, minus the PDU type and reserved bytes
        // and the PDU length field itself
        let pdu_len = data_len + 4 + 2;
        self.buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

        // PDV item length covers the context identifier,
        // the control header and the payload
        let pdv_len = data_len + 2;
        self.buffer[6..10].copy_from_slice(&pdv_len.to_be_bytes());

        self.buffer[11] = self.control_header(is_last);
    }

    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() >= PREAMBLE_LENGTH);
        self.setup_pdata_header(false);
        self.stream.write_all(&self.buffer)?;
        self.buffer.truncate(PREAMBLE_LENGTH);
        Ok(())
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.setup_pdata_header(true);
            self.stream.write_all(&self.buffer)?;
            self.stream.flush()?;
            self.buffer.clear();
        }
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + PREAMBLE_LENGTH;
        if self.buffer.len() + buf.len() <= total_len {
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill up the current PDU and dispatch it,
            // accepting only the bytes which fit
            let accepted = &buf[..total_len - self.buffer.len()];
            self.buffer.extend(accepted);
            self.dispatch_pdu()?;
            Ok(accepted.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // no flushing of partial PDUs, the message boundary matters
        Ok(())
    }
}

impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A source of bytes which collects the payload of one message
/// from incoming P-Data PDUs on the underlying stream.
///
/// Reading yields `Ok(0)` once the terminal presentation data value
/// has been fully consumed.
pub struct PDataReader<R> {
    buffer: VecDeque<u8>,
    stream: R,
    presentation_context_id: Option<u8>,
    max_pdu_length: u32,
    last_pdu: bool,
}

impl<R> PDataReader<R>
where
    R: Read,
{
    pub fn new(stream: R, max_pdu_length: u32) -> Self {
        PDataReader {
            buffer: VecDeque::with_capacity(max_pdu_length as usize),
            stream,
            presentation_context_id: None,
            max_pdu_length,
            last_pdu: false,
        }
    }

    /// The presentation context of the message being read,
    /// known after the first presentation data value arrives.
    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }
}

impl<R> Read for PDataReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.buffer.is_empty() {
            if self.last_pdu {
                return Ok(0);
            }

            let pdu = read_pdu(&mut self.stream, self.max_pdu_length, false)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        match self.presentation_context_id {
                            None => {
                                self.presentation_context_id =
                                    Some(pdv.presentation_context_id)
                            }
                            Some(id) if id != pdv.presentation_context_id => {
                                warn!(
                                    "presentation data value for context {} interleaved in message of context {}",
                                    pdv.presentation_context_id, id
                                );
                            }
                            Some(_) => {}
                        }
                        self.last_pdu = pdv.is_last;
                        self.buffer.extend(pdv.data);
                    }
                }
                pdu => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unexpected PDU {} while reading message data", pdu.short_description()),
                    ))
                }
            }
        }

        let n = std::cmp::min(buf.len(), self.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};

    use crate::pdu::{read_pdu, PDataValueType, Pdu, MINIMUM_PDU_SIZE};

    use super::{calculate_max_data_len_single, fragment_pdvs, PDataReader, PDataWriter};

    #[test]
    fn small_message_goes_in_one_pdu() {
        let mut out = Vec::new();
        let mut writer = PDataWriter::new(&mut out, 1, PDataValueType::Data, MINIMUM_PDU_SIZE);
        writer.write_all(&[0x55; 32]).unwrap();
        writer.finish().unwrap();

        let mut cursor = Cursor::new(&out);
        let pdu = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap();
        let data = match pdu {
            Pdu::PData { data } => data,
            pdu => panic!("unexpected PDU {:?}", pdu),
        };
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].presentation_context_id, 1);
        assert_eq!(data[0].value_type, PDataValueType::Data);
        assert!(data[0].is_last);
        assert_eq!(data[0].data, vec![0x55; 32]);
        // nothing else in the stream
        assert_eq!(cursor.position(), out.len() as u64);
    }

    #[test]
    fn large_message_is_fragmented() {
        let payload = vec![0xC3; MINIMUM_PDU_SIZE as usize * 2];
        let mut out = Vec::new();
        let mut writer = PDataWriter::new(&mut out, 3, PDataValueType::Data, MINIMUM_PDU_SIZE);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let max_data_len = calculate_max_data_len_single(MINIMUM_PDU_SIZE) as usize;
        let mut cursor = Cursor::new(&out);
        let mut collected = Vec::new();
        let mut saw_last = false;
        while !saw_last {
            let pdu = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap();
            let data = match pdu {
                Pdu::PData { data } => data,
                pdu => panic!("unexpected PDU {:?}", pdu),
            };
            for pdv in data {
                assert_eq!(pdv.presentation_context_id, 3);
                assert!(pdv.data.len() <= max_data_len);
                saw_last = pdv.is_last;
                collected.extend(pdv.data);
            }
        }
        assert_eq!(collected, payload);
    }

    #[test]
    fn reader_reassembles_writer_output() {
        let payload: Vec<u8> = (0..MINIMUM_PDU_SIZE * 3).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let mut writer = PDataWriter::new(&mut out, 5, PDataValueType::Command, MINIMUM_PDU_SIZE);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let mut reader = PDataReader::new(Cursor::new(&out), MINIMUM_PDU_SIZE);
        let mut collected = Vec::new();
        reader.read_to_end(&mut collected).unwrap();
        assert_eq!(collected, payload);
        assert_eq!(reader.presentation_context_id(), Some(5));
    }

    #[test]
    fn tiny_declared_maximum_is_raised_to_the_standard_floor() {
        // a MaxLength below the standard's minimum PDU size
        // must not underflow the fragment size computation
        assert_eq!(
            calculate_max_data_len_single(4),
            calculate_max_data_len_single(MINIMUM_PDU_SIZE)
        );
        let pdvs = fragment_pdvs(1, PDataValueType::Command, &[0u8; 16], 4);
        assert_eq!(pdvs.len(), 1);
        assert!(pdvs[0].is_last);
        assert_eq!(pdvs[0].data.len(), 16);
    }

    #[test]
    fn fragmenting_empty_payload_yields_terminal_fragment() {
        let pdvs = fragment_pdvs(1, PDataValueType::Command, &[], MINIMUM_PDU_SIZE);
        assert_eq!(pdvs.len(), 1);
        assert!(pdvs[0].is_last);
        assert!(pdvs[0].data.is_empty());
    }

    #[test]
    fn fragments_respect_the_pdu_bound() {
        let payload = vec![0u8; MINIMUM_PDU_SIZE as usize + 100];
        let pdvs = fragment_pdvs(1, PDataValueType::Data, &payload, MINIMUM_PDU_SIZE);
        assert!(pdvs.len() > 1);
        let max_data_len = calculate_max_data_len_single(MINIMUM_PDU_SIZE) as usize;
        let total: usize = pdvs.iter().map(|pdv| pdv.data.len()).sum();
        assert_eq!(total, payload.len());
        for (i, pdv) in pdvs.iter().enumerate() {
            assert!(pdv.data.len() <= max_data_len);
            assert_eq!(pdv.is_last, i == pdvs.len() - 1);
        }
    }
}
