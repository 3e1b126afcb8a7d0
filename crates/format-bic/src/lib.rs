//! PDP-11 absolute loader ("BIC") paper tape format.
//!
//! A tape is a sequence of records. Each record starts with a 6-byte
//! header `{0x01, 0x00, count_lo, count_hi, addr_lo, addr_hi}` where
//! `count` covers the header itself, followed by `count - 6` payload
//! bytes and a checksum byte. The checksum is chosen so that the sum of
//! all bytes from `count_lo` through the checksum is 0 modulo 256.
//!
//! A record with `count == 6` carries no data: if its address is 1 it
//! terminates the tape, any other address sets the program start address.

/// Leader byte opening every record.
const RECORD_MARK: u8 = 0x01;

/// Header length, included in the record's count field.
const HEADER_LEN: usize = 6;

/// One data record: a byte run destined for a load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRecord {
    /// Virtual address the first payload byte loads at.
    pub addr: u16,
    /// Payload bytes, loaded at consecutive addresses.
    pub data: Vec<u8>,
}

/// A parsed absolute loader tape.
#[derive(Debug, Clone, Default)]
pub struct BicFile {
    /// Data records in tape order.
    pub records: Vec<LoadRecord>,
    /// Start PC from a count-6 record with address ≠ 1, if any.
    pub start: Option<u16>,
}

impl BicFile {
    /// Parse a tape from raw bytes.
    ///
    /// Parsing stops at a terminator record (count 6, address 1) or at
    /// end of input. Stray zero padding between records is skipped, as
    /// real tapes carry blank leader/trailer frames.
    ///
    /// # Errors
    ///
    /// Returns an error on a truncated record, a bad record mark, or a
    /// checksum mismatch.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let mut tape = Self::default();
        let mut offset = 0;

        loop {
            // Skip blank leader frames
            while offset < data.len() && data[offset] == 0 {
                offset += 1;
            }
            if offset >= data.len() {
                break;
            }

            if data[offset] != RECORD_MARK {
                return Err(format!(
                    "Bad record mark ${:02X} at offset {offset} (expected $01)",
                    data[offset]
                ));
            }
            if offset + HEADER_LEN > data.len() {
                return Err(format!("Truncated record header at offset {offset}"));
            }

            let header = &data[offset..offset + HEADER_LEN];
            let count = usize::from(header[2]) | (usize::from(header[3]) << 8);
            let addr = u16::from(header[4]) | (u16::from(header[5]) << 8);

            if count < HEADER_LEN {
                return Err(format!(
                    "Record at offset {offset} has count {count}, minimum is {HEADER_LEN}"
                ));
            }

            let payload_len = count - HEADER_LEN;
            // Payload plus the trailing checksum byte must be present
            if offset + count + 1 > data.len() {
                return Err(format!(
                    "Truncated record at offset {offset}: need {} bytes, only {} remain",
                    count + 1,
                    data.len() - offset
                ));
            }

            // Checksum covers count, address, payload and the checksum byte itself
            let sum: u8 = data[offset + 2..offset + count + 1]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            if sum != 0 {
                return Err(format!(
                    "Checksum mismatch in record at offset {offset} (residue ${sum:02X})"
                ));
            }

            if payload_len == 0 {
                if addr == 1 {
                    break; // terminator
                }
                tape.start = Some(addr);
            } else {
                tape.records.push(LoadRecord {
                    addr,
                    data: data[offset + HEADER_LEN..offset + count].to_vec(),
                });
            }

            offset += count + 1;
        }

        Ok(tape)
    }

    /// Encode the tape back to bytes, ending with a terminator record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for record in &self.records {
            encode_record(&mut out, record.addr, &record.data);
        }
        if let Some(start) = self.start {
            encode_record(&mut out, start, &[]);
        }
        encode_record(&mut out, 1, &[]); // terminator
        out
    }

    /// Total number of payload bytes across all records.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.records.iter().map(|r| r.data.len()).sum()
    }
}

/// Append one record (header, payload, checksum) to `out`.
fn encode_record(out: &mut Vec<u8>, addr: u16, data: &[u8]) {
    let count = (HEADER_LEN + data.len()) as u16;
    let header = [
        RECORD_MARK,
        0x00,
        count as u8,
        (count >> 8) as u8,
        addr as u8,
        (addr >> 8) as u8,
    ];
    out.extend_from_slice(&header);
    out.extend_from_slice(data);

    let sum: u8 = header[2..]
        .iter()
        .chain(data)
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    out.push(sum.wrapping_neg());
}
