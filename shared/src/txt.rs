use crate::error::{Error, Result};
use crate::protocol::MAX_TXT_ENTRY_SIZE;
use crate::types::TxtEntry;

/// Encode TXT entries as DNS TXT RDATA.
///
/// An empty list encodes as a single empty string, which is the smallest
/// valid TXT RDATA.
pub fn encode_txt_data(entries: &[TxtEntry]) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    for entry in entries {
        let mut len = entry.key.len();
        if !entry.is_boolean {
            len += entry.value.len() + 1;
        }
        if len > MAX_TXT_ENTRY_SIZE {
            return Err(Error::InvalidArgs);
        }

        data.push(len as u8);
        data.extend_from_slice(entry.key.as_bytes());
        if !entry.is_boolean {
            data.push(b'=');
            data.extend_from_slice(&entry.value);
        }
    }

    if data.is_empty() {
        data.push(0);
    }

    Ok(data)
}

/// Decode DNS TXT RDATA. Strings without `=` become boolean attributes.
pub fn decode_txt_data(data: &[u8]) -> Result<Vec<TxtEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let size = data[pos] as usize;
        let start = pos + 1;
        let end = start + size;

        if end > data.len() {
            return Err(Error::Parse);
        }

        let entry = &data[start..end];
        match entry.iter().position(|&b| b == b'=') {
            Some(eq) => entries.push(TxtEntry::new(
                String::from_utf8_lossy(&entry[..eq]),
                &entry[eq + 1..],
            )),
            None if !entry.is_empty() => {
                entries.push(TxtEntry::boolean(String::from_utf8_lossy(entry)));
            }
            None => {}
        }

        pos = end;
    }

    Ok(entries)
}
