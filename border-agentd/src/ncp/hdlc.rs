//! HDLC-lite framing used on the serial link to the coprocessor.

use super::spinel::MAX_FRAME_SIZE;

const FLAG_SEQUENCE: u8 = 0x7E;
const ESCAPE_SEQUENCE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

const FCS_INIT: u16 = 0xFFFF;
const FCS_GOOD: u16 = 0xF0B8;
const FCS_POLY: u16 = 0x8408;

/// Largest unescaped frame plus its FCS trailer.
const MAX_BUFFERED: usize = MAX_FRAME_SIZE + 2;

fn needs_escape(byte: u8) -> bool {
    matches!(byte, FLAG_SEQUENCE | ESCAPE_SEQUENCE | 0x11 | 0x13 | 0xF8)
}

/// FCS-16 (X.25), reflected.
fn fcs_update(mut fcs: u16, byte: u8) -> u16 {
    fcs ^= u16::from(byte);
    for _ in 0..8 {
        fcs = if fcs & 1 != 0 {
            (fcs >> 1) ^ FCS_POLY
        } else {
            fcs >> 1
        };
    }
    fcs
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if needs_escape(byte) {
        out.push(ESCAPE_SEQUENCE);
        out.push(byte ^ ESCAPE_XOR);
    } else {
        out.push(byte);
    }
}

/// Wrap one spinel frame for the wire.
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() * 2 + 6);
    let mut fcs = FCS_INIT;

    out.push(FLAG_SEQUENCE);
    for &byte in frame {
        fcs = fcs_update(fcs, byte);
        push_escaped(&mut out, byte);
    }

    let fcs = !fcs;
    for byte in fcs.to_le_bytes() {
        push_escaped(&mut out, byte);
    }
    out.push(FLAG_SEQUENCE);

    out
}

/// Incremental decoder fed with whatever the serial read returned.
#[derive(Debug)]
pub struct HdlcDecoder {
    buf: Vec<u8>,
    escaped: bool,
    fcs: u16,
    /// Set after an overlong frame; bytes are dropped until the next flag.
    discarding: bool,
}

impl Default for HdlcDecoder {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            escaped: false,
            fcs: FCS_INIT,
            discarding: false,
        }
    }
}

impl HdlcDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete frame with a valid FCS.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in bytes {
            match byte {
                FLAG_SEQUENCE => {
                    if let Some(frame) = self.finish_frame() {
                        frames.push(frame);
                    }
                }
                _ if self.discarding => {}
                ESCAPE_SEQUENCE => self.escaped = true,
                _ if self.buf.len() >= MAX_BUFFERED => {
                    tracing::warn!("Dropping HDLC frame longer than {} bytes", MAX_BUFFERED);
                    self.buf = Vec::new();
                    self.escaped = false;
                    self.fcs = FCS_INIT;
                    self.discarding = true;
                }
                _ => {
                    let byte = if self.escaped {
                        self.escaped = false;
                        byte ^ ESCAPE_XOR
                    } else {
                        byte
                    };
                    self.fcs = fcs_update(self.fcs, byte);
                    self.buf.push(byte);
                }
            }
        }

        frames
    }

    fn finish_frame(&mut self) -> Option<Vec<u8>> {
        let buf = std::mem::take(&mut self.buf);
        let fcs = std::mem::replace(&mut self.fcs, FCS_INIT);
        let escaped = std::mem::replace(&mut self.escaped, false);
        if std::mem::replace(&mut self.discarding, false) {
            return None;
        }

        if buf.is_empty() {
            return None;
        }
        if escaped || buf.len() < 2 {
            tracing::warn!("Dropping truncated HDLC frame ({} bytes)", buf.len());
            return None;
        }
        if fcs != FCS_GOOD {
            tracing::warn!("Dropping HDLC frame with bad FCS ({} bytes)", buf.len());
            return None;
        }

        let mut frame = buf;
        frame.truncate(frame.len() - 2);
        Some(frame)
    }
}
