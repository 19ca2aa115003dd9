/*
                    RFC 1055 - Protocol

    The SLIP protocol defines two special characters: END and ESC. END is
    octal 300 (decimal 192) and ESC is octal 333 (decimal 219) [...]. To send
    a packet, a SLIP host simply starts sending the data in the packet. If a
    data byte is the same code as END character, a two byte sequence of ESC
    and octal 334 (decimal 220) is sent instead. If it the same as an ESC
    character, an two byte sequence of ESC and octal 335 (decimal 221) is
    sent instead. When the last byte in the packet has been sent, an END
    character is then transmitted.
*/
pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Byte-stuffs `datagram` into a single SLIP frame, delimited by END on
/// both sides. Callers never encode an empty datagram.
pub fn encode(datagram: &[u8]) -> Vec<u8> {
    debug_assert!(!datagram.is_empty());

    let mut frame = Vec::with_capacity(datagram.len() + 2);

    frame.push(END);
    for &b in datagram {
        match b {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            _ => frame.push(b),
        }
    }
    frame.push(END);

    frame
}

/// Resumable SLIP decoder.
///
/// Serial devices hand us arbitrary byte chunks, so a frame (and even an
/// escape sequence) can be split across any number of calls to [`feed`].
/// All per-frame state lives here and is only ever reset by an END byte,
/// never by a chunk boundary.
///
/// [`feed`]: Decoder::feed
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    escape: bool,
    bad: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder::default()
    }

    /// Drives the state machine over `chunk`, appending each completed
    /// datagram to `frames` in the order its closing END was seen.
    ///
    /// Completed datagrams are moved out of the decoder and the per-frame
    /// state is reset before the caller can observe them, so a receiver
    /// that fails while handling a frame leaves the decoder ready for the
    /// next one.
    pub fn feed(&mut self, chunk: &[u8], frames: &mut Vec<Vec<u8>>) {
        for &b in chunk {
            if b == END {
                // End of frame, or the delimiter in front of the next one.
                // Empty and malformed frames are dropped silently.
                if !self.bad && !self.buf.is_empty() {
                    frames.push(std::mem::take(&mut self.buf));
                } else {
                    if self.bad {
                        log::debug!("slip: dropping malformed frame");
                    }
                    self.buf.clear();
                }
                self.escape = false;
                self.bad = false;
                continue;
            }

            if self.bad {
                // Already malformed: ignore everything until the next END.
                continue;
            }

            if self.escape {
                match b {
                    ESC_END => self.buf.push(END),
                    ESC_ESC => self.buf.push(ESC),
                    _ => self.bad = true,
                }
                self.escape = false;
            } else if b == ESC {
                // May stay pending across chunk boundaries.
                self.escape = true;
            } else {
                self.buf.push(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_in_chunks(bytes: &[u8], chunk_len: usize) -> Vec<Vec<u8>> {
        let mut dec = Decoder::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(chunk_len.max(1)) {
            dec.feed(chunk, &mut frames);
        }
        frames
    }

    #[test]
    fn encode_stuffs_special_bytes() {
        assert_eq!(
            encode(&[0xC0, 0x01, 0xDB, 0x02]),
            [0xC0, 0xDB, 0xDC, 0x01, 0xDB, 0xDD, 0x02, 0xC0]
        );
    }

    #[test]
    fn decode_unstuffs_special_bytes() {
        let frames = decode_in_chunks(&[0xC0, 0xDB, 0xDC, 0x01, 0xDB, 0xDD, 0x02, 0xC0], 8);
        assert_eq!(frames, vec![vec![0xC0, 0x01, 0xDB, 0x02]]);
    }

    #[test]
    fn escape_state_survives_chunk_boundary() {
        let mut dec = Decoder::new();
        let mut frames = Vec::new();

        // ESC is the last byte of the first chunk.
        dec.feed(&[END, 0x01, ESC], &mut frames);
        assert!(frames.is_empty());
        dec.feed(&[ESC_END, END], &mut frames);

        assert_eq!(frames, vec![vec![0x01, END]]);
    }

    #[test]
    fn empty_frames_are_silent() {
        let frames = decode_in_chunks(&[END, END, END, 0x41, END, END], 2);
        assert_eq!(frames, vec![vec![0x41]]);
    }

    #[test]
    fn bad_escape_discards_until_next_end() {
        let mut dec = Decoder::new();
        let mut frames = Vec::new();

        // ESC followed by a byte that is neither ESC_END nor ESC_ESC.
        dec.feed(&[END, 0x01, ESC, 0x99, 0x02, 0x03, END], &mut frames);
        assert!(frames.is_empty());

        // The decoder must come back clean for the next frame.
        dec.feed(&[0x42, END], &mut frames);
        assert_eq!(frames, vec![vec![0x42]]);
    }

    #[test]
    fn back_to_back_frames_in_one_chunk() {
        let mut bytes = encode(&[1, 2, 3]);
        bytes.extend_from_slice(&encode(&[4, 5]));

        let frames = decode_in_chunks(&bytes, bytes.len());
        assert_eq!(frames, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    proptest! {
        #[test]
        fn roundtrip_under_any_chunking(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            chunk_len in 1usize..64,
        ) {
            let frames = decode_in_chunks(&encode(&data), chunk_len);
            prop_assert_eq!(frames, vec![data]);
        }

        #[test]
        fn roundtrip_many_frames(
            datagrams in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..64),
                1..8,
            ),
            chunk_len in 1usize..16,
        ) {
            let mut bytes = Vec::new();
            for d in &datagrams {
                bytes.extend_from_slice(&encode(d));
            }

            let frames = decode_in_chunks(&bytes, chunk_len);
            prop_assert_eq!(frames, datagrams);
        }
    }
}
