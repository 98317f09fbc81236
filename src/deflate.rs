use crate::error::Error;
use crate::extensions::{Extension, ExtensionBuilder, ExtensionOffer};
use crate::frame::Frame;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::cmp;

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

// Every deflate block flushed with Z_SYNC_FLUSH ends with an empty stored
// block; RFC 7692 removes it from the wire and the receiver puts it back.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Configuration and negotiation entry point for the permessage-deflate
/// extension (RFC 7692).
///
/// Window bits trade memory for compression ratio: larger windows (up to 15)
/// compress better, smaller ones (down to 9) are cheaper. The
/// no-context-takeover flags force the corresponding compressor to reset its
/// sliding window after every message.
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    /// Messages smaller than this go out uncompressed.
    pub min_frame_size_to_compress: usize,
    /// Hard cap on a single inflated message, guarding against deflate bombs.
    pub max_decompressed_size: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        DeflateConfig {
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            min_frame_size_to_compress: 16,
            max_decompressed_size: 64 << 20,
        }
    }
}

fn validate_window_bits(bits: u8) -> Result<u8, Error> {
    if (9..=15).contains(&bits) {
        Ok(bits)
    } else {
        Err(Error::InvalidMaxWindowBits)
    }
}

fn parse_window_bits(value: &Option<String>) -> Result<Option<u8>, Error> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let bits = raw.parse::<u8>().map_err(|_| Error::InvalidMaxWindowBits)?;
            Ok(Some(validate_window_bits(bits)?))
        }
    }
}

impl ExtensionBuilder for DeflateConfig {
    fn name(&self) -> &'static str {
        PERMESSAGE_DEFLATE
    }

    fn uses_rsv1(&self) -> bool {
        true
    }

    fn client_offer(&self) -> ExtensionOffer {
        let mut offer = ExtensionOffer::new(PERMESSAGE_DEFLATE);
        if self.server_max_window_bits < 15 {
            offer = offer.param(
                SERVER_MAX_WINDOW_BITS,
                Some(self.server_max_window_bits.to_string()),
            );
        }
        // A bare client_max_window_bits token tells the server we can work
        // with whatever limit it picks.
        if self.client_max_window_bits < 15 {
            offer = offer.param(
                CLIENT_MAX_WINDOW_BITS,
                Some(self.client_max_window_bits.to_string()),
            );
        } else {
            offer = offer.param(CLIENT_MAX_WINDOW_BITS, None);
        }
        if self.server_no_context_takeover {
            offer = offer.param(SERVER_NO_CONTEXT_TAKEOVER, None);
        }
        if self.client_no_context_takeover {
            offer = offer.param(CLIENT_NO_CONTEXT_TAKEOVER, None);
        }
        offer
    }

    fn accept_offer(
        &self,
        offer: &ExtensionOffer,
    ) -> Result<Option<(ExtensionOffer, Box<dyn Extension>)>, Error> {
        validate_window_bits(self.server_max_window_bits)?;
        validate_window_bits(self.client_max_window_bits)?;

        // The window the client will compress with. A bare token means the
        // client accepts any limit we answer with; an absent token means the
        // client is stuck at 15.
        let client_offered = offer.get(CLIENT_MAX_WINDOW_BITS);
        let client_bits = match client_offered {
            None => 15,
            Some(value) => match parse_window_bits(value)? {
                Some(bits) => cmp::min(bits, self.client_max_window_bits),
                None => self.client_max_window_bits,
            },
        };

        // The window we will compress with, clamped to the client's request.
        let server_bits = match parse_window_bits(
            offer.get(SERVER_MAX_WINDOW_BITS).unwrap_or(&None),
        )? {
            Some(bits) => cmp::min(bits, self.server_max_window_bits),
            None => self.server_max_window_bits,
        };

        let server_no_context_takeover =
            self.server_no_context_takeover || offer.has(SERVER_NO_CONTEXT_TAKEOVER);
        let client_no_context_takeover =
            self.client_no_context_takeover || offer.has(CLIENT_NO_CONTEXT_TAKEOVER);

        let mut response = ExtensionOffer::new(PERMESSAGE_DEFLATE);
        if server_bits < 15 {
            response = response.param(SERVER_MAX_WINDOW_BITS, Some(server_bits.to_string()));
        }
        // Mirror the effective client window whenever the client put the
        // parameter on the table with a concrete value, or we clamped it.
        if matches!(client_offered, Some(Some(_))) || client_bits < 15 {
            response = response.param(CLIENT_MAX_WINDOW_BITS, Some(client_bits.to_string()));
        }
        if server_no_context_takeover {
            response = response.param(SERVER_NO_CONTEXT_TAKEOVER, None);
        }
        if client_no_context_takeover {
            response = response.param(CLIENT_NO_CONTEXT_TAKEOVER, None);
        }

        // Server compresses with the server window, inflates client data with
        // the client window.
        let extension = PerMessageDeflate::new(
            self,
            server_bits,
            server_no_context_takeover,
            client_bits,
            client_no_context_takeover,
        );
        Ok(Some((response, Box::new(extension))))
    }

    fn accept_response(&self, response: &ExtensionOffer) -> Result<Box<dyn Extension>, Error> {
        validate_window_bits(self.server_max_window_bits)?;
        validate_window_bits(self.client_max_window_bits)?;

        let server_bits =
            match parse_window_bits(response.get(SERVER_MAX_WINDOW_BITS).unwrap_or(&None))? {
                Some(bits) => bits,
                None => 15,
            };
        let client_bits =
            match parse_window_bits(response.get(CLIENT_MAX_WINDOW_BITS).unwrap_or(&None))? {
                Some(bits) => cmp::min(bits, self.client_max_window_bits),
                None => self.client_max_window_bits,
            };

        // Resetting our own compressor is always safe, so a locally configured
        // client_no_context_takeover holds even if the server didn't echo it.
        // The decompressor only resets when the server committed to resetting.
        let client_no_context_takeover =
            self.client_no_context_takeover || response.has(CLIENT_NO_CONTEXT_TAKEOVER);
        let server_no_context_takeover = response.has(SERVER_NO_CONTEXT_TAKEOVER);

        Ok(Box::new(PerMessageDeflate::new(
            self,
            client_bits,
            client_no_context_takeover,
            server_bits,
            server_no_context_takeover,
        )))
    }
}

enum SendState {
    /// The next data frame starts a new outbound message.
    MessageStart,
    /// Mid-message, compressing each fragment.
    Compressing,
    /// Mid-message, the first fragment was under the compression threshold.
    PassThrough,
}

/// One negotiated permessage-deflate instance. The compressor handles the
/// send direction, the decompressor the receive direction; each owns its own
/// sliding-window context.
pub struct PerMessageDeflate {
    compressor: Compressor,
    decompressor: Decompressor,
    min_frame_size_to_compress: usize,
    max_decompressed_size: usize,
    send_state: SendState,
}

impl PerMessageDeflate {
    fn new(
        config: &DeflateConfig,
        compress_bits: u8,
        compress_reset: bool,
        decompress_bits: u8,
        decompress_reset: bool,
    ) -> Self {
        Self {
            compressor: Compressor::new(compress_bits, compress_reset),
            decompressor: Decompressor::new(decompress_bits, decompress_reset),
            min_frame_size_to_compress: config.min_frame_size_to_compress,
            max_decompressed_size: config.max_decompressed_size,
            send_state: SendState::MessageStart,
        }
    }
}

impl Extension for PerMessageDeflate {
    fn process_to_send(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }

        match self.send_state {
            SendState::MessageStart => {
                // The first fragment decides for the whole message.
                if frame.payload.len() < self.min_frame_size_to_compress {
                    if !frame.final_fragment {
                        self.send_state = SendState::PassThrough;
                    }
                    return Ok(frame);
                }

                frame.rsv1 = true;
                frame.payload = self.compressor.compress(&frame.payload)?;
                if frame.final_fragment {
                    self.compressor.finish_message(&mut frame.payload);
                } else {
                    self.send_state = SendState::Compressing;
                }
                Ok(frame)
            }
            SendState::Compressing => {
                frame.payload = self.compressor.compress(&frame.payload)?;
                if frame.final_fragment {
                    self.compressor.finish_message(&mut frame.payload);
                    self.send_state = SendState::MessageStart;
                }
                Ok(frame)
            }
            SendState::PassThrough => {
                if frame.final_fragment {
                    self.send_state = SendState::MessageStart;
                }
                Ok(frame)
            }
        }
    }

    fn process_received(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        if frame.opcode.is_control() || !frame.rsv1 {
            return Ok(frame);
        }

        frame.rsv1 = false;
        frame.payload = self
            .decompressor
            .decompress(&frame.payload, self.max_decompressed_size)?;
        Ok(frame)
    }
}

struct Compressor {
    compress: Compress,
    reset_context: bool,
}

impl Compressor {
    fn new(window_bits: u8, reset_context: bool) -> Self {
        Self {
            compress: Compress::new_with_window_bits(Compression::default(), false, window_bits),
            reset_context,
        }
    }

    /// Runs one fragment through the deflater with a sync flush, so the
    /// output is a self-delimiting block the peer can inflate immediately.
    fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut output = Vec::with_capacity(cmp::max(input.len() / 2, 64));
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(cmp::max(input.len() / 2, 256));
            }

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|source| Error::CompressionError(source.to_string()))?;
            consumed += (self.compress.total_in() - before_in) as usize;

            match status {
                Status::Ok | Status::BufError => {
                    // The sync flush is fully drained once no further output
                    // is produced for the remaining (empty) input.
                    if consumed == input.len() && self.compress.total_out() == before_out {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        Ok(output)
    }

    /// Final-fragment bookkeeping: drop the sync-flush trailer from the wire
    /// payload and reset the sliding window when no-context-takeover was
    /// negotiated for this direction.
    fn finish_message(&mut self, payload: &mut Vec<u8>) {
        if payload.ends_with(&DEFLATE_TRAILER) {
            payload.truncate(payload.len() - DEFLATE_TRAILER.len());
        }
        if self.reset_context {
            self.compress.reset();
        }
    }
}

struct Decompressor {
    decompress: Decompress,
    reset_context: bool,
}

impl Decompressor {
    fn new(window_bits: u8, reset_context: bool) -> Self {
        Self {
            decompress: Decompress::new_with_window_bits(false, window_bits),
            reset_context,
        }
    }

    /// Inflates one collapsed message. The sync-flush trailer the sender
    /// stripped is appended back before inflating, and output is bounded by
    /// `max_size`.
    fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::with_capacity(input.len() + DEFLATE_TRAILER.len());
        payload.extend_from_slice(input);
        payload.extend_from_slice(&DEFLATE_TRAILER);

        let mut output = Vec::with_capacity(cmp::min(payload.len() * 2, max_size + 1));
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(cmp::max(payload.len(), 4096));
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(&payload[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|source| Error::DecompressionError(source.to_string()))?;
            consumed += (self.decompress.total_in() - before_in) as usize;

            if output.len() > max_size {
                return Err(Error::MaxDecompressedSize);
            }

            match status {
                Status::Ok | Status::BufError => {
                    if consumed == payload.len() && self.decompress.total_out() == before_out {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        if self.reset_context {
            self.decompress.reset(false);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use std::sync::Arc;

    fn deflate_pair() -> (Box<dyn Extension>, Box<dyn Extension>) {
        let config = DeflateConfig::default();
        let offer = config.client_offer();
        let (response, server) = config.accept_offer(&offer).unwrap().unwrap();
        let client = config.accept_response(&response).unwrap();
        (client, server)
    }

    #[test]
    fn offer_carries_configured_windows() {
        let config = DeflateConfig {
            client_max_window_bits: 10,
            server_max_window_bits: 12,
            ..Default::default()
        };
        let offer = config.client_offer();
        assert_eq!(offer.get("client_max_window_bits"), Some(&Some("10".into())));
        assert_eq!(offer.get("server_max_window_bits"), Some(&Some("12".into())));
    }

    #[test]
    fn server_mirrors_client_window_request() {
        let offer = ExtensionOffer::new(PERMESSAGE_DEFLATE)
            .param(CLIENT_MAX_WINDOW_BITS, Some("10".to_string()));
        let config = DeflateConfig::default();
        let (response, _) = config.accept_offer(&offer).unwrap().unwrap();
        assert_eq!(response.get(CLIENT_MAX_WINDOW_BITS), Some(&Some("10".into())));
    }

    #[test]
    fn server_clamps_to_its_own_limit() {
        let offer = ExtensionOffer::new(PERMESSAGE_DEFLATE)
            .param(SERVER_MAX_WINDOW_BITS, Some("14".to_string()));
        let config = DeflateConfig {
            server_max_window_bits: 11,
            ..Default::default()
        };
        let (response, _) = config.accept_offer(&offer).unwrap().unwrap();
        assert_eq!(response.get(SERVER_MAX_WINDOW_BITS), Some(&Some("11".into())));
    }

    #[test]
    fn no_context_takeover_flags_are_preserved() {
        let offer = ExtensionOffer::new(PERMESSAGE_DEFLATE)
            .param(SERVER_NO_CONTEXT_TAKEOVER, None)
            .param(CLIENT_NO_CONTEXT_TAKEOVER, None);
        let config = DeflateConfig::default();
        let (response, _) = config.accept_offer(&offer).unwrap().unwrap();
        assert!(response.has(SERVER_NO_CONTEXT_TAKEOVER));
        assert!(response.has(CLIENT_NO_CONTEXT_TAKEOVER));
    }

    #[test]
    fn window_bits_out_of_range_are_rejected() {
        let offer = ExtensionOffer::new(PERMESSAGE_DEFLATE)
            .param(SERVER_MAX_WINDOW_BITS, Some("8".to_string()));
        let config = DeflateConfig::default();
        assert!(config.accept_offer(&offer).is_err());

        assert!(parse_window_bits(&Some("16".to_string())).is_err());
        assert!(parse_window_bits(&Some("banana".to_string())).is_err());
    }

    #[test]
    fn compress_roundtrip_single_frame() {
        let (mut client, mut server) = deflate_pair();
        let text = b"Hello, testing this is compressed".to_vec();

        let sent = client
            .process_to_send(Frame::new(true, OpCode::Text, text.clone()))
            .unwrap();
        assert!(sent.rsv1);
        assert_ne!(sent.payload, text);

        let received = server.process_received(sent).unwrap();
        assert!(!received.rsv1);
        assert_eq!(received.payload, text);
    }

    #[test]
    fn small_messages_skip_compression() {
        let (mut client, _) = deflate_pair();
        let sent = client
            .process_to_send(Frame::new(true, OpCode::Text, b"hi".to_vec()))
            .unwrap();
        assert!(!sent.rsv1);
        assert_eq!(sent.payload, b"hi");
    }

    #[test]
    fn infinite_threshold_matches_uncompressed_path() {
        let config = DeflateConfig {
            min_frame_size_to_compress: usize::MAX,
            ..Default::default()
        };
        let offer = config.client_offer();
        let (response, mut server) = config.accept_offer(&offer).unwrap().unwrap();
        let mut client = config.accept_response(&response).unwrap();

        let text = b"long enough that the size check alone would compress it".to_vec();
        let sent = client
            .process_to_send(Frame::new(true, OpCode::Text, text.clone()))
            .unwrap();
        assert!(!sent.rsv1);
        assert_eq!(sent.payload, text);
        assert_eq!(server.process_received(sent).unwrap().payload, text);
    }

    #[test]
    fn fragmented_message_sets_rsv1_on_first_frame_only() {
        let (mut client, mut server) = deflate_pair();

        let first = client
            .process_to_send(Frame::new(
                false,
                OpCode::Text,
                b"Hello Hello Hello ".to_vec(),
            ))
            .unwrap();
        let last = client
            .process_to_send(Frame::new(true, OpCode::Continue, b"World World World!".to_vec()))
            .unwrap();
        assert!(first.rsv1);
        assert!(!last.rsv1);

        // The reader collapses fragments before the receive pipeline runs.
        let mut collapsed = Frame::new(true, OpCode::Text, first.payload);
        collapsed.rsv1 = true;
        collapsed.payload.extend_from_slice(&last.payload);

        let received = server.process_received(collapsed).unwrap();
        assert_eq!(received.payload, b"Hello Hello Hello World World World!");
    }

    #[test]
    fn context_carries_across_messages_by_default() {
        let (mut client, mut server) = deflate_pair();
        let text = b"repetitive payload repetitive payload".to_vec();

        let first = client
            .process_to_send(Frame::new(true, OpCode::Text, text.clone()))
            .unwrap();
        let second = client
            .process_to_send(Frame::new(true, OpCode::Text, text.clone()))
            .unwrap();
        // The second message references the retained window, so it shrinks.
        assert!(second.payload.len() < first.payload.len());

        assert_eq!(server.process_received(first).unwrap().payload, text);
        assert_eq!(server.process_received(second).unwrap().payload, text);
    }

    #[test]
    fn no_context_takeover_roundtrip() {
        let config = DeflateConfig {
            client_no_context_takeover: true,
            server_no_context_takeover: true,
            ..Default::default()
        };
        let offer = config.client_offer();
        let (response, mut server) = config.accept_offer(&offer).unwrap().unwrap();
        let mut client = config.accept_response(&response).unwrap();

        let text = b"repetitive payload repetitive payload".to_vec();
        for _ in 0..3 {
            let sent = client
                .process_to_send(Frame::new(true, OpCode::Text, text.clone()))
                .unwrap();
            let received = server.process_received(sent).unwrap();
            assert_eq!(received.payload, text);
        }
    }

    #[test]
    fn decompression_cap_is_enforced() {
        let config = DeflateConfig {
            max_decompressed_size: 64,
            ..Default::default()
        };
        let offer = config.client_offer();
        let (response, mut server) = config.accept_offer(&offer).unwrap().unwrap();
        let mut client = config.accept_response(&response).unwrap();

        let big = vec![0u8; 4096];
        let sent = client
            .process_to_send(Frame::new(true, OpCode::Binary, big))
            .unwrap();
        match server.process_received(sent) {
            Err(Error::MaxDecompressedSize) => {}
            other => panic!("expected MaxDecompressedSize, got {:?}", other.map(|f| f.payload.len())),
        }
    }

    #[test]
    fn garbage_payload_fails_decompression() {
        let (_, mut server) = deflate_pair();
        let mut frame = Frame::new(true, OpCode::Binary, vec![0xde, 0xad, 0xbe, 0xef]);
        frame.rsv1 = true;
        assert!(server.process_received(frame).is_err());
    }

    #[test]
    fn negotiate_through_pipeline_helpers() {
        let builders: Vec<Arc<dyn ExtensionBuilder>> =
            vec![Arc::new(DeflateConfig::default())];
        let offers = crate::extensions::parse_offers("permessage-deflate; client_max_window_bits");
        let (header, pipeline) = crate::extensions::negotiate_server(&builders, &offers).unwrap();
        assert!(header.unwrap().starts_with(PERMESSAGE_DEFLATE));
        assert!(pipeline.allows_rsv1());
    }
}
