use crate::error::Error;
use crate::frame::Frame;
use crate::stream::TransportWriter;
use crate::Role;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWriteExt;

pub struct Writer {
    write_half: TransportWriter,
    role: Role,
}

impl Writer {
    pub fn new(write_half: TransportWriter, role: Role) -> Self {
        Self { write_half, role }
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        match self.role {
            Role::Client => self.write_frame_client(frame).await,
            Role::Server => self.write_frame_server(frame).await,
        }
    }

    /// Closes the outgoing half of the transport, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.write_half.shutdown().await?;
        Ok(())
    }

    fn first_byte(frame: &Frame) -> u8 {
        // fin in the top bit, then rsv1/rsv2/rsv3, opcode in the low nibble
        (frame.final_fragment as u8) << 7
            | (frame.rsv1 as u8) << 6
            | (frame.rsv2 as u8) << 5
            | (frame.rsv3 as u8) << 4
            | frame.opcode.as_u8()
    }

    // Frames from a server are never masked
    async fn write_frame_server(&mut self, frame: Frame) -> Result<(), Error> {
        let first_byte = Self::first_byte(&frame);
        let payload_len = frame.payload.len();

        self.write_half.write_all(&[first_byte]).await?;

        // Payload length forms per RFC 6455: 7-bit inline up to 125, a 126
        // marker plus 16 bits up to 65535, a 127 marker plus 64 bits beyond.
        if payload_len <= 125 {
            self.write_half.write_all(&[payload_len as u8]).await?;
        } else if payload_len <= 65535 {
            self.write_half
                .write_all(&[126, (payload_len >> 8) as u8, payload_len as u8])
                .await?;
        } else {
            let bytes = (payload_len as u64).to_be_bytes();
            self.write_half
                .write_all(&[
                    127, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                    bytes[7],
                ])
                .await?;
        }

        self.write_half.write_all(&frame.payload).await?;
        self.write_half.flush().await?;

        Ok(())
    }

    // Frames from a client carry a fresh random mask key each time
    async fn write_frame_client(&mut self, frame: Frame) -> Result<(), Error> {
        let mut rng = StdRng::from_rng(&mut rand::thread_rng());
        let mask = [
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random::<u8>(),
        ];

        let first_byte = Self::first_byte(&frame);
        let payload_len = frame.payload.len();

        self.write_half.write_all(&[first_byte]).await?;

        // Same length forms as the server path, with the mask bit set and the
        // 4-byte key following the length.
        if payload_len <= 125 {
            let length = 0b1000_0000 | payload_len as u8;
            self.write_half.write_all(&[length]).await?;
            self.write_half.write_all(&mask).await?;
        } else if payload_len <= 65535 {
            self.write_half
                .write_all(&[
                    126 | 0b1000_0000,
                    (payload_len >> 8) as u8,
                    payload_len as u8,
                ])
                .await?;
            self.write_half.write_all(&mask).await?;
        } else {
            let bytes = (payload_len as u64).to_be_bytes();
            self.write_half
                .write_all(&[
                    127 | 0b1000_0000,
                    bytes[0],
                    bytes[1],
                    bytes[2],
                    bytes[3],
                    bytes[4],
                    bytes[5],
                    bytes[6],
                    bytes[7],
                ])
                .await?;
            self.write_half.write_all(&mask).await?;
        }

        let mut masked_payload: Vec<u8> = Vec::with_capacity(frame.payload.len());
        for (i, &byte) in frame.payload.iter().enumerate() {
            masked_payload.push(byte ^ mask[i % 4]);
        }

        self.write_half.write_all(&masked_payload).await?;
        self.write_half.flush().await?;

        Ok(())
    }
}
