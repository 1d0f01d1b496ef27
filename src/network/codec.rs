use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::common::error::CodecError;
use crate::consensus::Envelope;

/// Length-prefixed bincode frames, one envelope per frame.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        EnvelopeCodec::default()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = bincode::serialize(&item)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::consensus::{MessageId, Transaction};

    #[tokio::test]
    async fn test_streamed_envelopes_arrive_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, EnvelopeCodec::new());
        let mut reader = FramedRead::new(server, EnvelopeCodec::new());

        let sent = vec![
            Envelope::Hello { node_id: "node1".into() },
            Envelope::Transaction {
                sender: "node1".into(),
                id: MessageId::new("node1", 1),
                transaction: Transaction::transfer("alice", "bob", 30),
            },
            Envelope::Final {
                sender: "node1".into(),
                id: MessageId::new("node1", 1),
                seq: 12,
                tie_break: "node3".into(),
            },
        ];
        let to_send = sent.clone();
        let write = tokio::spawn(async move {
            for envelope in to_send {
                writer.send(envelope).await.unwrap();
            }
        });

        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(reader.next().await.unwrap().unwrap());
        }
        write.await.unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn test_garbage_frame_is_an_error() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0xff]), &mut buf)
            .unwrap();

        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Bincode(_))));
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Envelope::Hello { node_id: "a".into() }, &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Envelope::Hello { node_id: "a".into() })
        );
    }
}
