//! Link handshake block
//!
//! `"meta" || varint(major) || varint(minor) || box key || sig key || link key`
//!
//! Both sides write their block and then read the peer's; neither waits for
//! the other, so the exchange cannot deadlock on a symmetric connection.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::LinkError;
use crate::crypto::{BoxPublicKey, SigPublicKey, BOX_PUBLIC_KEY_LEN, SIG_PUBLIC_KEY_LEN};
use crate::wire::{put_uint64, WireReader};

pub const META_MAGIC: &[u8; 4] = b"meta";
pub const PROTOCOL_MAJOR: u64 = 0;
pub const PROTOCOL_MINOR: u64 = 2;

/// Encoded size with single-byte version numbers.
pub const METADATA_LEN: usize = 4 + 1 + 1 + 2 * BOX_PUBLIC_KEY_LEN + SIG_PUBLIC_KEY_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMetadata {
    pub major: u64,
    pub minor: u64,
    /// Permanent encryption key
    pub box_key: BoxPublicKey,
    /// Permanent signing key
    pub sig_key: SigPublicKey,
    /// Ephemeral key used only for this link
    pub link_key: BoxPublicKey,
}

impl LinkMetadata {
    pub fn new(box_key: BoxPublicKey, sig_key: SigPublicKey, link_key: BoxPublicKey) -> Self {
        Self {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            box_key,
            sig_key,
            link_key,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_LEN);
        out.extend_from_slice(META_MAGIC);
        put_uint64(&mut out, self.major);
        put_uint64(&mut out, self.minor);
        out.extend_from_slice(self.box_key.as_bytes());
        out.extend_from_slice(self.sig_key.as_bytes());
        out.extend_from_slice(self.link_key.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LinkError> {
        let mut r = WireReader::new(bytes);
        if r.slice(META_MAGIC.len())? != META_MAGIC {
            return Err(LinkError::BadMetadata);
        }
        let major = r.uint64()?;
        let minor = r.uint64()?;
        let box_key = BoxPublicKey::from_bytes(r.array::<BOX_PUBLIC_KEY_LEN>()?);
        let sig_key = SigPublicKey::from_bytes(r.array::<SIG_PUBLIC_KEY_LEN>()?);
        let link_key = BoxPublicKey::from_bytes(r.array::<BOX_PUBLIC_KEY_LEN>()?);
        r.finish()?;
        Ok(Self {
            major,
            minor,
            box_key,
            sig_key,
            link_key,
        })
    }

    /// We refuse peers running a newer protocol than ours; an older peer
    /// does the refusing itself.
    pub fn check_version(&self) -> Result<(), LinkError> {
        let newer = self.major > PROTOCOL_MAJOR
            || (self.major == PROTOCOL_MAJOR && self.minor > PROTOCOL_MINOR);
        if newer {
            return Err(LinkError::Version {
                major: self.major,
                minor: self.minor,
            });
        }
        Ok(())
    }
}

/// Send our block and read the peer's within `limit`.
pub async fn exchange<S>(
    stream: &mut S,
    ours: &LinkMetadata,
    limit: Duration,
) -> Result<LinkMetadata, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io = async {
        stream.write_all(&ours.encode()).await?;
        stream.flush().await?;
        let mut buf = [0u8; METADATA_LEN];
        stream.read_exact(&mut buf).await?;
        Ok::<_, LinkError>(buf)
    };
    let buf = tokio::time::timeout(limit, io)
        .await
        .map_err(|_| LinkError::HandshakeTimeout)??;
    LinkMetadata::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BoxKeyPair, SigKeyPair};

    fn sample() -> LinkMetadata {
        LinkMetadata::new(
            BoxKeyPair::generate().public,
            SigKeyPair::generate().public,
            BoxKeyPair::generate().public,
        )
    }

    #[test]
    fn test_encoded_length() {
        let meta = sample();
        let bytes = meta.encode();
        assert_eq!(bytes.len(), METADATA_LEN);
        assert_eq!(&bytes[..4], b"meta");
        assert_eq!(LinkMetadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'x';
        assert!(matches!(LinkMetadata::decode(&bytes), Err(LinkError::BadMetadata)));
    }

    #[test]
    fn test_version_rule() {
        let mut meta = sample();
        assert!(meta.check_version().is_ok());

        meta.minor = PROTOCOL_MINOR + 1;
        assert!(matches!(meta.check_version(), Err(LinkError::Version { .. })));

        meta.major = PROTOCOL_MAJOR + 1;
        meta.minor = 0;
        assert!(meta.check_version().is_err());

        // older peers are accepted; they refuse us if they care
        if PROTOCOL_MINOR > 0 {
            meta.major = PROTOCOL_MAJOR;
            meta.minor = PROTOCOL_MINOR - 1;
            assert!(meta.check_version().is_ok());
        }
    }

    #[tokio::test]
    async fn test_exchange_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let ma = sample();
        let mb = sample();
        let limit = Duration::from_secs(5);

        let (ra, rb) = tokio::join!(exchange(&mut a, &ma, limit), exchange(&mut b, &mb, limit));
        assert_eq!(ra.unwrap(), mb);
        assert_eq!(rb.unwrap(), ma);
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let result = exchange(&mut a, &sample(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(LinkError::HandshakeTimeout)));
    }
}
