//! Encrypted byte stream.
//!
//! Wire format per direction:
//!
//! ```text
//! [salt][len (2) + tag][payload + tag][len (2) + tag][payload + tag]...
//! ```
//!
//! The salt is sent once, before the first chunk. Each direction derives its
//! own subkey from its own salt and keeps its own nonce counter, which
//! advances once per sealed length and once per sealed payload.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::io::poll_read_buf;

use crate::crypto::{
    derive_subkey, Aead, AeadKey, CipherKind, Nonce, SecureRandom, MAX_PAYLOAD_SIZE, TAG_SIZE,
};
use crate::error::Error;

const LENGTH_SIZE: usize = 2;

enum ReadPhase {
    Salt,
    Length,
    Payload(usize),
}

struct Opener {
    phase: ReadPhase,
    aead: Option<Aead>,
    nonce: Nonce,
}

struct Sealer {
    aead: Option<Aead>,
    nonce: Nonce,
}

/// A stream whose reads decrypt and whose writes encrypt.
///
/// Built by [`crate::crypto::Cipher::wrap_stream`]. With the dummy cipher
/// it passes bytes through untouched.
pub struct EncryptedStream<S> {
    inner: S,
    kind: Option<(CipherKind, AeadKey)>,
    opener: Opener,
    sealer: Sealer,
    /// Ciphertext read from `inner` but not yet decrypted
    raw: BytesMut,
    /// Decrypted bytes not yet handed to the caller
    plain: BytesMut,
    /// Ciphertext accepted from the caller but not yet written to `inner`
    pending: BytesMut,
}

impl<S> EncryptedStream<S> {
    pub(crate) fn new(inner: S, kind: CipherKind, key: AeadKey) -> Self {
        Self::build(inner, Some((kind, key)))
    }

    pub(crate) fn plain(inner: S) -> Self {
        Self::build(inner, None)
    }

    fn build(inner: S, kind: Option<(CipherKind, AeadKey)>) -> Self {
        Self {
            inner,
            kind,
            opener: Opener {
                phase: ReadPhase::Salt,
                aead: None,
                nonce: Nonce::zero(),
            },
            sealer: Sealer {
                aead: None,
                nonce: Nonce::zero(),
            },
            raw: BytesMut::new(),
            plain: BytesMut::new(),
            pending: BytesMut::new(),
        }
    }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consume the wrapper and return the wrapped stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Try to decrypt one more unit from `raw`. Returns `false` when more
    /// ciphertext is needed.
    fn open_step(&mut self) -> io::Result<bool> {
        let Some((kind, key)) = &self.kind else {
            return Ok(false);
        };

        match self.opener.phase {
            ReadPhase::Salt => {
                let salt_size = kind.salt_size();
                if self.raw.len() < salt_size {
                    return Ok(false);
                }
                let salt = self.raw.split_to(salt_size);
                let subkey = derive_subkey(key, &salt).map_err(into_io)?;
                self.opener.aead = Some(Aead::new(*kind, &subkey).map_err(into_io)?);
                self.opener.phase = ReadPhase::Length;
            }
            ReadPhase::Length => {
                if self.raw.len() < LENGTH_SIZE + TAG_SIZE {
                    return Ok(false);
                }
                let mut chunk = self.raw.split_to(LENGTH_SIZE + TAG_SIZE).to_vec();
                self.open_chunk(&mut chunk)?;
                let len = usize::from(u16::from_be_bytes([chunk[0], chunk[1]])) & MAX_PAYLOAD_SIZE;
                self.opener.phase = ReadPhase::Payload(len);
            }
            ReadPhase::Payload(len) => {
                if self.raw.len() < len + TAG_SIZE {
                    return Ok(false);
                }
                let mut chunk = self.raw.split_to(len + TAG_SIZE).to_vec();
                self.open_chunk(&mut chunk)?;
                self.plain.extend_from_slice(&chunk);
                self.opener.phase = ReadPhase::Length;
            }
        }
        Ok(true)
    }

    fn open_chunk(&mut self, chunk: &mut Vec<u8>) -> io::Result<()> {
        let aead = self
            .opener
            .aead
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing subkey"))?;
        aead.decrypt_in_place(&self.opener.nonce, chunk).map_err(into_io)?;
        self.opener.nonce.increment();
        Ok(())
    }

    /// Encrypt `buf` into `pending`, emitting the salt first if needed.
    fn seal(&mut self, buf: &[u8]) -> io::Result<()> {
        let Some((kind, key)) = &self.kind else {
            self.pending.extend_from_slice(buf);
            return Ok(());
        };

        if self.sealer.aead.is_none() {
            let mut salt = vec![0u8; kind.salt_size()];
            SecureRandom::fill(&mut salt);
            let subkey = derive_subkey(key, &salt).map_err(into_io)?;
            self.sealer.aead = Some(Aead::new(*kind, &subkey).map_err(into_io)?);
            self.pending.extend_from_slice(&salt);
        }

        for payload in buf.chunks(MAX_PAYLOAD_SIZE) {
            let mut length = (payload.len() as u16).to_be_bytes().to_vec();
            self.seal_chunk(&mut length)?;
            let mut body = payload.to_vec();
            self.seal_chunk(&mut body)?;
        }
        Ok(())
    }

    fn seal_chunk(&mut self, chunk: &mut Vec<u8>) -> io::Result<()> {
        let aead = self
            .sealer
            .aead
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing subkey"))?;
        aead.encrypt_in_place(&self.sealer.nonce, chunk).map_err(into_io)?;
        self.sealer.nonce.increment();
        self.pending.extend_from_slice(chunk);
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> EncryptedStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for EncryptedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.kind.is_none() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.open_step()? {
                continue;
            }

            this.raw.reserve(MAX_PAYLOAD_SIZE + TAG_SIZE);
            let n = ready!(poll_read_buf(Pin::new(&mut this.inner), cx, &mut this.raw))?;
            if n == 0 {
                let at_boundary = this.raw.is_empty()
                    && matches!(this.opener.phase, ReadPhase::Salt | ReadPhase::Length);
                if at_boundary {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside an encrypted chunk",
                )));
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for EncryptedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.kind.is_none() && this.pending.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PAYLOAD_SIZE);
        this.seal(&buf[..n])?;
        // The sealed bytes are buffered; a Pending here is picked up by the
        // next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::Network(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
