//! RC4 stream obfuscation for plaintext connections.
//!
//! Both peers seed RC4 with the same built-in key, one cipher state per
//! direction. This only defeats naive string matching on the wire: the key
//! is public, so it provides no confidentiality at all.

use crate::websocket::Transport;
use log::warn;
use rc4::consts::U128;
use rc4::{KeyInit, Rc4, StreamCipher};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Pre-shared RC4 key.
const KEY: [u8; 128] = [
    0x83, 0x48, 0x46, 0xc7, 0x42, 0xd1, 0x00, 0xd3, 0x2c, 0x5d, 0xc4, 0x92,
    0x5a, 0xa5, 0xf9, 0xd1, 0x6b, 0x7e, 0x93, 0x12, 0xd6, 0xbd, 0x40, 0xe0,
    0xac, 0x0d, 0xc9, 0xdb, 0xda, 0x55, 0xd5, 0x95, 0xa0, 0x29, 0xc6, 0xf9,
    0x4e, 0xe2, 0x77, 0x1d, 0x7f, 0xda, 0x1c, 0x45, 0xe6, 0x05, 0x58, 0x88,
    0x12, 0x36, 0x6b, 0x60, 0xd9, 0x83, 0xb4, 0x1d, 0x54, 0x11, 0xf4, 0xd4,
    0xd8, 0xc8, 0x9b, 0x47, 0xd0, 0x5d, 0x35, 0x62, 0x40, 0x1d, 0x9d, 0xde,
    0x38, 0x56, 0xcf, 0x0f, 0xab, 0x14, 0x7e, 0xe6, 0x8f, 0x64, 0xee, 0x81,
    0xb2, 0x6d, 0x01, 0xef, 0x7c, 0x03, 0xa5, 0xc3, 0x2c, 0x4a, 0xe8, 0x48,
    0x1b, 0xbf, 0xb9, 0x78, 0xe1, 0x77, 0x32, 0x1d, 0xfe, 0xac, 0x94, 0xcf,
    0xc8, 0x5d, 0xae, 0xf9, 0xe9, 0x06, 0x9e, 0x3f, 0xc6, 0x09, 0x7f, 0x36,
    0x10, 0x63, 0x5c, 0x92, 0x43, 0x3d, 0xb0, 0x49,
];

fn new_cipher() -> io::Result<Rc4<U128>> {
    Rc4::new_from_slice(&KEY)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

/// A stream whose bytes are XORed with the RC4 keystream in both directions.
pub struct Scrambled<S> {
    inner: S,
    read_cipher: Rc4<U128>,
    write_cipher: Rc4<U128>,
    scratch: Vec<u8>,
}

impl<S> Scrambled<S> {
    pub fn new(inner: S) -> io::Result<Self> {
        Ok(Self {
            inner,
            read_cipher: new_cipher()?,
            write_cipher: new_cipher()?,
            scratch: Vec::new(),
        })
    }

    #[cfg(test)]
    fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read> Read for Scrambled<S> {
    /// Reads and descrambles in place.
    ///
    /// Errors from the wrapped stream end the stream instead of propagating,
    /// except deadline expiries which callers rely on.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => {
                self.read_cipher.apply_keystream(&mut buf[..n]);
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) =>
            {
                Err(e)
            }
            Err(e) => {
                warn!("scrambled read failed, treating as end of stream: {}", e);
                Ok(0)
            }
        }
    }
}

impl<S: Write> Write for Scrambled<S> {
    /// Scrambles a copy of `buf` and writes all of it.
    ///
    /// The keystream has already advanced once this returns, so a partial
    /// write would desynchronise the peers; hence `write_all`.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.write_cipher.apply_keystream(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Transport> Transport for Scrambled<S> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown()
    }
}
