use std::collections::HashMap;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::result;

use aes::{Aes128, Aes192, Aes256};
use chacha20::{ChaCha20, ChaCha20Legacy};
use cipher::{KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use rand::{thread_rng, RngCore};
use rc4::consts::U16;
use rc4::Rc4;

pub type Result<T> = result::Result<T, Error>;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes192Ctr = Ctr128BE<Aes192>;
type Aes256Ctr = Ctr128BE<Aes256>;

const MD5_LEN: usize = 16;

#[derive(Clone, Copy, Debug)]
pub enum Error {
    CipherNotSupport,
    KeyLenNotMatch(usize),
    ShortIv(usize),
}

/// Supported methods, negotiated only through configuration: both ends of
/// the tunnel must be started with the same name and password.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Table,
    Rc4Md5,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    ChaCha20,
    ChaCha20Ietf,
}

impl Method {
    pub fn new(name: &str) -> Result<Method> {
        match name.to_lowercase().as_ref() {
            "table" => Ok(Method::Table),
            "rc4-md5" => Ok(Method::Rc4Md5),
            "aes-128-ctr" => Ok(Method::Aes128Ctr),
            "aes-192-ctr" => Ok(Method::Aes192Ctr),
            "aes-256-ctr" => Ok(Method::Aes256Ctr),
            "chacha20" => Ok(Method::ChaCha20),
            "chacha20-ietf" => Ok(Method::ChaCha20Ietf),
            _ => Err(Error::CipherNotSupport),
        }
    }

    #[inline]
    pub fn key_len(&self) -> usize {
        match *self {
            Method::Table => 0,
            Method::Rc4Md5 => 16,
            Method::Aes128Ctr => 16,
            Method::Aes192Ctr => 24,
            Method::Aes256Ctr => 32,
            Method::ChaCha20 => 32,
            Method::ChaCha20Ietf => 32,
        }
    }

    #[inline]
    pub fn iv_len(&self) -> usize {
        match *self {
            Method::Table => 0,
            Method::Rc4Md5 => 16,
            Method::Aes128Ctr | Method::Aes192Ctr | Method::Aes256Ctr => 16,
            Method::ChaCha20 => 8,
            Method::ChaCha20Ietf => 12,
        }
    }
}

impl Default for Method {
    fn default() -> Method {
        Method::Table
    }
}

impl fmt::Display for Method {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Method::Table => "table",
            Method::Rc4Md5 => "rc4-md5",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
        };
        write!(fmt, "{}", name)
    }
}

/// OpenSSL style `EVP_BytesToKey`: hash the password, then keep hashing
/// the previous digest concatenated with the password, until enough key
/// material exists.
fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(key_len + MD5_LEN);

    while out.len() < key_len {
        let mut hasher = Md5::new();
        let len = out.len();
        if len > 0 {
            hasher.update(&out[len - MD5_LEN..]);
        }
        hasher.update(password);
        out.extend_from_slice(&hasher.finalize());
    }

    out.truncate(key_len);
    out
}

/// Password derivations done by this worker, so per-connection contexts
/// never redo the digest expansion. One instance per worker, handed to
/// `CipherSuite::new` instead of living in global state.
#[derive(Default)]
pub struct KeyCache {
    keys: HashMap<(String, usize), Rc<Vec<u8>>>,
    tables: HashMap<String, Rc<TableCipher>>,
}

impl KeyCache {
    pub fn new() -> KeyCache {
        KeyCache::default()
    }

    fn key(&mut self, password: &str, key_len: usize) -> Rc<Vec<u8>> {
        self.keys
            .entry((password.to_string(), key_len))
            .or_insert_with(|| Rc::new(bytes_to_key(password.as_bytes(), key_len)))
            .clone()
    }

    fn table(&mut self, password: &str) -> Rc<TableCipher> {
        self.tables
            .entry(password.to_string())
            .or_insert_with(|| Rc::new(TableCipher::new(password.as_bytes())))
            .clone()
    }
}

/// Keyed substitution permutation, the legacy default method. Not a real
/// cipher, only wire obfuscation, kept for compatibility: both ends derive
/// the identical permutation from the password alone, so there is no IV.
pub struct TableCipher {
    encode: [u8; 256],
    decode: [u8; 256],
}

impl TableCipher {
    pub fn new(password: &[u8]) -> TableCipher {
        let digest = Md5::digest(password);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let a = u64::from_le_bytes(head);

        let mut encode = [0u8; 256];
        for (i, v) in encode.iter_mut().enumerate() {
            *v = i as u8;
        }
        // 1023 stable passes; the comparator can order two bytes both ways
        // depending on the pass, so the tie-breaking of a stable sort is
        // part of the wire format.
        for i in 1..1024u64 {
            encode.sort_by(|&x, &y| (a % (x as u64 + i)).cmp(&(a % (y as u64 + i))));
        }

        let mut decode = [0u8; 256];
        for (i, &v) in encode.iter().enumerate() {
            decode[v as usize] = i as u8;
        }

        TableCipher { encode, decode }
    }

    #[inline]
    fn encrypt(&self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b = self.encode[*b as usize];
        }
    }

    #[inline]
    fn decrypt(&self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b = self.decode[*b as usize];
        }
    }
}

enum StreamState {
    Rc4(Rc4<U16>),
    Aes128Ctr(Box<Aes128Ctr>),
    Aes192Ctr(Box<Aes192Ctr>),
    Aes256Ctr(Box<Aes256Ctr>),
    ChaCha20(Box<ChaCha20Legacy>),
    ChaCha20Ietf(Box<ChaCha20>),
}

impl StreamState {
    fn new(method: Method, key: &[u8], iv: &[u8]) -> Result<StreamState> {
        let wrong_key = || Error::KeyLenNotMatch(method.key_len());

        match method {
            Method::Rc4Md5 => {
                // the on-wire key is per connection: MD5(key | iv)
                let mut hasher = Md5::new();
                hasher.update(key);
                hasher.update(iv);
                let session = hasher.finalize();
                let rc4 = Rc4::new_from_slice(&session).map_err(|_| wrong_key())?;
                Ok(StreamState::Rc4(rc4))
            }
            Method::Aes128Ctr => Aes128Ctr::new_from_slices(key, iv)
                .map(|c| StreamState::Aes128Ctr(Box::new(c)))
                .map_err(|_| wrong_key()),
            Method::Aes192Ctr => Aes192Ctr::new_from_slices(key, iv)
                .map(|c| StreamState::Aes192Ctr(Box::new(c)))
                .map_err(|_| wrong_key()),
            Method::Aes256Ctr => Aes256Ctr::new_from_slices(key, iv)
                .map(|c| StreamState::Aes256Ctr(Box::new(c)))
                .map_err(|_| wrong_key()),
            Method::ChaCha20 => ChaCha20Legacy::new_from_slices(key, iv)
                .map(|c| StreamState::ChaCha20(Box::new(c)))
                .map_err(|_| wrong_key()),
            Method::ChaCha20Ietf => ChaCha20::new_from_slices(key, iv)
                .map(|c| StreamState::ChaCha20Ietf(Box::new(c)))
                .map_err(|_| wrong_key()),
            Method::Table => Err(Error::CipherNotSupport),
        }
    }

    /// Stream ciphers keep their keystream offset across calls, so byte
    /// streams may be fed in whatever pieces the transport produced.
    fn process(&mut self, data: &mut [u8]) {
        match self {
            StreamState::Rc4(c) => c.apply_keystream(data),
            StreamState::Aes128Ctr(c) => c.apply_keystream(data),
            StreamState::Aes192Ctr(c) => c.apply_keystream(data),
            StreamState::Aes256Ctr(c) => c.apply_keystream(data),
            StreamState::ChaCha20(c) => c.apply_keystream(data),
            StreamState::ChaCha20Ietf(c) => c.apply_keystream(data),
        }
    }
}

/// Method + derived key for one worker; hands out per-connection contexts
/// and the one-shot datagram helpers.
#[derive(Clone)]
pub struct CipherSuite {
    method: Method,
    key: Rc<Vec<u8>>,
    table: Option<Rc<TableCipher>>,
}

impl CipherSuite {
    pub fn new(method: Method, password: &str, cache: &mut KeyCache) -> CipherSuite {
        let (key, table) = match method {
            Method::Table => (Rc::new(Vec::new()), Some(cache.table(password))),
            m => (cache.key(password, m.key_len()), None),
        };

        CipherSuite { method, key, table }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn encryptor(&self) -> Result<Encryptor> {
        Encryptor::new(self)
    }

    /// Seal one datagram: fresh IV prefix plus encrypted body.
    pub fn encrypt_all(&self, data: &[u8]) -> Result<Vec<u8>> {
        if let Some(ref table) = self.table {
            let mut out = data.to_vec();
            table.encrypt(&mut out);
            return Ok(out);
        }

        let iv_len = self.method.iv_len();
        let mut out = vec![0u8; iv_len + data.len()];
        thread_rng().fill_bytes(&mut out[..iv_len]);

        let mut state = StreamState::new(self.method, &self.key, &out[..iv_len])?;
        out[iv_len..].copy_from_slice(data);
        state.process(&mut out[iv_len..]);
        Ok(out)
    }

    /// Open one datagram sealed by `encrypt_all`.
    pub fn decrypt_all(&self, data: &[u8]) -> Result<Vec<u8>> {
        if let Some(ref table) = self.table {
            let mut out = data.to_vec();
            table.decrypt(&mut out);
            return Ok(out);
        }

        let iv_len = self.method.iv_len();
        if data.len() < iv_len {
            return Err(Error::ShortIv(iv_len));
        }

        let mut state = StreamState::new(self.method, &self.key, &data[..iv_len])?;
        let mut out = data[iv_len..].to_vec();
        state.process(&mut out);
        Ok(out)
    }
}

/// Stateful encrypt/decrypt pair for one TCP connection. The encrypt side
/// draws a random IV up front and sends it in the clear before the first
/// sealed chunk; the decrypt side comes to life once the peer's IV prefix
/// arrives.
pub struct Encryptor {
    method: Method,
    key: Rc<Vec<u8>>,
    table: Option<Rc<TableCipher>>,

    iv: Vec<u8>,
    iv_sent: bool,
    encrypt: Option<StreamState>,
    decrypt: Option<StreamState>,
}

impl Encryptor {
    fn new(suite: &CipherSuite) -> Result<Encryptor> {
        let mut iv = vec![0u8; suite.method.iv_len()];
        thread_rng().fill_bytes(&mut iv);

        let encrypt = match suite.method {
            Method::Table => None,
            m => Some(StreamState::new(m, &suite.key, &iv)?),
        };

        Ok(Encryptor {
            method: suite.method,
            key: suite.key.clone(),
            table: suite.table.clone(),
            iv,
            iv_sent: false,
            encrypt,
            decrypt: None,
        })
    }

    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(ref table) = self.table {
            let mut out = data.to_vec();
            table.encrypt(&mut out);
            return Ok(out);
        }

        let state = match self.encrypt {
            Some(ref mut state) => state,
            None => return Err(Error::CipherNotSupport),
        };

        if self.iv_sent {
            let mut out = data.to_vec();
            state.process(&mut out);
            Ok(out)
        } else {
            self.iv_sent = true;
            let iv_len = self.iv.len();
            let mut out = vec![0u8; iv_len + data.len()];
            out[..iv_len].copy_from_slice(&self.iv);
            out[iv_len..].copy_from_slice(data);
            state.process(&mut out[iv_len..]);
            Ok(out)
        }
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(ref table) = self.table {
            let mut out = data.to_vec();
            table.decrypt(&mut out);
            return Ok(out);
        }

        match self.decrypt {
            Some(ref mut state) => {
                let mut out = data.to_vec();
                state.process(&mut out);
                Ok(out)
            }
            None => {
                // first chunk from the peer must carry the whole IV
                let iv_len = self.method.iv_len();
                if data.len() < iv_len {
                    return Err(Error::ShortIv(iv_len));
                }

                let mut state = StreamState::new(self.method, &self.key, &data[..iv_len])?;
                let mut out = data[iv_len..].to_vec();
                state.process(&mut out);
                self.decrypt = Some(state);
                Ok(out)
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::CipherNotSupport => write!(fmt, "cipher not support"),
            Error::KeyLenNotMatch(need) => write!(fmt, "key length not match, need {}", need),
            Error::ShortIv(need) => write!(fmt, "iv shorter than {} bytes", need),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, format!("{}", err))
    }
}
