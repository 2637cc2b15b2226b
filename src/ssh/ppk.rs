//! PuTTY private key (`.ppk`) conversion
//!
//! Key files configured for a launch may be in PuTTY's format. They are
//! converted in memory to OpenSSH text before authentication; nothing is
//! written back to disk.
//!
//! Supported: format versions 2 and 3, `Encryption: none`, `ssh-rsa` and
//! `ssh-ed25519`. The private MAC is not checked.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData, RsaKeypair, RsaPrivateKey};
use russh::keys::ssh_key::public::RsaPublicKey;
use russh::keys::ssh_key::{LineEnding, Mpint, PrivateKey};
use thiserror::Error;
use zeroize::Zeroizing;

const HEADER_PREFIX: &str = "PuTTY-User-Key-File-";

#[derive(Debug, Error)]
pub enum PpkError {
    #[error("Not a PuTTY key file")]
    NotPutty,

    #[error("Unsupported PuTTY key file version: {0}")]
    UnsupportedVersion(String),

    #[error("Encrypted PuTTY keys ({0}) are not supported; export the key in OpenSSH format")]
    Encrypted(String),

    #[error("Unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Malformed PuTTY key file: {0}")]
    Malformed(String),

    #[error("Key conversion failed: {0}")]
    Key(String),
}

/// Whether `text` is a PuTTY key file.
pub fn is_putty_key(text: &str) -> bool {
    text.trim_start().starts_with(HEADER_PREFIX)
}

/// Parsed contents of a `.ppk` file.
struct PuttyKey {
    algorithm: String,
    comment: String,
    public_blob: Vec<u8>,
    private_blob: Zeroizing<Vec<u8>>,
}

/// Convert PuTTY key text to OpenSSH private key text.
pub fn to_openssh(text: &str) -> Result<Zeroizing<String>, PpkError> {
    let parsed = parse(text)?;
    let keypair = match parsed.algorithm.as_str() {
        "ssh-ed25519" => ed25519_keypair(&parsed)?,
        "ssh-rsa" => rsa_keypair(&parsed)?,
        other => return Err(PpkError::UnsupportedAlgorithm(other.to_string())),
    };

    let key = PrivateKey::new(keypair, parsed.comment.as_str())
        .map_err(|e| PpkError::Key(e.to_string()))?;
    key.to_openssh(LineEnding::LF)
        .map_err(|e| PpkError::Key(e.to_string()))
}

fn parse(text: &str) -> Result<PuttyKey, PpkError> {
    let mut lines = text.lines().map(str::trim_end);

    let first = lines.next().ok_or(PpkError::NotPutty)?;
    let (version, algorithm) = header_value(first)
        .filter(|(name, _)| name.starts_with(HEADER_PREFIX))
        .map(|(name, value)| (&name[HEADER_PREFIX.len()..], value))
        .ok_or(PpkError::NotPutty)?;
    if version != "2" && version != "3" {
        return Err(PpkError::UnsupportedVersion(version.to_string()));
    }

    let mut comment = String::new();
    let mut public_blob = None;
    let mut private_blob = None;

    while let Some(line) = lines.next() {
        let Some((name, value)) = header_value(line) else {
            continue;
        };
        match name {
            "Encryption" if value != "none" => {
                return Err(PpkError::Encrypted(value.to_string()));
            }
            "Comment" => comment = value.to_string(),
            "Public-Lines" => public_blob = Some(read_blob(&mut lines, value)?),
            "Private-Lines" => private_blob = Some(Zeroizing::new(read_blob(&mut lines, value)?)),
            _ => {}
        }
    }

    Ok(PuttyKey {
        algorithm: algorithm.to_string(),
        comment,
        public_blob: public_blob.ok_or_else(|| PpkError::Malformed("missing public key".into()))?,
        private_blob: private_blob
            .ok_or_else(|| PpkError::Malformed("missing private key".into()))?,
    })
}

fn header_value(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

fn read_blob<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    count: &str,
) -> Result<Vec<u8>, PpkError> {
    let count: usize = count
        .parse()
        .map_err(|_| PpkError::Malformed(format!("bad line count {:?}", count)))?;
    let mut encoded = String::new();
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| PpkError::Malformed("truncated key data".into()))?;
        encoded.push_str(line.trim());
    }
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| PpkError::Malformed(e.to_string()))
}

/// Reads SSH wire-format fields out of a key blob.
struct BlobReader<'a> {
    data: &'a [u8],
}

impl<'a> BlobReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn string(&mut self) -> Result<&'a [u8], PpkError> {
        if self.data.len() < 4 {
            return Err(PpkError::Malformed("truncated blob".into()));
        }
        let (len, rest) = self.data.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(PpkError::Malformed("truncated blob".into()));
        }
        let (value, rest) = rest.split_at(len);
        self.data = rest;
        Ok(value)
    }

    fn mpint(&mut self) -> Result<Mpint, PpkError> {
        let bytes = self.string()?;
        Mpint::from_bytes(bytes).map_err(|e| PpkError::Malformed(e.to_string()))
    }

    fn expect_algorithm(&mut self, algorithm: &str) -> Result<(), PpkError> {
        let found = self.string()?;
        if found != algorithm.as_bytes() {
            return Err(PpkError::Malformed(format!(
                "public key is {}, header says {}",
                String::from_utf8_lossy(found),
                algorithm
            )));
        }
        Ok(())
    }
}

fn ed25519_keypair(key: &PuttyKey) -> Result<KeypairData, PpkError> {
    let mut public = BlobReader::new(&key.public_blob);
    public.expect_algorithm("ssh-ed25519")?;
    let public_bytes = public.string()?;

    let mut private = BlobReader::new(&key.private_blob);
    let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
        private
            .string()?
            .try_into()
            .map_err(|_| PpkError::Malformed("ed25519 private key must be 32 bytes".into()))?,
    );

    let keypair = Ed25519Keypair::from_seed(&seed);
    if keypair.public.0.as_slice() != public_bytes {
        return Err(PpkError::Malformed(
            "ed25519 public key does not match the private key".into(),
        ));
    }
    Ok(KeypairData::Ed25519(keypair))
}

fn rsa_keypair(key: &PuttyKey) -> Result<KeypairData, PpkError> {
    let mut public = BlobReader::new(&key.public_blob);
    public.expect_algorithm("ssh-rsa")?;
    let e = public.mpint()?;
    let n = public.mpint()?;

    // PuTTY order: d, p, q, iqmp
    let mut private = BlobReader::new(&key.private_blob);
    let d = private.mpint()?;
    let p = private.mpint()?;
    let q = private.mpint()?;
    let iqmp = private.mpint()?;

    Ok(KeypairData::Rsa(RsaKeypair {
        public: RsaPublicKey { e, n },
        private: RsaPrivateKey { d, iqmp, p, q },
    }))
}
