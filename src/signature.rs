//! Ed25519 verification binding a revision's tree hash to a trusted key.
//!
//! The signed message is the tree hash string itself, so author, timestamp
//! and parent metadata are not part of what a key vouches for.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Serialize;

use crate::error::UpdateError;

pub const TREE_MARKER: &str = "tree ";
pub const SIGNATURE_MARKER: &str = "plugin-sign ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustedKey {
    pub identifier: String,
    pub public_key: String,
}

impl TrustedKey {
    /// Parses one `identifier key` entry. A single field is both the
    /// identifier and the base64 key; anything after the key is ignored.
    pub fn parse(entry: &str) -> Option<Self> {
        let mut fields = entry.split_whitespace();
        let first = fields.next()?;
        let public_key = fields.next().unwrap_or(first);
        Some(Self {
            identifier: first.to_string(),
            public_key: public_key.to_string(),
        })
    }
}

/// Ordered trusted keys; earlier entries win prefix matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrustedKeySet {
    keys: Vec<TrustedKey>,
}

impl TrustedKeySet {
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            keys: entries
                .iter()
                .filter_map(|entry| TrustedKey::parse(entry.as_ref()))
                .collect(),
        }
    }

    pub fn extend_entries<S: AsRef<str>>(&mut self, entries: &[S]) {
        self.keys.extend(
            entries
                .iter()
                .filter_map(|entry| TrustedKey::parse(entry.as_ref())),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[TrustedKey] {
        &self.keys
    }

    pub fn find_by_prefix(&self, key_id: &str) -> Option<&TrustedKey> {
        if key_id.is_empty() {
            return None;
        }
        self.keys
            .iter()
            .find(|key| key.identifier.starts_with(key_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRecord {
    Absent,
    Malformed(String),
    Duplicate(usize),
    Present { key_id: String, signature: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMetadata {
    pub tree_hash: Option<String>,
    pub signature: SignatureRecord,
}

impl RevisionMetadata {
    pub fn parse(raw: &str) -> Self {
        let mut tree_hash = None;
        let mut records = Vec::new();

        for line in raw.lines() {
            if tree_hash.is_none() {
                if let Some(rest) = line.strip_prefix(TREE_MARKER) {
                    let value = rest.trim();
                    if !value.is_empty() {
                        tree_hash = Some(value.to_string());
                    }
                    continue;
                }
            }
            if let Some(rest) = line.strip_prefix(SIGNATURE_MARKER) {
                records.push(rest.trim().to_string());
            }
        }

        let signature = match records.len() {
            0 => SignatureRecord::Absent,
            1 => parse_signature_record(&records[0]),
            count => SignatureRecord::Duplicate(count),
        };

        Self {
            tree_hash,
            signature,
        }
    }
}

fn parse_signature_record(raw: &str) -> SignatureRecord {
    let mut parts = raw.split(':');
    let key_id = parts.next().unwrap_or_default().trim();
    let Some(signature) = parts.next().map(str::trim) else {
        return SignatureRecord::Malformed("missing ':' between key id and signature".to_string());
    };
    if parts.next().is_some() {
        return SignatureRecord::Malformed("more than one ':' in signature record".to_string());
    }
    if key_id.is_empty() || signature.is_empty() {
        return SignatureRecord::Malformed("empty key id or signature".to_string());
    }
    SignatureRecord::Present {
        key_id: key_id.to_string(),
        signature: signature.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedRevision {
    pub tree_hash: String,
    pub key_identifier: String,
}

/// Verifies raw commit text against `trusted_keys`.
///
/// Fails closed: a missing tree hash, a missing, duplicated or malformed
/// signature record, an unknown key, undecodable material and a bad
/// signature are all errors, each with its own kind.
pub fn verify_revision(
    raw_metadata: &str,
    trusted_keys: &TrustedKeySet,
) -> Result<VerifiedRevision, UpdateError> {
    let metadata = RevisionMetadata::parse(raw_metadata);
    let tree_hash = metadata.tree_hash.ok_or(UpdateError::NoTreeHash)?;

    let (key_id, signature) = match metadata.signature {
        SignatureRecord::Present { key_id, signature } => (key_id, signature),
        SignatureRecord::Absent => {
            return Err(UpdateError::NoSignature(
                "no signature record in revision".to_string(),
            ))
        }
        SignatureRecord::Duplicate(count) => {
            return Err(UpdateError::NoSignature(format!(
                "{} signature records present, expected exactly one",
                count
            )))
        }
        SignatureRecord::Malformed(reason) => {
            return Err(UpdateError::NoSignature(format!(
                "malformed signature record: {}",
                reason
            )))
        }
    };

    let key = trusted_keys
        .find_by_prefix(&key_id)
        .ok_or_else(|| UpdateError::UntrustedKey(key_id.clone()))?;

    let verifying_key = decode_public_key(&key.public_key)?;
    let signature = decode_signature(&signature)?;

    verifying_key
        .verify(tree_hash.as_bytes(), &signature)
        .map_err(|_| UpdateError::SignatureInvalid {
            tree_hash: tree_hash.clone(),
            key_identifier: key.identifier.clone(),
        })?;

    Ok(VerifiedRevision {
        tree_hash,
        key_identifier: key.identifier.clone(),
    })
}

pub fn decode_public_key(raw: &str) -> Result<VerifyingKey, UpdateError> {
    let bytes = general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|err| UpdateError::Encoding(format!("public key is not base64: {}", err)))?;
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        UpdateError::Encoding(format!(
            "Ed25519 public key must decode to 32 bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| UpdateError::Encoding("invalid Ed25519 public key bytes".to_string()))
}

pub fn decode_signature(raw: &str) -> Result<Signature, UpdateError> {
    let bytes = general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|err| UpdateError::Encoding(format!("signature is not base64: {}", err)))?;
    let signature_bytes: [u8; 64] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        UpdateError::Encoding(format!(
            "Ed25519 signature must decode to 64 bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(Signature::from_bytes(&signature_bytes))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use base64::{engine::general_purpose, Engine as _};
    use ed25519_dalek::{Signer, SigningKey};

    pub fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub fn public_key_b64(key: &SigningKey) -> String {
        general_purpose::STANDARD.encode(key.verifying_key().to_bytes())
    }

    pub fn sign_b64(key: &SigningKey, tree_hash: &str) -> String {
        general_purpose::STANDARD.encode(key.sign(tree_hash.as_bytes()).to_bytes())
    }

    /// Commit text in `git cat-file -p` layout with a signature line in the
    /// message body.
    pub fn commit_text(tree_hash: &str, sign_line: Option<String>) -> String {
        let mut text = format!(
            "tree {}\nparent 1111111111111111111111111111111111111111\nauthor ops <ops@example.com> 1700000000 +0000\ncommitter ops <ops@example.com> 1700000000 +0000\n\nupdate plugins\n",
            tree_hash
        );
        if let Some(line) = sign_line {
            text.push('\n');
            text.push_str(&line);
            text.push('\n');
        }
        text
    }

    pub fn signed_commit(key: &SigningKey, key_id: &str, tree_hash: &str) -> String {
        commit_text(
            tree_hash,
            Some(format!(
                "plugin-sign {}:{}",
                key_id,
                sign_b64(key, tree_hash)
            )),
        )
    }
}
