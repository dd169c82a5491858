//! Content fingerprints, resource signs, and credential verification
//!
//! A file's digest is the MD5 of its relative path concatenated with its
//! bytes, so identical content stored at two locations yields two distinct
//! signs. MD5 is a fingerprint here, not a security primitive; passwords
//! are checked against SHA-512 entries in the credentials file.

use anyhow::{Context, Result};
use sha2::{Digest, Sha512};
use std::fs;
use std::path::{Path, PathBuf};

/// MD5 hex of an arbitrary string (user ids are derived from usernames).
pub fn string_digest(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// MD5 hex over `relative-path || file-bytes`.
pub fn file_digest(absolute_path: &Path, relative_path: &Path) -> Result<String> {
    let bytes = fs::read(absolute_path)
        .with_context(|| format!("read {}", absolute_path.display()))?;
    let mut ctx = md5::Context::new();
    ctx.consume(relative_str(relative_path).as_bytes());
    ctx.consume(&bytes);
    Ok(format!("{:x}", ctx.compute()))
}

/// Forward-slash form of a relative path, as embedded in signs and digests.
pub fn relative_str(relative_path: &Path) -> String {
    let s = relative_path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// `<relative path> NUL <hex digest>` - the unique name of a file version.
pub fn make_sign(relative_path: &Path, digest: &str) -> String {
    format!("{}\x00{}", relative_str(relative_path), digest)
}

/// Split a sign at its NUL separator.
pub fn split_sign(sign: &str) -> Result<(PathBuf, String)> {
    let (path, digest) = sign
        .split_once('\x00')
        .context("malformed sign: missing NUL separator")?;
    Ok((PathBuf::from(path), digest.to_string()))
}

pub fn sha512_hex(s: &str) -> String {
    let digest = Sha512::digest(s.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Check `username`/`password` against a line-oriented credentials file of
/// `<username>\t<sha512-hex>` entries. Any I/O error, missing user, or hash
/// mismatch yields `false`.
pub fn verify_password(credentials_path: &Path, username: &str, password: &str) -> bool {
    let content = match fs::read_to_string(credentials_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to read credentials file: {}", e);
            return false;
        }
    };
    let given = sha512_hex(password);
    for line in content.lines() {
        if let Some((user, stored)) = line.split_once('\t') {
            if user == username {
                return stored.trim() == given;
            }
        }
    }
    false
}
