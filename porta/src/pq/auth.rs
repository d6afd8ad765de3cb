//! Password authentication.
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

use crate::{Error, Result, common::general};

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism supported.
pub(crate) const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Server requested an authentication method this library does not implement.
pub struct UnsupportedAuth {
    pub(crate) method: &'static str,
}

impl std::error::Error for UnsupportedAuth { }

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported authentication method: {}", self.method)
    }
}

impl fmt::Debug for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// `"md5" + md5(md5(password + user) + salt)` in hex.
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute(format!("{password}{user}").as_bytes());

    let mut outer_input = format!("{inner:x}").into_bytes();
    outer_input.extend_from_slice(&salt);
    let outer = md5::compute(&outer_input);

    let mut result = String::with_capacity(35);
    result.push_str("md5");
    let _ = write!(&mut result, "{outer:x}");
    result
}

/// Client side of a SCRAM-SHA-256 exchange, without channel binding.
pub(crate) struct ScramClient {
    password: String,
    client_nonce: String,
    salted_password: Option<[u8; 32]>,
    auth_message: Option<String>,
}

impl ScramClient {
    pub(crate) fn new(password: &str) -> Self {
        let client_nonce = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(password, client_nonce)
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_owned(),
            client_nonce,
            salted_password: None,
            auth_message: None,
        }
    }

    fn client_first_bare(&self) -> String {
        // the user name is taken from the startup message by postgres
        format!("n=,r={}", self.client_nonce)
    }

    /// `client-first-message` with the `n,,` gs2 header.
    pub(crate) fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Process `server-first-message` and produce `client-final-message`.
    pub(crate) fn process_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let msg = std::str::from_utf8(data)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in msg.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|e| Error::auth(general!("invalid salt: {e}")))?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|e| Error::auth(general!("invalid iterations: {e}")))?);
            }
        }

        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(Error::auth(general!(%"incomplete server-first-message")));
        };

        if !nonce.starts_with(&self.client_nonce) {
            return Err(Error::auth(general!(%"server nonce does not extend client nonce")));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, iterations, &mut salted_password)
            .map_err(|e| Error::auth(general!("pbkdf2 failed: {e}")))?;

        // biws = base64("n,,")
        let client_final_without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{},{msg},{client_final_without_proof}", self.client_first_bare());

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        Ok(format!("{client_final_without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Verify the server signature of `server-final-message`.
    pub(crate) fn verify_server_final(&self, data: &[u8]) -> Result<()> {
        let msg = std::str::from_utf8(data)?;

        if let Some(err) = msg.strip_prefix("e=") {
            return Err(Error::auth(general!("server rejected exchange: {err}")));
        }

        let Some(signature) = msg.strip_prefix("v=") else {
            return Err(Error::auth(general!(%"invalid server-final-message")));
        };
        let signature = BASE64
            .decode(signature.trim_end())
            .map_err(|e| Error::auth(general!("invalid server signature: {e}")))?;

        let (Some(salted_password), Some(auth_message)) = (&self.salted_password, &self.auth_message) else {
            return Err(Error::auth(general!(%"server-final-message before server-first-message")));
        };

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if signature != expected {
            return Err(Error::auth(general!(%"server signature mismatch")));
        }

        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::auth(general!("hmac init failed: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_layout() {
        let hash = md5_password("postgres", "mysecretpassword", *b"abcd");
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
    }

    // RFC 7677 example, with an empty user name as postgres sends it
    #[test]
    fn scram_exchange() {
        let mut client = ScramClient::with_nonce("pencil", String::from("rOprNGfwEbeRWgbNEkqO"));
        assert_eq!(client.client_first(), b"n,,n=,r=rOprNGfwEbeRWgbNEkqO");

        let server_first = b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = client.process_server_first(server_first).unwrap();
        let client_final = String::from_utf8(client_final).unwrap();
        assert!(client_final.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));

        assert!(client.verify_server_final(b"v=AAAA").is_err());
        assert!(client.verify_server_final(b"e=invalid-proof").is_err());
    }

    #[test]
    fn scram_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pencil", String::from("abc"));
        assert!(client.process_server_first(b"r=xyz,s=QUJD,i=4096").is_err());
    }
}
