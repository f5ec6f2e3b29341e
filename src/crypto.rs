//! Encrypted-mode envelope codec.
//!
//! Plaintext layout before encryption:
//! `16 random bytes | u32 big-endian xml length | xml | app id`, padded to a
//! multiple of 32 bytes (PKCS#7-style, but with a 32-byte block), then
//! AES-256-CBC with the key doubling as IV source (its first 16 bytes). Both
//! quirks are part of the wire format and must not change.

use crate::error::{Result, WeixinError};
use crate::signature::{random_nonce, sign_envelope, unix_timestamp};
use aes::Aes256;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::fmt;

const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;
const HEADER_LEN: usize = RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN;
const PAD_BLOCK_SIZE: usize = 32;
const AES_BLOCK_SIZE: usize = 16;
const ENVELOPE_NONCE_LEN: usize = 5;

/// The admin console hands out 43 base64 characters without the final `=`,
/// and not every generated key has zero trailing bits.
const AES_KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// App id, callback token and the decoded 32-byte AES key.
#[derive(Clone)]
pub struct Credential {
    app_id: String,
    token: String,
    aes_key: [u8; 32],
}

impl Credential {
    pub fn new(app_id: &str, token: &str, encoding_aes_key: &str) -> Result<Self> {
        let raw = AES_KEY_ENGINE
            .decode(encoding_aes_key.trim())
            .map_err(|err| WeixinError::decode(format!("invalid EncodingAESKey: {err}")))?;
        if raw.len() != 32 {
            return Err(WeixinError::decode(format!(
                "invalid EncodingAESKey length: expected 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut aes_key = [0u8; 32];
        aes_key.copy_from_slice(&raw);

        Ok(Self {
            app_id: app_id.trim().to_string(),
            token: token.trim().to_string(),
            aes_key,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("app_id", &self.app_id)
            .field("token", &"<redacted>")
            .field("aes_key", &"<redacted>")
            .finish()
    }
}

/// Signed, encrypted wire wrapper around a plaintext message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub encrypt: String,
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

#[derive(Debug, Clone)]
pub struct MessageCrypto {
    credential: Credential,
}

impl MessageCrypto {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Encrypt `xml` under a fresh 5-character nonce and the current time.
    pub fn encrypt(&self, xml: &str) -> Result<Envelope> {
        let nonce = random_nonce(ENVELOPE_NONCE_LEN);
        let timestamp = unix_timestamp().to_string();
        self.encrypt_with(xml, &nonce, &timestamp)
    }

    pub fn encrypt_with(&self, xml: &str, nonce: &str, timestamp: &str) -> Result<Envelope> {
        let xml_bytes = xml.as_bytes();
        let xml_len = u32::try_from(xml_bytes.len())
            .map_err(|_| WeixinError::decode("plaintext payload too large"))?;
        let app_id = self.credential.app_id.as_bytes();

        let mut raw = Vec::with_capacity(HEADER_LEN + xml_bytes.len() + app_id.len() + PAD_BLOCK_SIZE);
        raw.extend_from_slice(random_nonce(RANDOM_PREFIX_LEN).as_bytes());
        raw.extend_from_slice(&xml_len.to_be_bytes());
        raw.extend_from_slice(xml_bytes);
        raw.extend_from_slice(app_id);

        let pad_len = PAD_BLOCK_SIZE - (raw.len() % PAD_BLOCK_SIZE);
        raw.extend(std::iter::repeat_n(pad_len as u8, pad_len));

        let key = &self.credential.aes_key;
        let iv = &key[..AES_BLOCK_SIZE];
        let msg_len = raw.len();
        let encrypted = cbc::Encryptor::<Aes256>::new(key.into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut raw, msg_len)
            .map_err(|_| WeixinError::decode("failed to encrypt reply payload"))?;
        let encrypt = STANDARD.encode(encrypted);

        let signature = sign_envelope(&self.credential.token, nonce, timestamp, &encrypt);
        Ok(Envelope {
            encrypt,
            signature,
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
        })
    }

    /// Decrypt an `Encrypt` payload and check the trailing app id.
    pub fn decrypt(&self, encrypt: &str) -> Result<String> {
        self.decrypt_inner(encrypt, true)
    }

    /// Decrypt without checking the trailing app id.
    pub fn decrypt_unchecked(&self, encrypt: &str) -> Result<String> {
        self.decrypt_inner(encrypt, false)
    }

    /// Check a `msg_signature` against the ciphertext it covers.
    pub fn verify_envelope(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypt: &str,
    ) -> bool {
        sign_envelope(&self.credential.token, nonce, timestamp, encrypt) == msg_signature.trim()
    }

    fn decrypt_inner(&self, encrypt: &str, verify_app_id: bool) -> Result<String> {
        let mut buf = STANDARD
            .decode(encrypt.trim())
            .map_err(|err| WeixinError::decode(format!("invalid ciphertext encoding: {err}")))?;
        if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
            return Err(WeixinError::decode(format!(
                "ciphertext length {} is not a multiple of the cipher block size",
                buf.len()
            )));
        }

        let key = &self.credential.aes_key;
        let iv = &key[..AES_BLOCK_SIZE];
        let plaintext = cbc::Decryptor::<Aes256>::new(key.into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| WeixinError::decode("failed to decrypt ciphertext"))?;

        let unpadded = strip_padding(plaintext)?;
        if unpadded.len() < HEADER_LEN {
            return Err(WeixinError::decode("decrypted payload is too short"));
        }

        let xml_len = u32::from_be_bytes([
            unpadded[RANDOM_PREFIX_LEN],
            unpadded[RANDOM_PREFIX_LEN + 1],
            unpadded[RANDOM_PREFIX_LEN + 2],
            unpadded[RANDOM_PREFIX_LEN + 3],
        ]) as usize;
        let xml_end = HEADER_LEN.saturating_add(xml_len);
        if xml_end > unpadded.len() {
            return Err(WeixinError::decode("decrypted payload length is invalid"));
        }

        let trailing = &unpadded[xml_end..];
        if verify_app_id && trailing != self.credential.app_id.as_bytes() {
            return Err(WeixinError::Authentication(format!(
                "message app id {:?} does not match {:?}",
                String::from_utf8_lossy(trailing),
                self.credential.app_id
            )));
        }

        let xml = std::str::from_utf8(&unpadded[HEADER_LEN..xml_end])
            .map_err(|_| WeixinError::decode("decrypted payload is not utf-8"))?;
        Ok(xml.to_string())
    }
}

fn strip_padding(input: &[u8]) -> Result<&[u8]> {
    let Some(last) = input.last() else {
        return Err(WeixinError::decode("invalid padding: empty payload"));
    };
    let pad_len = *last as usize;
    if pad_len == 0 || pad_len > PAD_BLOCK_SIZE || pad_len > input.len() {
        return Err(WeixinError::decode("invalid padding length"));
    }
    Ok(&input[..input.len() - pad_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign;

    const APP_ID: &str = "wxaaaaaaaaaaaaaaaa";
    const TOKEN: &str = "AAAAAAAAAAAAAAAAAAAA";

    fn crypto_with(app_id: &str, key: &str) -> MessageCrypto {
        MessageCrypto::new(Credential::new(app_id, TOKEN, key).unwrap())
    }

    fn crypto() -> MessageCrypto {
        crypto_with(APP_ID, &"A".repeat(43))
    }

    const SAMPLE_XML: &str = "<xml>\
        <ToUserName><![CDATA[toUser]]></ToUserName>\
        <FromUserName><![CDATA[fromUser]]></FromUserName>\
        <CreateTime>123456789</CreateTime>\
        <MsgType><![CDATA[text]]></MsgType>\
        <Content><![CDATA[content]]></Content>\
        </xml>";

    #[test]
    fn credential_decodes_43_char_key_with_or_without_padding() {
        let bare = Credential::new(APP_ID, TOKEN, "E5HSDyJ78YwCSelWbCSFb4ZcXXSN1LQPdkHPblR8ilo").unwrap();
        let padded = Credential::new(APP_ID, TOKEN, "E5HSDyJ78YwCSelWbCSFb4ZcXXSN1LQPdkHPblR8ilo=").unwrap();
        assert_eq!(bare.aes_key, padded.aes_key);
        assert_eq!(bare.app_id(), APP_ID);
    }

    #[test]
    fn credential_rejects_short_key() {
        let err = Credential::new(APP_ID, TOKEN, "QUJDRA").unwrap_err();
        assert!(matches!(err, WeixinError::Decode(_)));
    }

    #[test]
    fn credential_debug_redacts_secrets() {
        let rendered = format!("{:?}", crypto().credential());
        assert!(rendered.contains(APP_ID));
        assert!(!rendered.contains(TOKEN));
    }

    #[test]
    fn encrypt_and_decrypt_roundtrip() {
        let crypto = crypto();
        let envelope = crypto.encrypt(SAMPLE_XML).unwrap();
        assert_eq!(envelope.nonce.len(), 5);
        assert!(envelope.timestamp.parse::<u64>().is_ok());
        assert_eq!(crypto.decrypt(&envelope.encrypt).unwrap(), SAMPLE_XML);
    }

    #[test]
    fn roundtrip_preserves_multibyte_content() {
        let crypto = crypto();
        let xml = "<xml><Content><![CDATA[你好😫世界]]></Content></xml>";
        let envelope = crypto.encrypt(xml).unwrap();
        assert_eq!(crypto.decrypt(&envelope.encrypt).unwrap(), xml);
    }

    #[test]
    fn ciphertext_is_whole_pad_blocks() {
        let crypto = crypto();
        for len in [0usize, 1, 11, 12, 13, 44, 45, 100] {
            let xml = "x".repeat(len);
            let envelope = crypto.encrypt(&xml).unwrap();
            let raw = STANDARD.decode(&envelope.encrypt).unwrap();
            assert_eq!(raw.len() % PAD_BLOCK_SIZE, 0, "len {len}");
            assert_eq!(crypto.decrypt(&envelope.encrypt).unwrap(), xml);
        }
    }

    #[test]
    fn exact_block_multiple_gets_a_full_pad_block() {
        let crypto = crypto();
        // 16 + 4 + 12 + 0 = 32 bytes before padding
        let xml = "x".repeat(12);
        let envelope = crypto_with("", &"A".repeat(43)).encrypt(&xml).unwrap();
        let raw = STANDARD.decode(&envelope.encrypt).unwrap();
        assert_eq!(raw.len(), 64);
        assert!(crypto.decrypt_unchecked(&envelope.encrypt).is_ok());
    }

    #[test]
    fn envelope_signature_covers_ciphertext() {
        let crypto = crypto();
        let envelope = crypto.encrypt_with(SAMPLE_XML, "nonce", "1700000000").unwrap();
        assert_eq!(envelope.nonce, "nonce");
        assert_eq!(envelope.timestamp, "1700000000");
        assert_eq!(
            envelope.signature,
            sign(&[TOKEN, "nonce", "1700000000", &envelope.encrypt])
        );
        assert!(crypto.verify_envelope(
            &envelope.signature,
            &envelope.timestamp,
            &envelope.nonce,
            &envelope.encrypt
        ));
        assert!(!crypto.verify_envelope(&envelope.signature, "1700000001", "nonce", &envelope.encrypt));
    }

    #[test]
    fn decrypts_platform_sample() {
        let encrypt = "ElQfgclqivmqOxQpx6eCEvraIg1Fvwg0t+mhrBPU\
            4Xm0nHCuv9xMM5JsIh7OxIsybzfOeUvxog7fg/sT\
            Z6rC4/8IXTj2UWD73Au6m0yeZxv2DbjuUHqpVJAL\
            Xc3rC7E3f1RdCZ0cdzROOR9sg0aP3ArTUNB9ixIN\
            P6hGfzf3RHCCAhkUQ5wR0UP2NElM7XgN4702n7WM\
            yWO9uYna583pm/I3DOriC3WzG6JdPbhBuoAseisz\
            7xCA59R3lFg+XazBsia60auOehb069IvUy24tIj+\
            OcdzfbMui4efTHI7ogYWbVKFRG4W2ghQ8p0cymFk\
            yukHGMCdccZzAIssatB1RNhuaqQ0fOXIji486b5r\
            g8/OlXIuDFCwkoWFMQaZycJa/bhjSmn+ygYkmqrM\
            VC1jtmHZM4qmNvL8WXQ1PrP6X/CXU6/iIbeF1yjG\
            pjOE4xfCKsOnL3jQayzfUny3iWgT4A==";

        let xml = crypto().decrypt(encrypt).unwrap();
        for needle in ["toUser", "fromUser", "123456789", "text", "content"] {
            assert!(xml.contains(needle), "missing {needle} in {xml}");
        }
    }

    #[test]
    fn app_id_mismatch_is_authentication_error() {
        let sender = crypto_with("wxAAAAAAAAAAAAAAAA", &"A".repeat(43));
        let envelope = sender.encrypt(SAMPLE_XML).unwrap();

        let err = crypto().decrypt(&envelope.encrypt).unwrap_err();
        assert!(matches!(err, WeixinError::Authentication(_)));
        assert_eq!(crypto().decrypt_unchecked(&envelope.encrypt).unwrap(), SAMPLE_XML);
    }

    #[test]
    fn malformed_ciphertext_is_decode_error() {
        let crypto = crypto();
        assert!(matches!(crypto.decrypt("not base64!!").unwrap_err(), WeixinError::Decode(_)));
        // 15 bytes: not a whole AES block
        let short = STANDARD.encode([7u8; 15]);
        assert!(matches!(crypto.decrypt(&short).unwrap_err(), WeixinError::Decode(_)));
        assert!(matches!(crypto.decrypt("").unwrap_err(), WeixinError::Decode(_)));
    }
}
