//! Authentication messages and the SCRAM-SHA-256 client.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::protocol::codec::MessageBuilder;

use super::frontend::msg_type;

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Compute the MD5 password hash.
///
/// Format: "md5" + md5(md5(password + username) + salt)
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);

    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message carrying the client-first-message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Write a SASLResponse message carrying the client-final-message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

/// SCRAM-SHA-256 client state, without channel binding.
pub struct ScramClient {
    nonce: String,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        // 24-byte random nonce, base64 encoded
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes);

        Self {
            nonce: BASE64.encode(nonce_bytes),
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    /// The client-first-message, with the "n,," no-channel-binding prefix.
    ///
    /// The username field is left empty; the server takes the name from the
    /// startup packet.
    pub fn client_first_message(&self) -> String {
        format!("n,,n=,r={}", self.nonce)
    }

    fn client_first_message_bare(&self) -> String {
        format!("n=,r={}", self.nonce)
    }

    /// Process the server-first-message and produce the client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String, String> {
        use hmac::{Hmac, Mac};
        use pbkdf2::pbkdf2_hmac;
        use sha2::{Digest, Sha256};

        // server-first-message: r=<nonce>,s=<salt>,i=<iterations>
        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse().ok();
            }
        }

        let combined_nonce = combined_nonce.ok_or("missing nonce in server-first-message")?;
        let salt_b64 = salt_b64.ok_or("missing salt in server-first-message")?;
        let iterations: u32 = iterations.ok_or("missing iterations in server-first-message")?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err("server nonce does not extend client nonce".to_string());
        }

        let salt = BASE64
            .decode(salt_b64)
            .map_err(|e| format!("invalid salt: {}", e))?;

        // SaltedPassword = Hi(password, salt, iterations)
        let mut salted_password = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        self.salted_password = Some(salted_password.clone());

        // ClientKey = HMAC(SaltedPassword, "Client Key"); StoredKey = H(ClientKey)
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&salted_password)
            .map_err(|e| format!("hmac error: {}", e))?;
        mac.update(b"Client Key");
        let client_key = mac.finalize().into_bytes();
        let stored_key = Sha256::digest(client_key);

        let channel_binding_b64 = BASE64.encode(b"n,,");
        let client_final_without_proof = format!("c={},r={}", channel_binding_b64, combined_nonce);

        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_first,
            client_final_without_proof
        );
        self.auth_message = Some(auth_message.clone());

        // ClientSignature = HMAC(StoredKey, AuthMessage)
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&stored_key)
            .map_err(|e| format!("hmac error: {}", e))?;
        mac.update(auth_message.as_bytes());
        let client_signature = mac.finalize().into_bytes();

        // ClientProof = ClientKey XOR ClientSignature
        let mut client_proof = [0u8; 32];
        for (i, byte) in client_proof.iter_mut().enumerate() {
            *byte = client_key[i] ^ client_signature[i];
        }

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        ))
    }

    /// Verify the server-final-message signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), String> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let server_signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or("invalid server-final-message format")?;
        let server_signature = BASE64
            .decode(server_signature_b64)
            .map_err(|e| format!("invalid server signature: {}", e))?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or("missing salted password")?;
        let auth_message = self.auth_message.as_ref().ok_or("missing auth message")?;

        // ServerKey = HMAC(SaltedPassword, "Server Key")
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salted_password)
            .map_err(|e| format!("hmac error: {}", e))?;
        mac.update(b"Server Key");
        let server_key = mac.finalize().into_bytes();

        // ServerSignature = HMAC(ServerKey, AuthMessage)
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&server_key)
            .map_err(|e| format!("hmac error: {}", e))?;
        mac.update(auth_message.as_bytes());
        let expected = mac.finalize().into_bytes();

        if server_signature.as_slice() != expected.as_slice() {
            return Err("server signature verification failed".to_string());
        }

        Ok(())
    }
}
