//! SSH authentication protocol messages (RFC 4252, RFC 4256).
//!
//! This module implements the `ssh-userauth` messages the proxy reads from
//! downstream clients and writes to upstream servers:
//! - SSH_MSG_USERAUTH_REQUEST for "none", "password", "publickey" and
//!   "keyboard-interactive"; other methods are kept as opaque bytes
//! - FAILURE, BANNER, PK_OK
//! - keyboard-interactive INFO_REQUEST / INFO_RESPONSE
//!
//! # Security
//!
//! - Passwords and keyboard-interactive answers are zeroized on drop
//! - `Debug` output never includes secrets
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new("alice", "ssh-connection", AuthMethod::password(b"secret"));
//! let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
//! assert_eq!(parsed.user_name(), "alice");
//! assert_eq!(parsed.method().name(), "password");
//! ```

use super::message::{MessageType, USERAUTH_INFO_REQUEST};
use super::wire::{
    expect_end, read_bool, read_string, read_u32, read_u8, read_utf8, write_bool,
    write_name_list, write_str, write_string, write_u32, write_u8,
};
use piper_platform::{PiperError, PiperResult};
use zeroize::Zeroizing;

/// Service requested after authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// Service carrying authentication itself.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none"
    None,
    /// "password"
    Password {
        /// Current password
        password: Zeroizing<Vec<u8>>,
        /// Replacement password when the client is changing it
        new_password: Option<Zeroizing<Vec<u8>>>,
    },
    /// "publickey"
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature blob; `None` for a query
        signature: Option<Vec<u8>>,
    },
    /// "keyboard-interactive"
    KeyboardInteractive {
        /// Language tag (deprecated, usually empty)
        language: String,
        /// Submethod hints
        submethods: String,
    },
    /// Any other method, with its method-specific bytes kept verbatim.
    Other {
        /// Method name
        name: String,
        /// Method-specific fields
        payload: Vec<u8>,
    },
}

impl AuthMethod {
    /// Plain password attempt.
    pub fn password(password: &[u8]) -> Self {
        AuthMethod::Password {
            password: Zeroizing::new(password.to_vec()),
            new_password: None,
        }
    }

    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::Other { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Replaces the user name.
    pub fn with_user(mut self, user_name: &str) -> Self {
        self.user_name = user_name.to_string();
        self
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        write_u8(&mut buf, MessageType::UserauthRequest as u8);
        write_str(&mut buf, &self.user_name);
        write_str(&mut buf, &self.service_name);
        write_str(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                write_bool(&mut buf, new_password.is_some());
                write_string(&mut buf, password);
                if let Some(new_password) = new_password {
                    write_string(&mut buf, new_password);
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_str(&mut buf, algorithm);
                write_string(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_string(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                write_str(&mut buf, language);
                write_str(&mut buf, submethods);
            }
            AuthMethod::Other { payload, .. } => buf.extend_from_slice(payload),
        }

        buf
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`PiperError::Protocol`] if the data is malformed.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        let msg_type = read_u8(data, &mut offset)?;
        if msg_type != MessageType::UserauthRequest as u8 {
            return Err(PiperError::Protocol(format!(
                "expected SSH_MSG_USERAUTH_REQUEST, got {}",
                msg_type
            )));
        }

        let user_name = read_utf8(data, &mut offset)?;
        let service_name = read_utf8(data, &mut offset)?;
        let method_name = read_utf8(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = read_bool(data, &mut offset)?;
                let password = Zeroizing::new(read_string(data, &mut offset)?.to_vec());
                let new_password = if changing {
                    Some(Zeroizing::new(read_string(data, &mut offset)?.to_vec()))
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let has_signature = read_bool(data, &mut offset)?;
                let algorithm = read_utf8(data, &mut offset)?;
                let public_key = read_string(data, &mut offset)?.to_vec();
                let signature = if has_signature {
                    Some(read_string(data, &mut offset)?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => AuthMethod::KeyboardInteractive {
                language: read_utf8(data, &mut offset)?,
                submethods: read_utf8(data, &mut offset)?,
            },
            _ => {
                let payload = data[offset..].to_vec();
                offset = data.len();
                AuthMethod::Other {
                    name: method_name,
                    payload,
                }
            }
        };
        expect_end(data, offset, "USERAUTH_REQUEST")?;

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Methods that may productively continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Partial success flag.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        write_u8(&mut buf, MessageType::UserauthFailure as u8);
        write_name_list(&mut buf, &self.methods_can_continue);
        write_bool(&mut buf, self.partial_success);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthFailure as u8)?;
        let methods_can_continue = super::wire::read_name_list(data, &mut offset)?;
        let partial_success = read_bool(data, &mut offset)?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            language: String::new(),
        }
    }

    /// Returns the message text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.message.len() + 16);
        write_u8(&mut buf, MessageType::UserauthBanner as u8);
        write_str(&mut buf, &self.message);
        write_str(&mut buf, &self.language);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthBanner as u8)?;
        Ok(Self {
            message: read_utf8(data, &mut offset)?,
            language: read_utf8(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a PK_OK for the queried key.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.public_key.len() + 32);
        write_u8(&mut buf, MessageType::UserauthPkOk as u8);
        write_str(&mut buf, &self.algorithm);
        write_string(&mut buf, &self.public_key);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthPkOk as u8)?;
        Ok(Self {
            algorithm: read_utf8(data, &mut offset)?,
            public_key: read_string(data, &mut offset)?.to_vec(),
        })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub prompt: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Name
    pub name: String,
    /// Instruction
    pub instruction: String,
    /// Prompts, possibly empty
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        write_u8(&mut buf, USERAUTH_INFO_REQUEST);
        write_str(&mut buf, &self.name);
        write_str(&mut buf, &self.instruction);
        write_str(&mut buf, "");
        write_u32(&mut buf, self.prompts.len() as u32);
        for prompt in &self.prompts {
            write_str(&mut buf, &prompt.prompt);
            write_bool(&mut buf, prompt.echo);
        }
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, USERAUTH_INFO_REQUEST)?;
        let name = read_utf8(data, &mut offset)?;
        let instruction = read_utf8(data, &mut offset)?;
        let _language = read_string(data, &mut offset)?;
        let count = read_u32(data, &mut offset)? as usize;
        // each prompt needs at least 5 bytes
        if count > data.len() / 5 {
            return Err(PiperError::Protocol(format!(
                "INFO_REQUEST claims {} prompts",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(Prompt {
                prompt: read_utf8(data, &mut offset)?,
                echo: read_bool(data, &mut offset)?,
            });
        }
        expect_end(data, offset, "INFO_REQUEST")?;
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Answers in prompt order
    pub responses: Vec<Zeroizing<String>>,
}

impl std::fmt::Debug for InfoResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoResponse")
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl InfoResponse {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        write_u8(&mut buf, MessageType::UserauthInfoResponse as u8);
        write_u32(&mut buf, self.responses.len() as u32);
        for response in &self.responses {
            write_str(&mut buf, response);
        }
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::UserauthInfoResponse as u8)?;
        let count = read_u32(data, &mut offset)? as usize;
        if count > data.len() / 4 {
            return Err(PiperError::Protocol(format!(
                "INFO_RESPONSE claims {} answers",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(Zeroizing::new(read_utf8(data, &mut offset)?));
        }
        expect_end(data, offset, "INFO_RESPONSE")?;
        Ok(Self { responses })
    }
}

fn expect_type(data: &[u8], offset: &mut usize, expected: u8) -> PiperResult<()> {
    let msg_type = read_u8(data, offset)?;
    if msg_type != expected {
        return Err(PiperError::Protocol(format!(
            "expected message {}, got {}",
            expected, msg_type
        )));
    }
    Ok(())
}

/// Builds the data signed for publickey authentication (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(session_id.len() + public_key_blob.len() + 128);
    write_string(&mut buf, session_id);
    write_u8(&mut buf, MessageType::UserauthRequest as u8);
    write_str(&mut buf, user_name);
    write_str(&mut buf, service_name);
    write_str(&mut buf, "publickey");
    write_bool(&mut buf, true);
    write_str(&mut buf, algorithm);
    write_string(&mut buf, public_key_blob);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_request_password() {
        let auth = AuthRequest::new("user", SERVICE_CONNECTION, AuthMethod::password(b"pw"));
        let bytes = auth.to_bytes();
        assert_eq!(bytes[0], 50);

        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, auth);
        match parsed.method() {
            AuthMethod::Password {
                password,
                new_password,
            } => {
                assert_eq!(&password[..], b"pw");
                assert!(new_password.is_none());
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_auth_request_password_change() {
        let auth = AuthRequest::new(
            "user",
            SERVICE_CONNECTION,
            AuthMethod::Password {
                password: Zeroizing::new(b"old".to_vec()),
                new_password: Some(Zeroizing::new(b"new".to_vec())),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&auth.to_bytes()).unwrap(), auth);
    }

    #[test]
    fn test_auth_request_publickey_query_and_signed() {
        let query = AuthRequest::new(
            "user",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let bytes = query.to_bytes();
        // boolean FALSE right after the method name
        assert_eq!(bytes[1 + 8 + 18 + 13], 0);
        assert_eq!(AuthRequest::from_bytes(&bytes).unwrap(), query);

        let signed = AuthRequest::new(
            "user",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: Some(vec![9; 10]),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&signed.to_bytes()).unwrap(), signed);
    }

    #[test]
    fn test_auth_request_keyboard_interactive() {
        let auth = AuthRequest::new(
            "user",
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: "pam".to_string(),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&auth.to_bytes()).unwrap(), auth);
    }

    #[test]
    fn test_unknown_method_kept_verbatim() {
        let mut bytes = AuthRequest::new("u", SERVICE_CONNECTION, AuthMethod::None).to_bytes();
        // turn "none" into "host" and append a payload
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(b"host");
        bytes.extend_from_slice(&[0xde, 0xad]);

        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.method().name(), "host");
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.with_user("v").user_name(), "v");
    }

    #[test]
    fn test_truncated_request() {
        let bytes =
            AuthRequest::new("user", SERVICE_CONNECTION, AuthMethod::password(b"pw")).to_bytes();
        assert!(AuthRequest::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(AuthRequest::from_bytes(&[51]).is_err());
    }

    #[test]
    fn test_auth_failure() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], false);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.methods_can_continue(), ["publickey", "password"]);
        assert!(!parsed.partial_success());
    }

    #[test]
    fn test_auth_banner() {
        let banner = AuthBanner::new("Welcome\r\n");
        let parsed = AuthBanner::from_bytes(&banner.to_bytes()).unwrap();
        assert_eq!(parsed.message(), "Welcome\r\n");
    }

    #[test]
    fn test_auth_pk_ok() {
        let ok = AuthPkOk::new("ssh-ed25519", vec![7; 51]);
        let bytes = ok.to_bytes();
        assert_eq!(bytes[0], 60);
        assert_eq!(AuthPkOk::from_bytes(&bytes).unwrap(), ok);
        assert!(AuthPkOk::from_bytes(&[52]).is_err());
    }

    #[test]
    fn test_info_request_and_response() {
        let request = InfoRequest {
            name: "".to_string(),
            instruction: "answer".to_string(),
            prompts: vec![
                Prompt {
                    prompt: "Password: ".to_string(),
                    echo: false,
                },
                Prompt {
                    prompt: "Code: ".to_string(),
                    echo: true,
                },
            ],
        };
        assert_eq!(InfoRequest::from_bytes(&request.to_bytes()).unwrap(), request);

        let response = InfoResponse {
            responses: vec![Zeroizing::new("pw".to_string()), Zeroizing::new("123".to_string())],
        };
        let parsed = InfoResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(parsed, response);
        assert_eq!(format!("{:?}", parsed), "InfoResponse { responses: 2 }");
    }

    #[test]
    fn test_info_request_absurd_count() {
        let mut bytes = vec![60];
        write_str(&mut bytes, "");
        write_str(&mut bytes, "");
        write_str(&mut bytes, "");
        write_u32(&mut bytes, u32::MAX);
        assert!(InfoRequest::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_construct_signature_data() {
        let data = construct_signature_data(
            &[0xaa; 32],
            "bob",
            SERVICE_CONNECTION,
            "ssh-ed25519",
            &[1, 2],
        );
        assert_eq!(&data[..4], &[0, 0, 0, 32]);
        assert_eq!(data[36], 50);
        assert_eq!(&data[data.len() - 6..], &[0, 0, 0, 2, 1, 2]);
    }

    #[test]
    fn test_debug_hides_password() {
        let method = AuthMethod::password(b"hunter2");
        assert_eq!(format!("{:?}", method), "password");
    }
}
