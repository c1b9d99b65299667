//! Bidirectional mapping between symbolic device/order tokens and the
//! one-byte codes that make up a frame's arbitration address.
//!
//! The definition is a small text document with two namespaces:
//!
//! ```text
//! DeviceID: {
//!     OBU = 01
//!     BRAKE = 02
//! }
//! OrderID: {
//!     start = 23
//! }
//! ```
//!
//! Each namespace must be a bijection; duplicate tokens or codes are rejected
//! at load time. Reverse lookups never fail: an unmapped code decodes to its
//! two-digit hex string.

use crate::error::RegistryError;
use arrayvec::ArrayString;
use core::fmt::Write;
use std::collections::HashMap;

pub const MAX_TOKEN_LEN: usize = 32;

/// Fixed-capacity token used on the frame path.
pub type Token = ArrayString<MAX_TOKEN_LEN>;

/// Definition shipped with the crate.
pub const DEFAULT_DEFINITION: &str = include_str!("../config/can_list.txt");

const DEVICE_SECTION: &str = "DeviceID";
const ORDER_SECTION: &str = "OrderID";

#[derive(Debug, Clone, Default)]
struct Namespace {
    by_token: HashMap<Token, u8>,
    by_code: HashMap<u8, Token>,
}

impl Namespace {
    fn parse(section: &'static str, content: &str) -> Result<Self, RegistryError> {
        let body = section_body(section, content)?;
        let mut namespace = Namespace::default();

        for (index, raw) in body.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (token, value) = line
                .split_once('=')
                .map(|(t, v)| (t.trim(), v.trim()))
                .filter(|(t, v)| !t.is_empty() && !v.is_empty())
                .ok_or(RegistryError::MalformedLine { section, line: index + 1 })?;

            let code = parse_code(token, value)?;
            let key = Token::from(token)
                .map_err(|_| RegistryError::TokenTooLong(token.to_string()))?;

            if namespace.by_token.contains_key(&key) {
                return Err(RegistryError::DuplicateToken {
                    section,
                    token: token.to_string(),
                });
            }
            if let Some(first) = namespace.by_code.get(&code) {
                return Err(RegistryError::DuplicateCode {
                    section,
                    code,
                    first: first.to_string(),
                    second: token.to_string(),
                });
            }

            namespace.by_token.insert(key, code);
            namespace.by_code.insert(code, key);
        }

        Ok(namespace)
    }

    fn code(&self, token: &str) -> Option<u8> {
        self.by_token.get(token).copied()
    }

    fn token(&self, code: u8) -> Option<&str> {
        self.by_code.get(&code).map(|t| t.as_str())
    }

    fn decode(&self, code: u8) -> Token {
        self.by_code.get(&code).copied().unwrap_or_else(|| hex_token(code))
    }

    fn entries(&self) -> impl Iterator<Item = (&str, u8)> {
        self.by_token.iter().map(|(t, c)| (t.as_str(), *c))
    }
}

fn section_body<'a>(section: &'static str, content: &'a str) -> Result<&'a str, RegistryError> {
    let header = alloc::format!("{section}:");
    let start = content
        .find(&header)
        .ok_or(RegistryError::MissingSection(section))?
        + header.len();

    let rest = content[start..].trim_start();
    let rest = rest
        .strip_prefix('{')
        .ok_or(RegistryError::MissingSection(section))?;
    let end = rest
        .find('}')
        .ok_or(RegistryError::UnterminatedSection { section })?;

    Ok(&rest[..end])
}

fn parse_code(token: &str, value: &str) -> Result<u8, RegistryError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    if digits.is_empty() || digits.len() > 2 {
        return Err(RegistryError::InvalidCode {
            token: token.to_string(),
            value: value.to_string(),
        });
    }

    u8::from_str_radix(digits, 16).map_err(|_| RegistryError::InvalidCode {
        token: token.to_string(),
        value: value.to_string(),
    })
}

/// Two-digit lowercase hex rendering of an unmapped code.
pub fn hex_token(code: u8) -> Token {
    let mut token = Token::new();
    // Two hex digits always fit.
    let _ = write!(token, "{code:02x}");
    token
}

#[derive(Debug, Clone)]
pub struct AddressRegistry {
    devices: Namespace,
    orders: Namespace,
}

impl AddressRegistry {
    pub fn parse(definition: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            devices: Namespace::parse(DEVICE_SECTION, definition)?,
            orders: Namespace::parse(ORDER_SECTION, definition)?,
        })
    }

    /// Registry built from the definition embedded in the crate.
    pub fn load_default() -> Result<Self, RegistryError> {
        Self::parse(DEFAULT_DEFINITION)
    }

    pub fn device_code(&self, token: &str) -> Option<u8> {
        self.devices.code(token)
    }

    pub fn order_code(&self, token: &str) -> Option<u8> {
        self.orders.code(token)
    }

    pub fn device_token(&self, code: u8) -> Option<&str> {
        self.devices.token(code)
    }

    pub fn order_token(&self, code: u8) -> Option<&str> {
        self.orders.token(code)
    }

    pub fn decode_device(&self, code: u8) -> Token {
        self.devices.decode(code)
    }

    pub fn decode_order(&self, code: u8) -> Token {
        self.orders.decode(code)
    }

    /// Arbitration address for a token pair, `None` if either is unmapped.
    pub fn address(&self, device: &str, order: &str) -> Option<u16> {
        let device = self.devices.code(device)?;
        let order = self.orders.code(order)?;
        Some(u16::from(device) << 8 | u16::from(order))
    }

    pub fn decode_address(&self, address: u16) -> (Token, Token) {
        let [device, order] = address.to_be_bytes();
        (self.decode_device(device), self.decode_order(order))
    }

    pub fn devices(&self) -> impl Iterator<Item = (&str, u8)> {
        self.devices.entries()
    }

    pub fn orders(&self) -> impl Iterator<Item = (&str, u8)> {
        self.orders.entries()
    }
}
