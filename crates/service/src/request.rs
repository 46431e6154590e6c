use base64::{Engine, prelude::BASE64_STANDARD};

/// Requests larger than this are judged as received; NTRIP requests are
/// one line and a handful of headers.
pub const MAX_REQUEST_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    UnterminatedHeaders,
    BadRequestLine,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The minimal HTTP/1.1-shaped request NTRIP 1.0/2.0 clients send.
///
/// Only the request line and the `Authorization` header matter to a
/// caster; everything else is carried but ignored. Input line endings may
/// be `\r\n` or bare `\n`.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> Request<'a> {
    /// Parses a request whose headers are fully received. The blank-line
    /// terminator must be present; a request line without exactly
    /// method, path and version tokens is rejected.
    pub fn parse(text: &'a str) -> Result<Self, Error> {
        let head = match text.find("\r\n\r\n") {
            Some(position) => &text[..position],
            None => match text.find("\n\n") {
                Some(position) => &text[..position],
                None => return Err(Error::UnterminatedHeaders),
            },
        };

        let mut lines = head.lines();
        let mut tokens = lines.next().unwrap_or_default().split_whitespace();
        let (Some(method), Some(path), Some(_version)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(Error::BadRequestLine);
        };

        Ok(Self {
            method,
            path,
            headers: lines
                .filter_map(|line| line.split_once(':'))
                .map(|(name, value)| (name.trim(), value.trim()))
                .collect(),
        })
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }

    /// Decoded `Authorization: Basic` credentials, split on the first
    /// colon. `None` for a missing or malformed header.
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        let encoded = self.header("Authorization")?.strip_prefix("Basic ")?;
        let decoded = String::from_utf8(BASE64_STANDARD.decode(encoded.trim()).ok()?).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}

/// A response head. Responses always use `\r\n` endings regardless of
/// what the client sent.
pub fn response(software: &str, code: u16, message: &str, extra_headers: &str) -> String {
    format!("HTTP/1.1 {code} {message}\r\nServer: {software}\r\n{extra_headers}\r\n")
}
