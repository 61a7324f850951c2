/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::fmt::{Debug, Formatter};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use log::debug;

use crate::error::{Error, Result};
use crate::http::{HttpMessage, Reply, Request};

/// `Basic <base64(user:password)>`, the value of an `Authorization` field.
pub fn basic_credentials(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

/// Splits an `Authorization: Basic ...` value into user and password.
pub fn parse_basic_credentials(value: &str) -> Result<(String, String)> {
    let (scheme, token) = value.trim().split_once(' ').ok_or_else(|| Error::http("malformed Authorization value"))?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return Err(Error::http(format!("unsupported authorization scheme \"{}\"", scheme)));
    }
    let decoded = STANDARD.decode(token.trim()).map_err(|_| Error::http("invalid Base64 in Basic credentials"))?;
    let text = String::from_utf8(decoded).map_err(|_| Error::http("Basic credentials are not valid UTF-8"))?;
    let (user, password) = text.split_once(':').ok_or_else(|| Error::http("Basic credentials lack a ':' separator"))?;
    Ok((user.to_owned(), password.to_owned()))
}

/// Scheme name of a `WWW-Authenticate` challenge.
fn challenge_scheme(challenge: &str) -> &str {
    challenge.trim().split(' ').next().unwrap_or_default()
}

/// A client-side authentication method
pub trait Authentication {
    /// Scheme name as used in challenges, e.g. `Basic`.
    fn scheme(&self) -> &str;

    /// Adds credentials to `request`.
    fn authorize(&self, request: &mut Request) -> Result<()>;
}

/// User name and password sent with the `Basic` scheme
#[derive(Clone)]
pub struct BasicAuthentication {
    user: String,
    password: String,
}

impl BasicAuthentication {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_owned(),
            password: password.to_owned(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

impl Authentication for BasicAuthentication {
    fn scheme(&self) -> &str {
        "Basic"
    }

    fn authorize(&self, request: &mut Request) -> Result<()> {
        request.header_mut().set("Authorization", &basic_credentials(&self.user, &self.password))
    }
}

impl Debug for BasicAuthentication {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthentication").field("user", &self.user).finish_non_exhaustive()
    }
}

/// Picks a registered [`Authentication`] that answers a server challenge
///
/// After a `401` reply, [`on_challenge()`](Authenticator::on_challenge())
/// selects the first method whose scheme matches the `WWW-Authenticate`
/// scheme (ignoring case); from then on
/// [`authorize()`](Authenticator::authorize()) adds its credentials to every
/// request.
#[derive(Default)]
pub struct Authenticator {
    methods: Vec<Box<dyn Authentication>>,
    active: Option<usize>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: Box<dyn Authentication>) {
        self.methods.push(method);
    }

    /// Returns `true` if a method for one of the challenges of `reply` was
    /// selected.
    pub fn on_challenge(&mut self, reply: &Reply) -> bool {
        let selected = reply
            .header()
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("WWW-Authenticate"))
            .find_map(|(_, challenge)| {
                let scheme = challenge_scheme(challenge);
                self.methods.iter().position(|method| method.scheme().eq_ignore_ascii_case(scheme))
            });
        if let Some(index) = selected {
            debug!("Answering challenge with the {} scheme", self.methods[index].scheme());
        }
        self.active = selected;
        selected.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Adds credentials of the selected method, if any.
    pub fn authorize(&self, request: &mut Request) -> Result<()> {
        match self.active.and_then(|index| self.methods.get(index)) {
            Some(method) => method.authorize(request),
            None => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        self.active = None;
    }
}

impl Debug for Authenticator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let schemes: Vec<&str> = self.methods.iter().map(|method| method.scheme()).collect();
        f.debug_struct("Authenticator").field("schemes", &schemes).field("active", &self.active).finish()
    }
}
