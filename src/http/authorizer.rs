/*
 * ptio - Event loop, non-blocking sockets and HTTP messaging over mio
 * This is free and unencumbered software released into the public domain.
 */
use std::collections::HashMap;

use parking_lot::Mutex;

use log::{debug, warn};

use crate::http::{parse_basic_credentials, reply, HttpMessage, Reply, Request};

/// Who was let in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub user: String,
}

/// Outcome of [`Authorizer::authorize()`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Access granted, with or without an [`Authorization`] record.
    Granted(Option<Authorization>),
    /// Access denied; the reply has been prepared accordingly.
    Denied,
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Server-side access check for a [`Service`](crate::http::Service)
///
/// Authorizers may be shared between servers running on different threads.
pub trait Authorizer: Send + Sync {
    /// Checks `request`; on denial, sets up `reply` (status and challenge).
    fn authorize(&self, request: &Request, reply: &mut Reply) -> AccessDecision;
}

/// `Basic` authentication against a list of users and passwords
#[derive(Debug)]
pub struct BasicUserListAuthorizer {
    realm: String,
    users: Mutex<HashMap<String, String>>,
}

impl BasicUserListAuthorizer {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_owned(),
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn add_user(&self, user: &str, password: &str) {
        self.users.lock().insert(user.to_owned(), password.to_owned());
    }

    pub fn remove_user(&self, user: &str) -> bool {
        self.users.lock().remove(user).is_some()
    }

    fn deny(&self, reply: &mut Reply) -> AccessDecision {
        reply.set_status(reply::UNAUTHORIZED);
        let challenge = format!("Basic realm=\"{}\"", self.realm.replace('"', "'"));
        if let Err(error) = reply.header_mut().set("WWW-Authenticate", &challenge) {
            warn!("Failed to set challenge: {:?}", error);
        }
        AccessDecision::Denied
    }
}

impl Authorizer for BasicUserListAuthorizer {
    fn authorize(&self, request: &Request, reply: &mut Reply) -> AccessDecision {
        let value = match request.header().get("Authorization") {
            Some(value) => value,
            None => return self.deny(reply),
        };
        let (user, password) = match parse_basic_credentials(value) {
            Ok(credentials) => credentials,
            Err(error) => {
                debug!("Rejected credentials: {}", error);
                return self.deny(reply);
            },
        };
        let granted = self.users.lock().get(&user).map(|expected| *expected == password).unwrap_or(false);
        match granted {
            true => AccessDecision::Granted(None),
            false => {
                debug!("Access denied for user \"{}\"", user);
                self.deny(reply)
            },
        }
    }
}
