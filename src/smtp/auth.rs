//-
// Copyright (c) 2024, 2025, the mailgate authors
//
// This file is part of mailgate.
//
// mailgate is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// mailgate is distributed in the hope  that it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with mailgate. If not, see <http://www.gnu.org/licenses/>.

//! SASL mechanism registry for the AUTH command.
//!
//! Credential verification itself is delegated to a caller-supplied
//! callback; the registry only knows how to drive the wire exchange of each
//! mechanism.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// An opaque value identifying an authenticated principal.
///
/// Whatever the credential callback returns is carried on the connection
/// and handed back to the delivery callback; the server itself only cares
/// about its presence.
pub type AuthUser = Arc<dyn Any + Send + Sync>;

/// Verifies a `(identity, secret)` pair, returning the authenticated user
/// on success.
pub type CredentialFn =
    Arc<dyn Fn(&str, &str) -> Option<AuthUser> + Send + Sync>;

/// One step of a SASL exchange.
pub enum AuthStep {
    /// Send `334` with the (base64-encoded) challenge and read another line.
    Challenge(String),
    /// Authentication succeeded as the named identity.
    Done(String, AuthUser),
    /// Authentication failed.
    Fail,
}

impl std::fmt::Debug for AuthStep {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            AuthStep::Challenge(ref c) => {
                f.debug_tuple("Challenge").field(c).finish()
            },
            AuthStep::Done(ref identity, _) => {
                f.debug_tuple("Done").field(identity).finish()
            },
            AuthStep::Fail => write!(f, "Fail"),
        }
    }
}

/// A registered SASL mechanism.
pub trait AuthMechanism: Send + Sync {
    /// The fragment advertised after `250-AUTH`.
    fn advertisement(&self) -> &str;

    /// Begins a fresh exchange.
    fn start(&self) -> Box<dyn AuthExchange + Send>;
}

/// The per-command state of one SASL exchange.
pub trait AuthExchange: Send {
    /// Advances the exchange.
    ///
    /// `input` is the latest base64 line from the client, or `None` before
    /// the client has sent anything beyond the AUTH command itself.
    fn advance(&mut self, input: Option<&str>) -> AuthStep;
}

/// Maps mechanism names to handlers.
///
/// An empty registry advertises nothing; installing a registry on the
/// server is what switches the pre-auth verb gate on.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    mechanisms: HashMap<String, Arc<dyn AuthMechanism>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mechanism under `name` (stored uppercase).
    pub fn extend(&mut self, name: &str, mechanism: Arc<dyn AuthMechanism>) {
        self.mechanisms
            .insert(name.to_ascii_uppercase(), mechanism);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthMechanism>> {
        self.mechanisms.get(&name.to_ascii_uppercase()).cloned()
    }

    /// The `AUTH` advertisement fragment, e.g. `LOGIN PLAIN`.
    pub fn advertisement(&self) -> String {
        let mut names: Vec<&str> =
            self.mechanisms.values().map(|m| m.advertisement()).collect();
        names.sort_unstable();
        names.dedup();
        names.join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }
}

impl std::fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("mechanisms", &self.advertisement())
            .finish()
    }
}

/// RFC 4616 PLAIN: a single base64 line of
/// `authorize-id NUL authenticate-id NUL password`.
pub struct AuthPlain {
    auth: CredentialFn,
}

impl AuthPlain {
    pub fn new<F>(auth: F) -> Self
    where
        F: Fn(&str, &str) -> Option<AuthUser> + Send + Sync + 'static,
    {
        AuthPlain {
            auth: Arc::new(auth),
        }
    }
}

impl AuthMechanism for AuthPlain {
    fn advertisement(&self) -> &str {
        "PLAIN"
    }

    fn start(&self) -> Box<dyn AuthExchange + Send> {
        Box::new(PlainExchange {
            auth: Arc::clone(&self.auth),
            challenged: false,
        })
    }
}

struct PlainExchange {
    auth: CredentialFn,
    challenged: bool,
}

impl AuthExchange for PlainExchange {
    fn advance(&mut self, input: Option<&str>) -> AuthStep {
        let Some(input) = input else {
            if self.challenged {
                return AuthStep::Fail;
            }
            self.challenged = true;
            return AuthStep::Challenge(String::new());
        };

        let Some(decoded) = base64::decode(input.trim())
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            return AuthStep::Fail;
        };

        // <authorize-id> is optional when it matches <authenticate-id>
        let mut fields = decoded.split('\0');
        let (Some(authorize), Some(identity), Some(secret), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return AuthStep::Fail;
        };

        if !authorize.is_empty() && authorize != identity {
            return AuthStep::Fail;
        }

        match (self.auth)(identity, secret) {
            Some(user) => AuthStep::Done(identity.to_owned(), user),
            None => AuthStep::Fail,
        }
    }
}

/// The legacy LOGIN mechanism: username and password on separate base64
/// lines.
pub struct AuthLogin {
    auth: CredentialFn,
}

impl AuthLogin {
    pub fn new<F>(auth: F) -> Self
    where
        F: Fn(&str, &str) -> Option<AuthUser> + Send + Sync + 'static,
    {
        AuthLogin {
            auth: Arc::new(auth),
        }
    }
}

impl AuthMechanism for AuthLogin {
    fn advertisement(&self) -> &str {
        "LOGIN"
    }

    fn start(&self) -> Box<dyn AuthExchange + Send> {
        Box::new(LoginExchange {
            auth: Arc::clone(&self.auth),
            username: None,
        })
    }
}

struct LoginExchange {
    auth: CredentialFn,
    username: Option<String>,
}

impl AuthExchange for LoginExchange {
    fn advance(&mut self, input: Option<&str>) -> AuthStep {
        let Some(input) = input else {
            return AuthStep::Challenge("Username:".to_owned());
        };

        let Some(decoded) = base64::decode(input.trim())
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            return AuthStep::Fail;
        };

        match self.username.take() {
            None => {
                self.username = Some(decoded);
                AuthStep::Challenge("Password:".to_owned())
            },
            Some(username) => match (self.auth)(&username, &decoded) {
                Some(user) => AuthStep::Done(username, user),
                None => AuthStep::Fail,
            },
        }
    }
}
