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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so the session id
/// shown in log output follows a TLS upgrade even for clones taken earlier.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    session_id: String,
    peer: String,
    helo: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(session_id: String, peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session_id,
                peer,
                helo: None,
                user: None,
            })),
        }
    }

    pub fn set_session_id(&self, session_id: String) {
        self.inner.lock().unwrap().session_id = session_id;
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }

    pub fn clear_user(&self) {
        self.inner.lock().unwrap().user = None;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "smtp:{}[{}", inner.session_id, inner.peer)?;
        if let Some(ref helo) = inner.helo {
            write!(f, " {}", helo)?;
        }
        if let Some(ref user) = inner.user {
            write!(f, " <{}>", user)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_formatting() {
        let prefix = LogPrefix::new("abc123".to_owned(), "10.0.0.1".to_owned());
        assert_eq!("smtp:abc123[10.0.0.1]", prefix.to_string());

        prefix.set_helo("mail.example.com".to_owned());
        prefix.set_user("gir@example.com".to_owned());
        assert_eq!(
            "smtp:abc123[10.0.0.1 mail.example.com <gir@example.com>]",
            prefix.to_string(),
        );

        let clone = prefix.clone();
        prefix.set_session_id("def456".to_owned());
        assert!(clone.to_string().starts_with("smtp:def456["));
    }
}
