// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use nix::unistd::{Uid, User};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("unable to find user {0}")]
    NotFound(String),
    #[error("user lookup failed: {0}")]
    Lookup(#[from] nix::Error),
}

/// Resolve a user spec (login name or numeric uid) against the passwd
/// database of the current root. A numeric uid is accepted even without a
/// passwd entry; the gid then defaults to the uid.
pub fn lookup(spec: &str) -> Result<Credential, UserError> {
    if let Ok(uid) = spec.parse::<u32>() {
        let gid = User::from_uid(Uid::from_raw(uid))?
            .map(|user| user.gid.as_raw())
            .unwrap_or(uid);
        return Ok(Credential { uid, gid });
    }
    match User::from_name(spec)? {
        Some(user) => Ok(Credential {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }),
        None => Err(UserError::NotFound(spec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_uid_without_entry_is_accepted() {
        let cred = lookup("54321").unwrap();
        assert_eq!(cred.uid, 54321);
    }

    #[test]
    fn root_resolves_by_name() {
        let cred = lookup("root").unwrap();
        assert_eq!(cred, Credential { uid: 0, gid: 0 });
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            lookup("no-such-user-here"),
            Err(UserError::NotFound(_))
        ));
    }
}
