/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of rexec-gate
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The authorization predicate: a pure function over a caller identity, a
//! configured bypass set, and a configured session-proof secret.

use std::collections::HashSet;

use subtle::ConstantTimeEq;

use crate::identity::CallerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AllowBypass,
    AllowSession,
    Deny,
}

/// Read-only after construction; cloned cheaply into every request's
/// handler context.
#[derive(Debug, Clone)]
pub struct AuthorizationPredicate {
    bypass_users: HashSet<String>,
    secret: String,
}

impl AuthorizationPredicate {
    pub fn new(bypass_users: HashSet<String>, secret: String) -> Self {
        AuthorizationPredicate { bypass_users, secret }
    }

    /// Evaluate the predicate. Pure and side-effect free: callers are
    /// responsible for auditing the outcome.
    pub fn evaluate(&self, identity: &CallerIdentity) -> Verdict {
        if let Some(user) = &identity.user {
            if self.bypass_users.contains(user) {
                return Verdict::AllowBypass;
            }
        }

        if let Some(presented) = identity.session_proof() {
            if constant_time_eq(presented.as_bytes(), self.secret.as_bytes()) {
                return Verdict::AllowSession;
            }
        }

        Verdict::Deny
    }
}

/// Constant-time byte comparison to avoid a timing oracle on the secret.
/// Unequal lengths are rejected without leaking which byte differed.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user: &str, proof: Option<&str>) -> CallerIdentity {
        let mut identity = CallerIdentity {
            user: Some(user.to_string()),
            ..Default::default()
        };
        if let Some(proof) = proof {
            identity
                .extra
                .insert("secret-sauce".to_string(), vec![proof.to_string()]);
        }
        identity
    }

    #[test]
    fn bypass_user_allowed_without_proof() {
        let predicate = AuthorizationPredicate::new(
            HashSet::from(["system:admin".to_string()]),
            "s3cr3t".to_string(),
        );
        let verdict = predicate.evaluate(&identity("system:admin", None));
        assert_eq!(verdict, Verdict::AllowBypass);
    }

    #[test]
    fn bypass_precedence_over_wrong_proof() {
        let predicate = AuthorizationPredicate::new(
            HashSet::from(["system:admin".to_string()]),
            "s3cr3t".to_string(),
        );
        let verdict = predicate.evaluate(&identity("system:admin", Some("garbage")));
        assert_eq!(verdict, Verdict::AllowBypass);
    }

    #[test]
    fn correct_session_proof_allowed() {
        let predicate = AuthorizationPredicate::new(HashSet::new(), "s3cr3t".to_string());
        let verdict = predicate.evaluate(&identity("alice", Some("s3cr3t")));
        assert_eq!(verdict, Verdict::AllowSession);
    }

    #[test]
    fn wrong_or_missing_proof_denied() {
        let predicate = AuthorizationPredicate::new(HashSet::new(), "s3cr3t".to_string());
        assert_eq!(
            predicate.evaluate(&identity("eve", Some("wrong"))),
            Verdict::Deny
        );
        assert_eq!(predicate.evaluate(&identity("eve", None)), Verdict::Deny);
    }
}
