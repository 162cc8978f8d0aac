use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::Caller;

/// Shared-secret password check. Every login uses the same password; identity comes
/// from the login user name.
#[derive(Debug)]
pub struct SlotwiseAuthSource {
    password: String,
}

impl SlotwiseAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotwiseAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        // Reject non-ULID user names before the password exchange.
        if let Err(e) = login.user().map(Ulid::from_string).transpose() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user name must be a ULID: {e}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Resolves a login name to a caller identity.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    admins: HashSet<Ulid>,
}

impl AccessPolicy {
    pub fn new(admins: impl IntoIterator<Item = Ulid>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    pub fn caller_for(&self, login: &str) -> Option<Caller> {
        let user_id = Ulid::from_string(login).ok()?;
        Some(if self.admins.contains(&user_id) {
            Caller::admin(user_id)
        } else {
            Caller::user(user_id)
        })
    }
}
