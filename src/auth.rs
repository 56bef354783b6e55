use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check for the pgwire startup.
///
/// Every user shares `password`, except the admin user when an
/// `admin_password` is configured.
#[derive(Debug, Clone)]
pub struct CounterbookAuthSource {
    password: String,
    admin_user: String,
    admin_password: Option<String>,
}

impl CounterbookAuthSource {
    pub fn new(password: String, admin_user: String, admin_password: Option<String>) -> Self {
        Self {
            password,
            admin_user,
            admin_password,
        }
    }

    pub fn admin_user(&self) -> &str {
        &self.admin_user
    }

    /// True when anyone holding the shared password can log in as admin.
    pub fn admin_shares_password(&self) -> bool {
        self.admin_password
            .as_deref()
            .is_none_or(|admin| admin == self.password)
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        match (&self.admin_password, user) {
            (Some(admin), Some(user)) if user == self.admin_user => admin,
            _ => &self.password,
        }
    }
}

#[async_trait]
impl AuthSource for CounterbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = self.password_for(login.user());
        Ok(Password::new(None, expected.as_bytes().to_vec()))
    }
}
