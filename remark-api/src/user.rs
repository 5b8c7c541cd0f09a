use crate::Error;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub nickname: Option<String>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewUser {
    pub username: String,
    pub nickname: Option<String>,
    pub initial_password_hash: String,
    pub roles: Vec<String>,
}

impl NewUser {
    pub fn new(
        username: String,
        nickname: Option<String>,
        initial_password: String,
        roles: Vec<String>,
    ) -> NewUser {
        NewUser {
            initial_password_hash: bcrypt::hash(initial_password, bcrypt::DEFAULT_COST)
                .expect("failed hashing password"),
            username,
            nickname,
            roles,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_name(&self.username)?;
        if let Some(nickname) = &self.nickname {
            crate::validate_string(nickname)?;
        }
        crate::validate_string(&self.initial_password_hash)?;
        for r in &self.roles {
            crate::validate_name(r)?;
        }
        Ok(())
    }
}

/// Identity of whoever issued the current request
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Caller {
    pub user: Option<UserId>,
    pub roles: Vec<String>,

    /// Role claimed through a request header, only honored if the resolver policy trusts it
    pub role_claim: Option<String>,
}

impl Caller {
    pub fn anonymous() -> Caller {
        Caller::default()
    }

    pub fn user(user: UserId, roles: Vec<String>) -> Caller {
        Caller {
            user: Some(user),
            roles,
            role_claim: None,
        }
    }

    pub fn with_role_claim(mut self, claim: Option<String>) -> Caller {
        self.role_claim = claim;
        self
    }

    pub fn require_user(&self) -> Result<UserId, Error> {
        self.user.ok_or(Error::Unauthenticated)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}
