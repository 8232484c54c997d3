use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub login_id: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
}

impl User {
    /// Best name to show for this user: nickname, then login id, then email.
    pub fn display_name(&self) -> &str {
        self.nickname
            .as_deref()
            .or(self.login_id.as_deref())
            .or(self.email.as_deref())
            .unwrap_or("(unknown)")
    }
}
