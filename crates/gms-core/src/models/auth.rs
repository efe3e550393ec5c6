use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Body of `POST /api/auth/login`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoginResponse {
    #[serde(default)]
    pub token: String,
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub success: bool,
}

impl LoginResponse {
    /// Accept the response only if the backend reported success and the
    /// account carries `required_role`. Returns the rejection message
    /// otherwise, suitable for showing on a login form.
    pub fn into_accepted(self, required_role: Option<&str>) -> Result<Self, String> {
        if !self.success || self.token.is_empty() {
            return Err(self
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Authentication failed".to_string()));
        }
        if let Some(role) = required_role {
            if !self.role.eq_ignore_ascii_case(role) {
                return Err(format!(
                    "Accounts with role '{}' cannot sign in here",
                    self.role
                ));
            }
        }
        Ok(self)
    }
}

/// Body of `POST /api/auth/verify`. Backends that answer with an empty
/// 2xx body are treated as valid.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(success: bool, role: &str) -> LoginResponse {
        LoginResponse {
            token: "a.b.c".to_string(),
            user_id: "u1".to_string(),
            email: "resident@example.com".to_string(),
            role: role.to_string(),
            message: Some("Invalid credentials".to_string()),
            success,
        }
    }

    #[test]
    fn test_parse_login_response() {
        let json = r#"{"token":"a.b.c","userId":"u1","email":"x@y.z","role":"USER","message":"ok","success":true}"#;
        let resp: LoginResponse = serde_json::from_str(json).expect("valid login json");
        assert_eq!(resp.user_id, "u1");
        assert_eq!(resp.role, "USER");
        assert!(resp.success);
    }

    #[test]
    fn test_into_accepted_rejects_failure() {
        let err = response(false, "USER").into_accepted(None).unwrap_err();
        assert_eq!(err, "Invalid credentials");
    }

    #[test]
    fn test_into_accepted_checks_role() {
        assert!(response(true, "USER").into_accepted(Some("USER")).is_ok());
        assert!(response(true, "user").into_accepted(Some("USER")).is_ok());
        assert!(response(true, "ADMIN").into_accepted(Some("USER")).is_err());
        assert!(response(true, "ADMIN").into_accepted(None).is_ok());
    }

    #[test]
    fn test_verify_response_defaults_to_valid() {
        let resp: VerifyResponse = serde_json::from_str("{}").expect("empty object");
        assert!(resp.valid);
        let resp: VerifyResponse = serde_json::from_str(r#"{"valid":false}"#).expect("explicit");
        assert!(!resp.valid);
    }
}
