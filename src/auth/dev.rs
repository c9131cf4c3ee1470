//! Local-development auth provider
//!
//! Presents a plain HTML form collecting email, name, and role, then creates
//! a real user and session. Only reachable in local mode: plain HTTP, or a
//! host matching localhost / 127.* / *.nip.io / *.local. Production hosts
//! refuse it outright.

use crate::config::is_local_host;
use crate::types::{FaztError, Result};

/// Provider tag recorded on users created through the form
pub const DEV_PROVIDER: &str = "dev";

/// Gate: local means no TLS, or a host that is unambiguously a developer
/// machine. TLS with a production host is refused.
pub fn check_local(host: &str, over_tls: bool) -> Result<()> {
    if !over_tls || is_local_host(host) {
        return Ok(());
    }
    Err(FaztError::Forbidden(
        "dev login is only available in local mode".into(),
    ))
}

/// The login form served at /auth/dev/login
pub fn login_form() -> String {
    r#"<!doctype html>
<html>
<head><title>Fazt dev login</title></head>
<body>
  <h1>Dev login</h1>
  <p>Local development only. Creates a real session.</p>
  <form method="post" action="/auth/dev/callback">
    <label>Email <input type="email" name="email" required></label><br>
    <label>Name <input type="text" name="name" required></label><br>
    <label>Role
      <select name="role">
        <option value="user" selected>user</option>
        <option value="admin">admin</option>
        <option value="owner">owner</option>
      </select>
    </label><br>
    <button type="submit">Sign in</button>
  </form>
</body>
</html>"#
        .to_string()
}

/// Parsed dev callback form
#[derive(Debug, PartialEq)]
pub struct DevLogin {
    pub email: String,
    pub name: String,
    pub role: crate::auth::Role,
}

/// Parse the urlencoded callback body
pub fn parse_callback(body: &str) -> Result<DevLogin> {
    let fields: Vec<(String, String)> = serde_urlencoded::from_str(body)
        .map_err(|e| FaztError::Validation(format!("dev callback form: {e}")))?;

    let mut email = None;
    let mut name = None;
    let mut role = crate::auth::Role::User;
    for (k, v) in fields {
        match k.as_str() {
            "email" => email = Some(v),
            "name" => name = Some(v),
            "role" => role = crate::auth::Role::parse(&v)?,
            _ => {}
        }
    }

    let email = email
        .filter(|e| e.contains('@'))
        .ok_or_else(|| FaztError::Validation("email is required".into()))?;
    let name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| FaztError::Validation("name is required".into()))?;

    Ok(DevLogin { email, name, role })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    #[test]
    fn plain_http_always_passes_the_gate() {
        assert!(check_local("localhost:8080", false).is_ok());
        assert!(check_local("myapp.example.com", false).is_ok());
    }

    #[test]
    fn tls_passes_only_for_local_hosts() {
        assert!(check_local("localhost", true).is_ok());
        assert!(check_local("myapp.10-0-0-1.nip.io", true).is_ok());
        assert!(check_local("example.com", true).is_err());
    }

    #[test]
    fn callback_parses_and_validates() {
        let login = parse_callback("email=a%40x.org&name=Alice&role=admin").unwrap();
        assert_eq!(
            login,
            DevLogin {
                email: "a@x.org".into(),
                name: "Alice".into(),
                role: Role::Admin
            }
        );

        assert!(parse_callback("email=notanemail&name=A").is_err());
        assert!(parse_callback("email=a%40x.org&name=A&role=superuser").is_err());
    }
}
