// Input validation utilities

use anyhow::Result;
use regex::Regex;

/// Validate a service identifier before it is interpolated into runtime commands.
///
/// Security: service ids end up as arguments to `docker compose`; only allow the characters
/// compose itself accepts for service names.
pub fn validate_service_id(id: &str) -> Result<()> {
    let s = id.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Service id cannot be empty"));
    }
    if s.len() > 63 {
        return Err(anyhow::anyhow!(
            "Service id '{}' exceeds 63 characters",
            s
        ));
    }

    let ident_re = Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").map_err(|e| {
        anyhow::anyhow!("Internal error: failed to compile service id regex: {}", e)
    })?;
    if !ident_re.is_match(s) {
        return Err(anyhow::anyhow!(
            "Service id '{}' contains invalid characters (allowed: a-z, 0-9, '_', '.', '-')",
            s
        ));
    }
    Ok(())
}

/// Validate the admin email used to bootstrap the identity provider.
pub fn validate_admin_email(email: &str) -> Result<()> {
    let s = email.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Admin email cannot be empty"));
    }
    if s.len() > 254 {
        return Err(anyhow::anyhow!("Admin email cannot exceed 254 characters"));
    }

    let email_re = Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile email regex: {}", e))?;
    if !email_re.is_match(s) {
        return Err(anyhow::anyhow!("Admin email '{}' is not a valid address", s));
    }
    Ok(())
}
