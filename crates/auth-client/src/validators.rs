//! Client-side input validation.
//!
//! These checks short-circuit locally with a validation error before any
//! network call is made. They are deliberately permissive; the backend has
//! the final word.

use auth_machine::{AuthError, AuthResult};

const MIN_PASSWORD_LENGTH: usize = 3;
const MFA_TICKET_PREFIX: &str = "mfaTotp:";

pub fn validate_email(email: &str) -> AuthResult<()> {
    let trimmed = email.trim();
    let mut parts = trimmed.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    let ok = !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !trimmed.contains(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        Err(AuthError::invalid_email())
    }
}

pub fn validate_password(password: &str) -> AuthResult<()> {
    if password.len() >= MIN_PASSWORD_LENGTH {
        Ok(())
    } else {
        Err(AuthError::invalid_password())
    }
}

/// E.164-ish: a leading `+` followed by 7 to 15 digits.
pub fn validate_phone_number(phone_number: &str) -> AuthResult<()> {
    let digits = match phone_number.strip_prefix('+') {
        Some(rest) => rest,
        None => return Err(AuthError::invalid_phone_number()),
    };
    let ok = (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(AuthError::invalid_phone_number())
    }
}

pub fn validate_mfa_ticket(ticket: &str) -> AuthResult<()> {
    if ticket.starts_with(MFA_TICKET_PREFIX) && ticket.len() > MFA_TICKET_PREFIX.len() {
        Ok(())
    } else {
        Err(AuthError::invalid_mfa_ticket())
    }
}
