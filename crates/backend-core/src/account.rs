use crate::{
    error::BackendError,
    types::{PasswordChange, ProfileUpdate, RegistrationForm},
};

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 30;
pub const MIN_PASSWORD_LEN: usize = 6;
pub const DEFAULT_SEARCH_MIN_LENGTH: usize = 2;

pub fn validate_registration(form: &RegistrationForm) -> Result<(), BackendError> {
    validate_username(&form.username)?;
    if !form.email.contains('@') {
        return Err(BackendError::validation(
            "invalid_email",
            "Enter a valid email address",
        ));
    }
    validate_new_password(&form.password, &form.confirm_password)
}

pub fn validate_profile_update(update: &ProfileUpdate) -> Result<(), BackendError> {
    if update.username.is_none() && update.gender.is_none() {
        return Err(BackendError::validation(
            "empty_profile_update",
            "Nothing to update",
        ));
    }
    if let Some(username) = &update.username {
        validate_username(username)?;
    }
    Ok(())
}

pub fn validate_password_change(change: &PasswordChange) -> Result<(), BackendError> {
    if change.old_password.is_empty()
        || change.new_password.is_empty()
        || change.confirm_password.is_empty()
    {
        return Err(BackendError::validation(
            "missing_fields",
            "Fill in all password fields",
        ));
    }
    validate_new_password(&change.new_password, &change.confirm_password)
}

/// Trimmed query, or `None` when it is too short to search.
pub fn normalize_search_query(query: &str, min_length: usize) -> Option<&str> {
    let trimmed = query.trim();
    (trimmed.chars().count() >= min_length.max(1)).then_some(trimmed)
}

fn validate_username(username: &str) -> Result<(), BackendError> {
    let len = username.trim().chars().count();
    if (MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        Ok(())
    } else {
        Err(BackendError::validation(
            "invalid_username",
            format!("Username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} characters"),
        ))
    }
}

fn validate_new_password(password: &str, confirm: &str) -> Result<(), BackendError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(BackendError::validation(
            "password_too_short",
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    if password != confirm {
        return Err(BackendError::validation(
            "password_mismatch",
            "Passwords do not match",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Gender;

    fn form() -> RegistrationForm {
        RegistrationForm {
            username: "olena".into(),
            email: "olena@example.org".into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
            gender: Gender::Female,
        }
    }

    #[test]
    fn accepts_valid_registration() {
        validate_registration(&form()).expect("form should be valid");
    }

    #[test]
    fn reports_first_registration_problem() {
        let cases = [
            (RegistrationForm { username: "ab".into(), ..form() }, "invalid_username"),
            (RegistrationForm { email: "nope".into(), ..form() }, "invalid_email"),
            (
                RegistrationForm {
                    password: "12345".into(),
                    confirm_password: "12345".into(),
                    ..form()
                },
                "password_too_short",
            ),
            (
                RegistrationForm { confirm_password: "secret2".into(), ..form() },
                "password_mismatch",
            ),
        ];

        for (form, code) in cases {
            let err = validate_registration(&form).expect_err("form should be rejected");
            assert_eq!(err.code, code);
        }
    }

    #[test]
    fn password_change_requires_every_field() {
        let err = validate_password_change(&PasswordChange {
            old_password: String::new(),
            new_password: "secret1".into(),
            confirm_password: "secret1".into(),
        })
        .expect_err("missing old password");
        assert_eq!(err.code, "missing_fields");

        validate_password_change(&PasswordChange {
            old_password: "old-secret".into(),
            new_password: "secret1".into(),
            confirm_password: "secret1".into(),
        })
        .expect("valid change");
    }

    #[test]
    fn short_search_queries_are_skipped() {
        assert_eq!(normalize_search_query("  a ", 2), None);
        assert_eq!(normalize_search_query(" ol ", 2), Some("ol"));
    }

    #[test]
    fn profile_update_needs_a_field() {
        assert!(validate_profile_update(&ProfileUpdate::default()).is_err());
        validate_profile_update(&ProfileUpdate {
            username: None,
            gender: Some(Gender::Male),
        })
        .expect("gender-only update");
    }
}
